use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::worker::{GpuVendor, Worker};

/// Supported serving engines.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Vllm,
    Sglang,
    LlamaBox,
    VoxBox,
    AscendMindie,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown backend '{0}', available: vllm, sglang, llama_box, vox_box, ascend_mindie")]
pub struct UnknownBackend(pub String);

impl BackendKind {
    pub const ALL: [BackendKind; 5] = [
        BackendKind::Vllm,
        BackendKind::Sglang,
        BackendKind::LlamaBox,
        BackendKind::VoxBox,
        BackendKind::AscendMindie,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Vllm => "vllm",
            BackendKind::Sglang => "sglang",
            BackendKind::LlamaBox => "llama_box",
            BackendKind::VoxBox => "vox_box",
            BackendKind::AscendMindie => "ascend_mindie",
        }
    }

    pub fn supports_vendor(&self, vendor: GpuVendor) -> bool {
        match self {
            BackendKind::Vllm | BackendKind::Sglang => {
                matches!(vendor, GpuVendor::Nvidia | GpuVendor::Amd)
            }
            BackendKind::LlamaBox => !matches!(vendor, GpuVendor::Ascend),
            BackendKind::VoxBox => matches!(vendor, GpuVendor::Nvidia),
            BackendKind::AscendMindie => matches!(vendor, GpuVendor::Ascend),
        }
    }

    /// Whether the engine can serve with zero GPUs.
    pub fn supports_cpu_only(&self) -> bool {
        matches!(self, BackendKind::LlamaBox | BackendKind::VoxBox)
    }

    /// Whether one replica may span more than one GPU.
    pub fn supports_multi_gpu(&self) -> bool {
        !matches!(self, BackendKind::VoxBox)
    }

    /// Capability check against a worker: the allow-list (if any) must name
    /// this backend and every GPU on the worker must be drivable by it.
    /// GPU-less workers qualify only for CPU-capable engines.
    pub fn runs_on(&self, worker: &Worker) -> bool {
        if !worker.backends.is_empty() && !worker.backends.contains(self) {
            return false;
        }
        if worker.inventory.gpus.is_empty() {
            return self.supports_cpu_only();
        }
        worker
            .inventory
            .gpus
            .iter()
            .all(|gpu| self.supports_vendor(gpu.vendor))
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = UnknownBackend;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        BackendKind::ALL
            .into_iter()
            .find(|b| b.as_str() == normalized)
            .ok_or_else(|| UnknownBackend(s.to_string()))
    }
}
