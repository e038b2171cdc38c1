use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::deployment::GpuSharing;

/// Resources held by one instance on one worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Allocation {
    pub instance_id: String,
    #[serde(default)]
    pub gpu_indices: Vec<u32>,
    /// Per assigned GPU.
    #[serde(default)]
    pub gpu_memory_mb: u64,
    #[serde(default)]
    pub host_memory_mb: u64,
    #[serde(default)]
    pub sharing: GpuSharing,
}

/// Allocation ledger of a single worker, keyed by instance id.
///
/// Stored under `/allocations/{worker_id}` and only ever written in the same
/// transaction as the instance it describes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerAllocations {
    pub worker_id: String,
    #[serde(default)]
    pub entries: BTreeMap<String, Allocation>,
}

/// What is claimed on one GPU.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GpuClaim {
    pub memory_mb: u64,
    pub exclusive: bool,
    pub holders: usize,
}

impl WorkerAllocations {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            entries: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, instance_id: &str) -> Option<&Allocation> {
        self.entries.get(instance_id)
    }

    /// Returns false when the instance already holds an entry.
    pub fn insert(&mut self, allocation: Allocation) -> bool {
        if self.entries.contains_key(&allocation.instance_id) {
            return false;
        }
        self.entries.insert(allocation.instance_id.clone(), allocation);
        true
    }

    pub fn remove(&mut self, instance_id: &str) -> Option<Allocation> {
        self.entries.remove(instance_id)
    }

    pub fn gpu_claim(&self, index: u32) -> GpuClaim {
        let mut claim = GpuClaim::default();
        for a in self.entries.values().filter(|a| a.gpu_indices.contains(&index)) {
            claim.memory_mb = claim.memory_mb.saturating_add(a.gpu_memory_mb);
            claim.exclusive |= a.sharing == GpuSharing::Exclusive;
            claim.holders += 1;
        }
        claim
    }

    pub fn host_memory_mb(&self) -> u64 {
        self.entries
            .values()
            .map(|a| a.host_memory_mb)
            .fold(0u64, u64::saturating_add)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alloc(id: &str, gpus: &[u32], mem: u64, sharing: GpuSharing) -> Allocation {
        Allocation {
            instance_id: id.to_string(),
            gpu_indices: gpus.to_vec(),
            gpu_memory_mb: mem,
            host_memory_mb: 1024,
            sharing,
        }
    }

    #[test]
    fn test_gpu_claim_sums_holders() {
        let mut ledger = WorkerAllocations::new("w1");
        assert!(ledger.insert(alloc("a", &[0], 4096, GpuSharing::Shared)));
        assert!(ledger.insert(alloc("b", &[0, 1], 2048, GpuSharing::Shared)));

        let c0 = ledger.gpu_claim(0);
        assert_eq!(c0.memory_mb, 6144);
        assert_eq!(c0.holders, 2);
        assert!(!c0.exclusive);
        assert_eq!(ledger.gpu_claim(1).memory_mb, 2048);
        assert_eq!(ledger.gpu_claim(2), GpuClaim::default());
        assert_eq!(ledger.host_memory_mb(), 2048);
    }

    #[test]
    fn test_insert_rejects_duplicate_instance() {
        let mut ledger = WorkerAllocations::new("w1");
        assert!(ledger.insert(alloc("a", &[0], 4096, GpuSharing::Exclusive)));
        assert!(!ledger.insert(alloc("a", &[1], 4096, GpuSharing::Exclusive)));
        assert!(ledger.gpu_claim(0).exclusive);
        assert_eq!(ledger.remove("a").map(|a| a.gpu_indices), Some(vec![0]));
        assert!(ledger.is_empty());
    }
}
