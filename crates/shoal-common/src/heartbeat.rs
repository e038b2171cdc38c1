use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::backend::BackendKind;
use crate::worker::WorkerInventory;

/// Status a worker observes for one of its local instances.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReportedStatus {
    Starting,
    Running,
    Failed,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceStatusReport {
    pub instance_id: String,
    /// Generation from the start command the worker is running.
    pub generation: u64,
    pub status: ReportedStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Periodic report pushed by a worker agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeartbeatReport {
    pub worker_id: String,
    pub address: String,

    /// Worker clock; informational only; liveness uses receive time.
    #[serde(default)]
    pub timestamp_ms: u64,

    #[serde(default)]
    pub inventory: WorkerInventory,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub backends: Vec<BackendKind>,

    #[serde(default)]
    pub instances: Vec<InstanceStatusReport>,
}
