use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::backend::BackendKind;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Ascend,
    Apple,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GpuDevice {
    pub index: u32,
    pub vendor: GpuVendor,
    pub memory_total_mb: u64,

    /// Memory in use as observed by the worker (all processes).
    #[serde(default)]
    pub memory_used_mb: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compute_capability: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostResources {
    pub cpu_count: u32,
    pub memory_total_mb: u64,
    pub memory_free_mb: u64,
}

/// Hardware inventory as last reported by the worker itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerInventory {
    #[serde(default)]
    pub gpus: Vec<GpuDevice>,

    /// Missing host resources mean the report is incomplete.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<HostResources>,
}

impl WorkerInventory {
    pub fn gpu(&self, index: u32) -> Option<&GpuDevice> {
        self.gpus.iter().find(|g| g.index == index)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WorkerLiveness {
    Online,
    Offline,
    Unknown,
}

/// A managed GPU machine.
///
/// Stored under `/workers/{worker_id}`. Liveness fields are written only by
/// the liveness tracker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Worker {
    pub worker_id: String,

    /// Base URL of the worker agent, e.g. "http://10.0.0.12:10150".
    pub address: String,

    #[serde(default)]
    pub inventory: WorkerInventory,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Explicit backend allow-list. Empty means "whatever the hardware supports".
    #[serde(default)]
    pub backends: Vec<BackendKind>,

    pub liveness: WorkerLiveness,

    /// 0 when the worker never sent a heartbeat.
    #[serde(default)]
    pub last_heartbeat_ms: u64,

    #[serde(default)]
    pub registered_at_ms: u64,

    #[serde(default)]
    pub liveness_changed_at_ms: u64,
}

impl Worker {
    pub fn is_online(&self) -> bool {
        self.liveness == WorkerLiveness::Online
    }

    /// Every key/value in `selector` must be present on the worker.
    pub fn matches_labels(&self, selector: &BTreeMap<String, String>) -> bool {
        selector
            .iter()
            .all(|(k, v)| self.labels.get(k).is_some_and(|have| have == v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker_with_labels(labels: &[(&str, &str)]) -> Worker {
        Worker {
            worker_id: "w1".to_string(),
            address: "http://127.0.0.1:10150".to_string(),
            inventory: WorkerInventory::default(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            backends: Vec::new(),
            liveness: WorkerLiveness::Online,
            last_heartbeat_ms: 0,
            registered_at_ms: 0,
            liveness_changed_at_ms: 0,
        }
    }

    #[test]
    fn test_matches_labels() {
        let w = worker_with_labels(&[("zone", "a"), ("tier", "gpu")]);

        assert!(w.matches_labels(&BTreeMap::new()));
        assert!(w.matches_labels(&BTreeMap::from([("zone".to_string(), "a".to_string())])));
        assert!(!w.matches_labels(&BTreeMap::from([("zone".to_string(), "b".to_string())])));
        assert!(!w.matches_labels(&BTreeMap::from([("rack".to_string(), "1".to_string())])));
    }

    #[test]
    fn test_inventory_defaults_on_sparse_json() {
        let w: Worker = serde_json::from_str(
            r#"{"worker_id":"w1","address":"http://x","liveness":"unknown"}"#,
        )
        .unwrap();
        assert!(w.inventory.gpus.is_empty());
        assert!(w.inventory.host.is_none());
        assert_eq!(w.liveness, WorkerLiveness::Unknown);
    }
}
