use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::backend::BackendKind;

/// Desired runtime state for a deployment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DesiredState {
    Running,
    Stopped,
}

/// Where the worker fetches model files from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ModelSource {
    HuggingFace,
    ModelScope,
    Local,
}

/// How a replica claims the GPUs it is placed on.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GpuSharing {
    /// The GPU hosts this replica only.
    #[default]
    Exclusive,
    /// GPU memory is split between replicas that also ask for sharing.
    Shared,
}

/// Resources needed by one replica.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceRequest {
    /// Number of GPUs. 0 means CPU-only.
    #[serde(default)]
    pub gpu_count: u32,

    /// Memory needed on each assigned GPU.
    #[serde(default)]
    pub gpu_memory_mb: u64,

    #[serde(default)]
    pub host_memory_mb: u64,

    #[serde(default)]
    pub sharing: GpuSharing,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<BackendKind>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlacementConstraints {
    /// Worker must carry every listed label.
    #[serde(default)]
    pub label_selector: BTreeMap<String, String>,

    /// Restrict placement to a single worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_pin: Option<String>,

    /// Exact GPU indices on the pinned worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_indices: Option<Vec<u32>>,
}

/// Replacement limits applied when the replica spec changes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdatePolicy {
    /// Replicas allowed above the target while replacing.
    pub max_surge: u32,
    /// Running replicas allowed below the target while replacing.
    pub max_unavailable: u32,
}

impl Default for UpdatePolicy {
    fn default() -> Self {
        Self {
            max_surge: 1,
            max_unavailable: 0,
        }
    }
}

/// Declares how a model should run.
///
/// Stored under `/deployments/{deployment_id}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Deployment {
    /// Immutable identity, `[a-z0-9][a-z0-9-]*`.
    pub deployment_id: String,

    /// Fresh on every creation. A deployment deleted and created again under
    /// the same id gets a new uid, so it never adopts the old replicas.
    #[serde(default)]
    pub uid: String,

    /// e.g. HuggingFace ID "Qwen/Qwen2.5-7B-Instruct".
    pub model_name: String,

    pub model_source: ModelSource,

    pub desired_state: DesiredState,

    #[serde(default = "default_replicas")]
    pub replicas: u32,

    #[serde(default)]
    pub resources: ResourceRequest,

    #[serde(default)]
    pub placement: PlacementConstraints,

    #[serde(default)]
    pub update_policy: UpdatePolicy,

    /// Bumped whenever the replica spec (model, resources, backend) changes.
    /// Replica-count and placement edits leave it untouched.
    #[serde(default)]
    pub spec_generation: u64,

    #[serde(default)]
    pub created_at_ms: u64,

    #[serde(default)]
    pub updated_at_ms: u64,
}

fn default_replicas() -> u32 {
    1
}

impl Deployment {
    /// Replica target after applying `desired_state`.
    pub fn target_replicas(&self) -> u32 {
        match self.desired_state {
            DesiredState::Running => self.replicas,
            DesiredState::Stopped => 0,
        }
    }
}
