use serde::{Deserialize, Serialize};

use crate::deployment::{ModelSource, ResourceRequest};

/// Body of `POST {worker}/v1/instances/start`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StartInstanceCommand {
    pub instance_id: String,
    pub generation: u64,
    pub deployment_id: String,
    pub model_name: String,
    pub model_source: ModelSource,
    pub resources: ResourceRequest,
    pub gpu_indices: Vec<u32>,
}

/// Body of `POST {worker}/v1/instances/stop`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StopInstanceCommand {
    pub instance_id: String,
    pub generation: u64,
}

/// Worker reply to a command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandReply {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Outcome of a start command as seen by the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Accepted,
    Rejected(String),
    Timeout,
}

/// Outcome of a stop command. Stops are idempotent on the worker, so a
/// rejection is treated like a timeout and retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    Accepted,
    Timeout,
}
