use serde::{Deserialize, Serialize};

use crate::deployment::ResourceRequest;

/// Lifecycle of one replica.
///
/// `pending → scheduled → starting → running`, with `error` re-entering
/// `pending` after backoff and `stopping → stopped` on teardown.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Pending,
    Scheduled,
    Starting,
    Running,
    Error,
    Stopping,
    Stopped,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Pending => "pending",
            InstanceState::Scheduled => "scheduled",
            InstanceState::Starting => "starting",
            InstanceState::Running => "running",
            InstanceState::Error => "error",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceState::Stopped)
    }

    /// States that carry a worker + GPU assignment and an allocation.
    pub fn holds_assignment(&self) -> bool {
        matches!(
            self,
            InstanceState::Scheduled
                | InstanceState::Starting
                | InstanceState::Running
                | InstanceState::Stopping
        )
    }

    /// States counted as a live replica of the owning deployment.
    pub fn counts_as_replica(&self) -> bool {
        !matches!(self, InstanceState::Stopping | InstanceState::Stopped)
    }

    pub fn can_transition_to(&self, next: InstanceState) -> bool {
        use InstanceState::*;
        matches!(
            (self, next),
            (Pending, Scheduled)
                | (Pending, Stopped)
                | (Scheduled, Starting)
                | (Scheduled, Error)
                | (Scheduled, Stopped)
                | (Starting, Running)
                | (Starting, Error)
                | (Starting, Stopping)
                | (Running, Error)
                | (Running, Stopping)
                | (Error, Pending)
                | (Error, Stopped)
                | (Stopping, Stopped)
        )
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a pending instance could not be placed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InfeasibleReason {
    /// No online worker satisfies labels, pinning and backend.
    NoMatchingWorker,
    /// Matching workers exist but lack free capacity right now.
    InsufficientCapacity,
    /// The request exceeds the idle capacity of every matching worker.
    Unsatisfiable,
}

impl InfeasibleReason {
    /// Configuration errors will not resolve by waiting for capacity.
    pub fn is_configuration_error(&self) -> bool {
        matches!(self, InfeasibleReason::Unsatisfiable)
    }
}

/// One replica of a deployment.
///
/// Stored under `/instances/{instance_id}`. The store revision of the record
/// is its optimistic version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Instance {
    pub instance_id: String,
    pub deployment_id: String,

    /// `Deployment::uid` of the owner at creation time.
    #[serde(default)]
    pub deployment_uid: String,

    /// Human-readable `{deployment_id}-{ordinal}`.
    pub name: String,

    /// Creation order within the deployment.
    pub ordinal: u64,

    /// Deployment `spec_generation` this replica was created for.
    pub spec_generation: u64,

    /// Request snapshot taken at creation.
    pub resources: ResourceRequest,

    pub state: InstanceState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_indices: Option<Vec<u32>>,

    /// Bumped on every scheduling; stale command results and status reports
    /// carry an older value and are discarded.
    #[serde(default)]
    pub generation: u64,

    /// Failed start/run attempts since the instance last reached `running`.
    #[serde(default)]
    pub restart_count: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,

    /// Retry budget exhausted; the instance stays in `error`.
    #[serde(default)]
    pub persistent_failure: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infeasible: Option<InfeasibleReason>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_dispatched_at_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_acknowledged_at_ms: Option<u64>,

    #[serde(default)]
    pub state_changed_at_ms: u64,

    #[serde(default)]
    pub created_at_ms: u64,

    #[serde(default)]
    pub updated_at_ms: u64,
}

impl Instance {
    pub fn new_pending(
        instance_id: String,
        deployment_id: &str,
        ordinal: u64,
        spec_generation: u64,
        resources: ResourceRequest,
        now_ms: u64,
    ) -> Self {
        Self {
            instance_id,
            deployment_id: deployment_id.to_string(),
            deployment_uid: String::new(),
            name: format!("{deployment_id}-{ordinal}"),
            ordinal,
            spec_generation,
            resources,
            state: InstanceState::Pending,
            worker_id: None,
            gpu_indices: None,
            generation: 0,
            restart_count: 0,
            retry_after_ms: None,
            persistent_failure: false,
            infeasible: None,
            status_message: None,
            last_error: None,
            start_dispatched_at_ms: None,
            start_acknowledged_at_ms: None,
            state_changed_at_ms: now_ms,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        }
    }

    pub fn is_assigned_to(&self, worker_id: &str) -> bool {
        self.worker_id.as_deref() == Some(worker_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_requires_scheduled_path() {
        use InstanceState::*;
        assert!(!Pending.can_transition_to(Running));
        assert!(!Pending.can_transition_to(Starting));
        assert!(Pending.can_transition_to(Scheduled));
        assert!(Scheduled.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
    }

    #[test]
    fn test_stopped_is_terminal() {
        use InstanceState::*;
        for next in [Pending, Scheduled, Starting, Running, Error, Stopping, Stopped] {
            assert!(!Stopped.can_transition_to(next));
        }
        assert!(Stopped.is_terminal());
    }

    #[test]
    fn test_assignment_states() {
        use InstanceState::*;
        assert!(!Pending.holds_assignment());
        assert!(!Error.holds_assignment());
        assert!(Scheduled.holds_assignment());
        assert!(Stopping.holds_assignment());
        assert!(Error.counts_as_replica());
        assert!(!Stopping.counts_as_replica());
    }

    #[test]
    fn test_new_pending_name() {
        let i = Instance::new_pending(
            "id".to_string(),
            "qwen",
            3,
            1,
            ResourceRequest::default(),
            42,
        );
        assert_eq!(i.name, "qwen-3");
        assert_eq!(i.state, InstanceState::Pending);
        assert!(i.worker_id.is_none());
        assert_eq!(i.created_at_ms, 42);
    }
}
