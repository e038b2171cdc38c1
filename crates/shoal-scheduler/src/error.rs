use shoal_common::InstanceState;
use thiserror::Error;

/// Failures talking to the entity store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend: {0}")]
    Backend(#[from] anyhow::Error),

    /// A guarded write lost against a concurrent writer. Callers re-read and
    /// retry; this never reaches users.
    #[error("revision conflict on {0}")]
    Conflict(String),

    #[error("decode {key}: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("encode: {0}")]
    Encode(#[source] serde_json::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("instance {instance_id}: illegal transition {from} -> {to}")]
pub struct TransitionError {
    pub instance_id: String,
    pub from: InstanceState,
    pub to: InstanceState,
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} already exists: {id}")]
    AlreadyExists { kind: &'static str, id: String },

    #[error("invalid deployment: {0}")]
    InvalidDeployment(String),

    #[error("gave up on {0} after repeated revision conflicts")]
    Contended(String),
}

impl SchedulerError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        SchedulerError::NotFound { kind, id: id.into() }
    }
}
