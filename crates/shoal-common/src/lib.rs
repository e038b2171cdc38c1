pub mod allocation;
pub mod backend;
pub mod command;
pub mod deployment;
pub mod heartbeat;
pub mod instance;
pub mod worker;

pub use allocation::{Allocation, GpuClaim, WorkerAllocations};
pub use backend::{BackendKind, UnknownBackend};
pub use command::{CommandReply, StartInstanceCommand, StartOutcome, StopInstanceCommand, StopOutcome};
pub use deployment::{
    Deployment, DesiredState, GpuSharing, ModelSource, PlacementConstraints, ResourceRequest,
    UpdatePolicy,
};
pub use heartbeat::{HeartbeatReport, InstanceStatusReport, ReportedStatus};
pub use instance::{InfeasibleReason, Instance, InstanceState};
pub use worker::{GpuDevice, GpuVendor, HostResources, Worker, WorkerInventory, WorkerLiveness};

pub mod telemetry;
