pub mod admin;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod http;
pub mod inventory;
pub mod lifecycle;
pub mod liveness;
pub mod metrics;
pub mod placement;
pub mod reconcile;
pub mod store;
pub mod util;

pub use admin::{AdminService, DeploymentUpdate, InstanceFilter, NewDeployment};
pub use config::SchedulerConfig;
pub use dispatch::{Dispatcher, HttpWorkerClient, WorkerClient};
pub use error::{SchedulerError, StoreError, TransitionError};
pub use placement::{place, Assignment, PlacementDecision, PlacementPolicy};
pub use reconcile::{PassStats, Reconciler};
