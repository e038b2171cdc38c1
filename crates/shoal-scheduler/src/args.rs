use std::time::Duration;

use clap::{Parser, ValueEnum};

use shoal_common::telemetry::LogFormat;

use shoal_scheduler::config::SchedulerConfig;
use shoal_scheduler::placement::PlacementPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreBackend {
    Etcd,
    /// In-process store; state is lost on restart.
    Memory,
}

#[derive(Debug, Parser)]
#[command(name = "shoal-scheduler", about = "GPU fleet scheduler and reconciler")]
pub struct Args {
    #[arg(long, env = "SHOAL_STORE", value_enum, default_value = "etcd")]
    pub store: StoreBackend,

    #[arg(long, env = "SHOAL_ETCD_ENDPOINT", default_value = "http://127.0.0.1:2379")]
    pub etcd_endpoint: String,

    #[arg(long, env = "SHOAL_LISTEN_ADDR", default_value = "0.0.0.0:18090")]
    pub listen_addr: String,

    #[arg(long, env = "SHOAL_RECONCILE_INTERVAL_SECS", default_value_t = 5)]
    pub reconcile_interval_secs: u64,

    #[arg(long, env = "SHOAL_HEARTBEAT_INTERVAL_SECS", default_value_t = 10)]
    pub heartbeat_interval_secs: u64,

    #[arg(long, env = "SHOAL_COMMAND_TIMEOUT_SECS", default_value_t = 10)]
    pub command_timeout_secs: u64,

    #[arg(long, env = "SHOAL_START_ACK_TIMEOUT_SECS", default_value_t = 30)]
    pub start_ack_timeout_secs: u64,

    #[arg(long, env = "SHOAL_STARTUP_TIMEOUT_SECS", default_value_t = 900)]
    pub startup_timeout_secs: u64,

    #[arg(long, env = "SHOAL_MAX_START_ATTEMPTS", default_value_t = 5)]
    pub max_start_attempts: u32,

    #[arg(long, env = "SHOAL_RETRY_BACKOFF_BASE_SECS", default_value_t = 5)]
    pub retry_backoff_base_secs: u64,

    #[arg(long, env = "SHOAL_RETRY_BACKOFF_CAP_SECS", default_value_t = 300)]
    pub retry_backoff_cap_secs: u64,

    #[arg(long, env = "SHOAL_DISPATCH_CONCURRENCY", default_value_t = 64)]
    pub dispatch_concurrency: usize,

    #[arg(long, env = "SHOAL_PER_WORKER_CONCURRENCY", default_value_t = 4)]
    pub per_worker_concurrency: usize,

    /// "spread" or "binpack".
    #[arg(long, env = "SHOAL_PLACEMENT_POLICY", default_value = "spread")]
    pub placement_policy: PlacementPolicy,

    /// "text" or "json".
    #[arg(long, env = "SHOAL_LOG_FORMAT", default_value = "text")]
    pub log_format: LogFormat,

    #[arg(long, env = "SHOAL_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,

    #[arg(long, env = "SHOAL_OTLP_TOKEN")]
    pub otlp_token: Option<String>,
}

impl Args {
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            reconcile_interval: Duration::from_secs(self.reconcile_interval_secs.max(1)),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs.max(1)),
            command_timeout: Duration::from_secs(self.command_timeout_secs),
            start_ack_timeout: Duration::from_secs(self.start_ack_timeout_secs),
            startup_timeout: Duration::from_secs(self.startup_timeout_secs),
            max_start_attempts: self.max_start_attempts.max(1),
            retry_backoff_base: Duration::from_secs(self.retry_backoff_base_secs),
            retry_backoff_cap: Duration::from_secs(self.retry_backoff_cap_secs),
            dispatch_concurrency: self.dispatch_concurrency,
            per_worker_concurrency: self.per_worker_concurrency,
            placement_policy: self.placement_policy,
        }
    }
}
