use std::time::Duration;

use crate::placement::PlacementPolicy;

/// Runtime knobs of the scheduler, independent of how they were supplied.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub reconcile_interval: Duration,
    /// Expected spacing of worker heartbeats. Two missed intervals mark a
    /// worker offline.
    pub heartbeat_interval: Duration,
    /// Bound on a single worker RPC.
    pub command_timeout: Duration,
    /// A dispatched start must be acknowledged within this window.
    pub start_ack_timeout: Duration,
    /// An acknowledged start must report running within this window.
    pub startup_timeout: Duration,
    pub max_start_attempts: u32,
    pub retry_backoff_base: Duration,
    pub retry_backoff_cap: Duration,
    pub dispatch_concurrency: usize,
    pub per_worker_concurrency: usize,
    pub placement_policy: PlacementPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(10),
            command_timeout: Duration::from_secs(10),
            start_ack_timeout: Duration::from_secs(30),
            // Large-model cold starts (download + compile + graph capture)
            // can take many minutes.
            startup_timeout: Duration::from_secs(900),
            max_start_attempts: 5,
            retry_backoff_base: Duration::from_secs(5),
            retry_backoff_cap: Duration::from_secs(300),
            dispatch_concurrency: 64,
            per_worker_concurrency: 4,
            placement_policy: PlacementPolicy::Spread,
        }
    }
}

impl SchedulerConfig {
    /// Backoff before the `attempt`-th retry (1-based): base·2^(attempt-1), capped.
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        self.retry_backoff_base
            .saturating_mul(1u32 << shift)
            .min(self.retry_backoff_cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_backoff_doubles_and_caps() {
        let cfg = SchedulerConfig {
            retry_backoff_base: Duration::from_secs(2),
            retry_backoff_cap: Duration::from_secs(10),
            ..Default::default()
        };
        assert_eq!(cfg.retry_backoff(1), Duration::from_secs(2));
        assert_eq!(cfg.retry_backoff(2), Duration::from_secs(4));
        assert_eq!(cfg.retry_backoff(3), Duration::from_secs(8));
        assert_eq!(cfg.retry_backoff(4), Duration::from_secs(10));
        assert_eq!(cfg.retry_backoff(60), Duration::from_secs(10));
    }
}
