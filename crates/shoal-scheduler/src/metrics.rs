use std::sync::atomic::{AtomicU64, Ordering};

/// Shared metrics for the scheduler, safe for concurrent access.
#[derive(Debug, Default)]
pub struct SharedMetrics {
    /// Total number of reconcile passes.
    pub reconcile_total: AtomicU64,
    /// Passes aborted because the store was unreachable.
    pub reconcile_errors: AtomicU64,
    /// Per-instance failures isolated inside a pass.
    pub instance_errors_total: AtomicU64,
    /// Instances moved to `scheduled`.
    pub placements_total: AtomicU64,
    /// Placement attempts that found no worker.
    pub infeasible_total: AtomicU64,
    /// Guarded writes that lost a race and were retried.
    pub conflicts_total: AtomicU64,
    /// Start and stop commands sent to workers.
    pub commands_dispatched_total: AtomicU64,
    /// Commands that were rejected or timed out.
    pub command_failures_total: AtomicU64,
    /// Stops sent for instances a worker should no longer run.
    pub compensating_stops_total: AtomicU64,
    /// Workers flipped to offline.
    pub workers_offline_total: AtomicU64,
    /// Pending instances created for a replica deficit.
    pub instances_created_total: AtomicU64,
    /// Instances sent to `stopping`/`stopped` for surplus or deletion.
    pub instances_stopped_total: AtomicU64,
    /// Heartbeats accepted.
    pub heartbeats_total: AtomicU64,
}

impl SharedMetrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Prometheus text exposition format.
    pub fn render(&self) -> String {
        let counters: [(&str, &str, &AtomicU64); 13] = [
            ("reconcile_total", "Total reconcile passes.", &self.reconcile_total),
            ("reconcile_errors", "Reconcile passes aborted by store errors.", &self.reconcile_errors),
            ("instance_errors_total", "Per-instance failures isolated inside a pass.", &self.instance_errors_total),
            ("placements_total", "Instances placed onto a worker.", &self.placements_total),
            ("infeasible_total", "Placement attempts with no feasible worker.", &self.infeasible_total),
            ("conflicts_total", "Revision conflicts retried.", &self.conflicts_total),
            ("commands_dispatched_total", "Worker commands dispatched.", &self.commands_dispatched_total),
            ("command_failures_total", "Worker commands rejected or timed out.", &self.command_failures_total),
            ("compensating_stops_total", "Stops issued for superseded instances.", &self.compensating_stops_total),
            ("workers_offline_total", "Workers marked offline.", &self.workers_offline_total),
            ("instances_created_total", "Pending instances created.", &self.instances_created_total),
            ("instances_stopped_total", "Instances stopped for scale-down or deletion.", &self.instances_stopped_total),
            ("heartbeats_total", "Worker heartbeats accepted.", &self.heartbeats_total),
        ];

        let mut body = String::new();
        for (name, help, value) in counters {
            body.push_str(&format!(
                "# HELP shoal_scheduler_{name} {help}\n\
                 # TYPE shoal_scheduler_{name} counter\n\
                 shoal_scheduler_{name} {}\n",
                value.load(Ordering::Relaxed)
            ));
        }
        body
    }
}
