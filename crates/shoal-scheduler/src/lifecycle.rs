//! Instance state machine.
//!
//! Every transition is a guarded write: the instance record is compared at
//! the revision it was read, and whenever an assignment is taken or given
//! back the worker's allocation ledger is guarded and rewritten in the same
//! transaction. Lost races are re-read and re-decided.

use std::sync::Arc;

use tracing::{debug, info, warn};

use shoal_common::{
    Allocation, InfeasibleReason, Instance, InstanceState, InstanceStatusReport, ReportedStatus, StartOutcome,
    StopOutcome, WorkerAllocations,
};
use shoal_meta::MetaTxn;

use crate::config::SchedulerConfig;
use crate::error::{SchedulerError, StoreError, TransitionError};
use crate::metrics::SharedMetrics;
use crate::placement::Assignment;
use crate::store::{encode, keys, EntityStore, Versioned};

const MAX_CONFLICT_RETRIES: usize = 5;

/// A stop that must reach a worker still running something it should not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompensatingStop {
    pub worker_id: String,
    pub instance_id: String,
    pub generation: u64,
}

#[derive(Clone)]
pub struct LifecycleController {
    store: EntityStore,
    config: Arc<SchedulerConfig>,
    metrics: Arc<SharedMetrics>,
}

/// How a failure counts against the retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Failure {
    /// Start or run failure of the instance itself.
    Attempt,
    /// The hosting worker disappeared; retried right away.
    WorkerLost,
}

impl LifecycleController {
    pub fn new(store: EntityStore, config: Arc<SchedulerConfig>, metrics: Arc<SharedMetrics>) -> Self {
        Self {
            store,
            config,
            metrics,
        }
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    fn enter_error(&self, inst: &Instance, reason: String, kind: Failure, now: u64) -> Instance {
        let mut next = inst.clone();
        next.state = InstanceState::Error;
        next.status_message = Some(reason.clone());
        next.last_error = Some(reason);
        match kind {
            Failure::Attempt => {
                next.restart_count = next.restart_count.saturating_add(1);
                if next.restart_count >= self.config.max_start_attempts {
                    next.persistent_failure = true;
                    next.retry_after_ms = None;
                } else {
                    let backoff = self.config.retry_backoff(next.restart_count);
                    next.retry_after_ms = Some(now.saturating_add(backoff.as_millis() as u64));
                }
            }
            Failure::WorkerLost => {
                next.retry_after_ms = Some(now);
            }
        }
        next
    }

    /// Writes `next` over `current`, releasing the allocation when the new
    /// state no longer holds one.
    async fn write(&self, current: &Versioned<Instance>, mut next: Instance, now: u64) -> Result<Instance, SchedulerError> {
        let prev = &current.value;
        if prev.state != next.state {
            let illegal = !prev.state.can_transition_to(next.state)
                || (!prev.state.holds_assignment() && next.state.holds_assignment());
            if illegal {
                return Err(TransitionError {
                    instance_id: prev.instance_id.clone(),
                    from: prev.state,
                    to: next.state,
                }
                .into());
            }
            next.state_changed_at_ms = now;
        }
        next.updated_at_ms = now;

        let release = prev.state.holds_assignment() && !next.state.holds_assignment();
        if !next.state.holds_assignment() {
            next.worker_id = None;
            next.gpu_indices = None;
        }

        let key = keys::instance(&prev.instance_id);
        let mut txn = MetaTxn::new()
            .guard(key.clone(), current.revision)
            .put(key, encode(&next)?);

        if release {
            if let Some(worker_id) = &prev.worker_id {
                let ledger = self.store.get_allocations(worker_id).await?;
                let mut entries = ledger.value;
                if entries.remove(&prev.instance_id).is_some() {
                    let akey = keys::allocations(worker_id);
                    txn = txn.guard(akey.clone(), ledger.revision).put(akey, encode(&entries)?);
                }
            }
        }

        self.store.commit(txn).await?;
        if prev.state != next.state {
            debug!(
                instance_id=%next.instance_id,
                from=%prev.state,
                to=%next.state,
                released=release,
                "instance transition"
            );
        }
        Ok(next)
    }

    /// Re-reads the instance, lets `decide` compute the next version, and
    /// writes it. `decide` returning `None` means nothing to do.
    async fn mutate<F>(&self, instance_id: &str, now: u64, mut decide: F) -> Result<Option<Instance>, SchedulerError>
    where
        F: FnMut(&Instance) -> Option<Instance>,
    {
        for _ in 0..MAX_CONFLICT_RETRIES {
            let Some(current) = self.store.get_instance(instance_id).await? else {
                return Ok(None);
            };
            let Some(next) = decide(&current.value) else {
                return Ok(None);
            };
            match self.write(&current, next, now).await {
                Ok(written) => return Ok(Some(written)),
                Err(SchedulerError::Store(StoreError::Conflict(_))) => {
                    SharedMetrics::incr(&self.metrics.conflicts_total);
                }
                Err(e) => return Err(e),
            }
        }
        Err(SchedulerError::Contended(keys::instance(instance_id)))
    }

    /// `pending → scheduled`: commits the assignment and the ledger entry
    /// together. A conflict is returned to the caller, who re-reads and
    /// re-places.
    pub async fn commit_placement(
        &self,
        instance: &Versioned<Instance>,
        ledger: &Versioned<WorkerAllocations>,
        assignment: &Assignment,
        now: u64,
    ) -> Result<(Versioned<Instance>, Versioned<WorkerAllocations>), SchedulerError> {
        let prev = &instance.value;
        if prev.state != InstanceState::Pending {
            return Err(TransitionError {
                instance_id: prev.instance_id.clone(),
                from: prev.state,
                to: InstanceState::Scheduled,
            }
            .into());
        }

        let mut next = prev.clone();
        next.state = InstanceState::Scheduled;
        next.worker_id = Some(assignment.worker_id.clone());
        next.gpu_indices = Some(assignment.gpu_indices.clone());
        next.generation = prev.generation.saturating_add(1);
        next.infeasible = None;
        next.status_message = None;
        next.start_dispatched_at_ms = None;
        next.start_acknowledged_at_ms = None;
        next.state_changed_at_ms = now;
        next.updated_at_ms = now;

        let mut entries = ledger.value.clone();
        entries.remove(&prev.instance_id);
        entries.insert(Allocation {
            instance_id: prev.instance_id.clone(),
            gpu_indices: assignment.gpu_indices.clone(),
            gpu_memory_mb: prev.resources.gpu_memory_mb,
            host_memory_mb: prev.resources.host_memory_mb,
            sharing: prev.resources.sharing,
        });

        let ikey = keys::instance(&prev.instance_id);
        let akey = keys::allocations(&assignment.worker_id);
        let txn = MetaTxn::new()
            .guard(ikey.clone(), instance.revision)
            .guard(akey.clone(), ledger.revision)
            .put(ikey, encode(&next)?)
            .put(akey, encode(&entries)?);
        let rev = self.store.commit(txn).await?;

        info!(
            instance_id=%next.instance_id,
            worker_id=%assignment.worker_id,
            gpus=?assignment.gpu_indices,
            generation=next.generation,
            "instance scheduled"
        );
        Ok((Versioned::new(next, rev), Versioned::new(entries, rev)))
    }

    /// Records why a pending instance could not be placed. Skips the write
    /// when the reason is unchanged; a lost race is left for the next pass.
    pub async fn record_infeasible(
        &self,
        instance: &Versioned<Instance>,
        reason: InfeasibleReason,
        now: u64,
    ) -> Result<(), SchedulerError> {
        if instance.value.infeasible == Some(reason) || instance.value.state != InstanceState::Pending {
            return Ok(());
        }
        let mut next = instance.value.clone();
        next.infeasible = Some(reason);
        next.status_message = Some(format!("unschedulable: {}", infeasible_message(reason)));
        match self.write(instance, next, now).await {
            Ok(_) => Ok(()),
            Err(SchedulerError::Store(StoreError::Conflict(_))) => {
                SharedMetrics::incr(&self.metrics.conflicts_total);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// `scheduled → starting`, right before the start command leaves.
    pub async fn mark_starting(&self, instance_id: &str, generation: u64, now: u64) -> Result<Option<Instance>, SchedulerError> {
        self.mutate(instance_id, now, |inst| {
            if inst.state != InstanceState::Scheduled || inst.generation != generation {
                return None;
            }
            let mut next = inst.clone();
            next.state = InstanceState::Starting;
            next.start_dispatched_at_ms = Some(now);
            next.status_message = Some("start dispatched".to_string());
            Some(next)
        })
        .await
    }

    /// Applies the worker's answer to a start command. Results for another
    /// generation or worker are ignored; an accepted or timed-out start that
    /// turned out to be superseded is answered with a compensating stop.
    pub async fn apply_start_result(
        &self,
        instance_id: &str,
        worker_id: &str,
        generation: u64,
        outcome: &StartOutcome,
        now: u64,
    ) -> Result<Option<CompensatingStop>, SchedulerError> {
        let applied = self
            .mutate(instance_id, now, |inst| {
                if inst.state != InstanceState::Starting
                    || inst.generation != generation
                    || !inst.is_assigned_to(worker_id)
                {
                    return None;
                }
                match outcome {
                    StartOutcome::Accepted => {
                        if inst.start_acknowledged_at_ms.is_some() {
                            return None;
                        }
                        let mut next = inst.clone();
                        next.start_acknowledged_at_ms = Some(now);
                        next.status_message = Some("start acknowledged".to_string());
                        Some(next)
                    }
                    StartOutcome::Rejected(msg) => Some(self.enter_error(
                        inst,
                        format!("start rejected by worker: {msg}"),
                        Failure::Attempt,
                        now,
                    )),
                    StartOutcome::Timeout => Some(self.enter_error(
                        inst,
                        "start command timed out".to_string(),
                        Failure::Attempt,
                        now,
                    )),
                }
            })
            .await?;

        if let Some(inst) = &applied {
            if inst.state == InstanceState::Error {
                warn!(instance_id, worker_id, generation, error=?inst.last_error, "start failed");
            }
            return Ok(None);
        }
        // A rejected start left nothing behind. An accepted or timed-out one
        // may have launched a process the control plane no longer wants.
        if matches!(outcome, StartOutcome::Rejected(_)) {
            return Ok(None);
        }
        if self.is_current(instance_id, worker_id, generation).await? {
            return Ok(None);
        }
        info!(instance_id, worker_id, generation, outcome=?outcome, "late start result for superseded instance");
        Ok(Some(CompensatingStop {
            worker_id: worker_id.to_string(),
            instance_id: instance_id.to_string(),
            generation,
        }))
    }

    /// Whether the control plane still wants `generation` of the instance on
    /// `worker_id`.
    async fn is_current(&self, instance_id: &str, worker_id: &str, generation: u64) -> Result<bool, SchedulerError> {
        Ok(self
            .store
            .get_instance(instance_id)
            .await?
            .is_some_and(|v| {
                v.value.generation == generation
                    && v.value.is_assigned_to(worker_id)
                    && v.value.state.holds_assignment()
            }))
    }

    pub async fn apply_stop_result(
        &self,
        instance_id: &str,
        worker_id: &str,
        generation: u64,
        outcome: &StopOutcome,
        now: u64,
    ) -> Result<Option<Instance>, SchedulerError> {
        if *outcome == StopOutcome::Timeout {
            // Still stopping; dispatched again next pass.
            return Ok(None);
        }
        self.mutate(instance_id, now, |inst| {
            if inst.state != InstanceState::Stopping
                || inst.generation != generation
                || !inst.is_assigned_to(worker_id)
            {
                return None;
            }
            let mut next = inst.clone();
            next.state = InstanceState::Stopped;
            next.status_message = Some("stopped".to_string());
            Some(next)
        })
        .await
    }

    /// Interprets one per-instance entry of a heartbeat.
    pub async fn apply_status_report(
        &self,
        worker_id: &str,
        report: &InstanceStatusReport,
        now: u64,
    ) -> Result<Option<CompensatingStop>, SchedulerError> {
        let reported_active = matches!(report.status, ReportedStatus::Starting | ReportedStatus::Running);
        let orphan = CompensatingStop {
            worker_id: worker_id.to_string(),
            instance_id: report.instance_id.clone(),
            generation: report.generation,
        };

        let Some(current) = self.store.get_instance(&report.instance_id).await? else {
            return Ok(reported_active.then_some(orphan));
        };
        let inst = &current.value;
        if !inst.is_assigned_to(worker_id)
            || inst.generation != report.generation
            || !inst.state.holds_assignment()
        {
            return Ok(reported_active.then_some(orphan));
        }

        self.mutate(&report.instance_id, now, |inst| {
            if !inst.is_assigned_to(worker_id) || inst.generation != report.generation {
                return None;
            }
            let detail = report.message.clone();
            let mut next = inst.clone();
            match (inst.state, report.status) {
                (InstanceState::Starting, ReportedStatus::Starting) => {
                    if inst.start_acknowledged_at_ms.is_some() {
                        return None;
                    }
                    next.start_acknowledged_at_ms = Some(now);
                    next.status_message = detail.or_else(|| Some("starting".to_string()));
                    Some(next)
                }
                (InstanceState::Starting, ReportedStatus::Running) => {
                    next.state = InstanceState::Running;
                    next.start_acknowledged_at_ms.get_or_insert(now);
                    next.restart_count = 0;
                    next.status_message = detail.or_else(|| Some("running".to_string()));
                    Some(next)
                }
                (InstanceState::Running, ReportedStatus::Running) => {
                    if detail.is_none() || detail == inst.status_message {
                        return None;
                    }
                    next.status_message = detail;
                    Some(next)
                }
                (InstanceState::Starting | InstanceState::Running, ReportedStatus::Failed) => Some(self.enter_error(
                    inst,
                    detail.unwrap_or_else(|| "instance failed".to_string()),
                    Failure::Attempt,
                    now,
                )),
                (InstanceState::Starting | InstanceState::Running, ReportedStatus::Stopped) => Some(self.enter_error(
                    inst,
                    detail.unwrap_or_else(|| "instance exited unexpectedly".to_string()),
                    Failure::Attempt,
                    now,
                )),
                (InstanceState::Stopping, ReportedStatus::Stopped | ReportedStatus::Failed) => {
                    next.state = InstanceState::Stopped;
                    next.status_message = Some("stopped".to_string());
                    Some(next)
                }
                _ => None,
            }
        })
        .await?;
        Ok(None)
    }

    /// Scale-down or deletion. Instances with nothing running on a worker
    /// stop immediately; the rest go through `stopping`.
    pub async fn request_stop(&self, instance_id: &str, now: u64) -> Result<Option<Instance>, SchedulerError> {
        self.mutate(instance_id, now, |inst| {
            let mut next = inst.clone();
            next.state = match inst.state {
                InstanceState::Pending | InstanceState::Scheduled | InstanceState::Error => InstanceState::Stopped,
                InstanceState::Starting | InstanceState::Running => InstanceState::Stopping,
                InstanceState::Stopping | InstanceState::Stopped => return None,
            };
            next.status_message = Some("stop requested".to_string());
            Some(next)
        })
        .await
    }

    /// Worker went offline: whatever it hosted is gone. Idempotent; an
    /// instance already moved elsewhere is left alone.
    pub async fn fail_for_worker_loss(&self, instance_id: &str, worker_id: &str, now: u64) -> Result<Option<Instance>, SchedulerError> {
        self.mutate(instance_id, now, |inst| {
            if !inst.is_assigned_to(worker_id) {
                return None;
            }
            match inst.state {
                InstanceState::Scheduled | InstanceState::Starting | InstanceState::Running => Some(self.enter_error(
                    inst,
                    format!("worker {worker_id} offline"),
                    Failure::WorkerLost,
                    now,
                )),
                InstanceState::Stopping => {
                    let mut next = inst.clone();
                    next.state = InstanceState::Stopped;
                    next.status_message = Some(format!("worker {worker_id} offline while stopping"));
                    Some(next)
                }
                _ => None,
            }
        })
        .await
    }

    /// Why a `starting` instance has waited too long, if it has.
    pub fn start_timeout(&self, inst: &Instance, now: u64) -> Option<String> {
        if inst.state != InstanceState::Starting {
            return None;
        }
        match (inst.start_acknowledged_at_ms, inst.start_dispatched_at_ms) {
            (None, Some(sent)) if now.saturating_sub(sent) >= self.config.start_ack_timeout.as_millis() as u64 => {
                Some("start not acknowledged in time".to_string())
            }
            (Some(acked), _) if now.saturating_sub(acked) >= self.config.startup_timeout.as_millis() as u64 => {
                Some("instance did not become ready before the startup timeout".to_string())
            }
            _ => None,
        }
    }

    pub async fn time_out(&self, instance_id: &str, generation: u64, reason: &str, now: u64) -> Result<Option<Instance>, SchedulerError> {
        self.mutate(instance_id, now, |inst| {
            if inst.state != InstanceState::Starting || inst.generation != generation {
                return None;
            }
            Some(self.enter_error(inst, reason.to_string(), Failure::Attempt, now))
        })
        .await
    }

    /// `error → pending` once the backoff has elapsed.
    pub async fn retry(&self, instance_id: &str, now: u64) -> Result<Option<Instance>, SchedulerError> {
        self.mutate(instance_id, now, |inst| {
            let due = inst.retry_after_ms.map_or(true, |t| t <= now);
            if inst.state != InstanceState::Error || inst.persistent_failure || !due {
                return None;
            }
            let mut next = inst.clone();
            next.state = InstanceState::Pending;
            next.retry_after_ms = None;
            next.infeasible = None;
            next.status_message = Some(format!("retrying after {} failed attempt(s)", inst.restart_count));
            Some(next)
        })
        .await
    }

    /// Deletes a `stopped` record.
    pub async fn remove_stopped(&self, instance: &Versioned<Instance>) -> Result<(), SchedulerError> {
        if instance.value.state != InstanceState::Stopped {
            return Ok(());
        }
        let key = keys::instance(&instance.value.instance_id);
        let txn = MetaTxn::new().guard(key.clone(), instance.revision).delete(key);
        match self.store.commit(txn).await {
            Ok(_) => Ok(()),
            Err(StoreError::Conflict(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

pub fn infeasible_message(reason: InfeasibleReason) -> &'static str {
    match reason {
        InfeasibleReason::NoMatchingWorker => "no online worker matches the placement constraints",
        InfeasibleReason::InsufficientCapacity => "matching workers lack free capacity",
        InfeasibleReason::Unsatisfiable => "request exceeds the idle capacity of every matching worker",
    }
}
