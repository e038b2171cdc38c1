use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use shoal_common::{
    Deployment, HeartbeatReport, Instance, InstanceState, PlacementConstraints, Worker,
};
use shoal_meta::{WatchEvent, WatchStream};

use crate::config::SchedulerConfig;
use crate::dispatch::{Dispatcher, WorkerClient};
use crate::error::{SchedulerError, StoreError};
use crate::inventory::InventorySnapshot;
use crate::lifecycle::LifecycleController;
use crate::liveness::{LivenessEvent, LivenessTracker};
use crate::metrics::SharedMetrics;
use crate::placement::{place, PlacementDecision};
use crate::store::{keys, EntityStore, Versioned};
use crate::util::now_ms;

/// Placement attempts per instance per pass when commits keep conflicting.
const MAX_PLACEMENT_ATTEMPTS: usize = 3;

/// What one pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassStats {
    pub workers_lost: usize,
    pub instances_failed: usize,
    pub instances_created: usize,
    pub instances_stopped: usize,
    pub instances_retried: usize,
    pub instances_scheduled: usize,
    pub instances_infeasible: usize,
    pub commands_dispatched: usize,
    pub instances_collected: usize,
    pub errors: usize,
}

impl PassStats {
    fn is_quiet(&self) -> bool {
        PassStats {
            instances_infeasible: 0,
            ..self.clone()
        } == PassStats::default()
    }
}

/// Drives actual state toward the declared deployments.
pub struct Reconciler {
    store: EntityStore,
    lifecycle: LifecycleController,
    dispatcher: Arc<Dispatcher>,
    liveness: LivenessTracker,
    config: Arc<SchedulerConfig>,
    metrics: Arc<SharedMetrics>,
}

/// Least progressed first, then most recently created first.
fn surplus_order(instances: &mut [&Instance]) {
    fn progress(state: InstanceState) -> u8 {
        match state {
            InstanceState::Pending | InstanceState::Error => 0,
            InstanceState::Scheduled => 1,
            InstanceState::Starting => 2,
            InstanceState::Running => 3,
            InstanceState::Stopping | InstanceState::Stopped => 4,
        }
    }
    instances.sort_by(|a, b| {
        progress(a.state)
            .cmp(&progress(b.state))
            .then(b.created_at_ms.cmp(&a.created_at_ms))
            .then(b.ordinal.cmp(&a.ordinal))
    });
}

/// Replica changes for one deployment, decided from a snapshot.
#[derive(Debug, Default, PartialEq, Eq)]
struct ReplicaPlan {
    create: usize,
    stop: Vec<String>,
}

fn plan_replicas(dep: &Deployment, owned: &[&Instance]) -> ReplicaPlan {
    let target = dep.target_replicas() as usize;
    let live: Vec<&Instance> = owned
        .iter()
        .copied()
        .filter(|i| i.state.counts_as_replica())
        .collect();
    let (current, outdated): (Vec<&Instance>, Vec<&Instance>) = live
        .iter()
        .copied()
        .partition(|i| i.spec_generation == dep.spec_generation);

    let mut plan = ReplicaPlan::default();
    if outdated.is_empty() {
        if live.len() < target {
            plan.create = target - live.len();
        } else if live.len() > target {
            let mut surplus = live;
            surplus_order(&mut surplus);
            plan.stop = surplus
                .into_iter()
                .take(current.len() - target)
                .map(|i| i.instance_id.clone())
                .collect();
        }
        return plan;
    }

    // Rolling replacement of replicas created for an older spec.
    let surge = dep.update_policy.max_surge as usize;
    let max_unavailable = dep.update_policy.max_unavailable as usize;

    let wanted = target.saturating_sub(current.len());
    let room = (target + surge).saturating_sub(live.len());
    plan.create = wanted.min(room);

    let (mut old_running, old_idle): (Vec<&Instance>, Vec<&Instance>) = outdated
        .iter()
        .copied()
        .partition(|i| i.state == InstanceState::Running);
    plan.stop.extend(old_idle.iter().map(|i| i.instance_id.clone()));

    let new_ready = current
        .iter()
        .filter(|i| i.state == InstanceState::Running)
        .count();
    let available = old_running.len() + new_ready;
    let min_available = target.saturating_sub(max_unavailable);
    let budget = available.saturating_sub(min_available).min(old_running.len());
    surplus_order(&mut old_running);
    plan.stop
        .extend(old_running.iter().take(budget).map(|i| i.instance_id.clone()));

    if current.len() > target {
        let mut extra = current;
        surplus_order(&mut extra);
        let excess = extra.len() - target;
        plan.stop
            .extend(extra.into_iter().take(excess).map(|i| i.instance_id.clone()));
    }
    plan
}

async fn next_watch_event(watch: &mut Option<WatchStream>) -> Option<WatchEvent> {
    match watch {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

impl Reconciler {
    pub fn new(
        store: EntityStore,
        client: Arc<dyn WorkerClient>,
        config: SchedulerConfig,
        metrics: Arc<SharedMetrics>,
    ) -> (Self, mpsc::UnboundedReceiver<LivenessEvent>) {
        let config = Arc::new(config);
        let lifecycle = LifecycleController::new(store.clone(), config.clone(), metrics.clone());
        let dispatcher = Dispatcher::new(client, lifecycle.clone(), &config, metrics.clone());
        let (liveness, events) = LivenessTracker::new(store.clone(), config.heartbeat_interval);
        (
            Self {
                store,
                lifecycle,
                dispatcher,
                liveness,
                config,
                metrics,
            },
            events,
        )
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    pub fn lifecycle(&self) -> &LifecycleController {
        &self.lifecycle
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn liveness(&self) -> &LivenessTracker {
        &self.liveness
    }

    pub fn metrics(&self) -> &Arc<SharedMetrics> {
        &self.metrics
    }

    /// Inbound worker report: refresh liveness and inventory, then interpret
    /// each per-instance status.
    pub async fn ingest_heartbeat(&self, report: &HeartbeatReport, now: u64) -> Result<Worker, SchedulerError> {
        let worker = self.liveness.record_heartbeat(report, now).await?;
        SharedMetrics::incr(&self.metrics.heartbeats_total);

        for status in &report.instances {
            match self
                .lifecycle
                .apply_status_report(&worker.worker_id, status, now)
                .await
            {
                Ok(Some(stop)) => {
                    self.dispatcher.compensating_stop(&worker.address, stop);
                }
                Ok(None) => {}
                Err(e) => {
                    SharedMetrics::incr(&self.metrics.instance_errors_total);
                    warn!(
                        worker_id=%worker.worker_id,
                        instance_id=%status.instance_id,
                        error=%e,
                        "failed to apply instance status"
                    );
                }
            }
        }
        Ok(worker)
    }

    /// Periodic and event-triggered driver. Returns when `shutdown` flips to
    /// true or its sender is dropped.
    pub async fn run(
        self: Arc<Self>,
        mut liveness_events: mpsc::UnboundedReceiver<LivenessEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            interval_ms = self.config.reconcile_interval.as_millis() as u64,
            policy = %self.config.placement_policy,
            "reconcile loop started"
        );

        let mut interval = tokio::time::interval(self.config.reconcile_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut deployments_watch = self.open_watch().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if deployments_watch.is_none() {
                        deployments_watch = self.open_watch().await;
                    }
                }
                Some(event) = liveness_events.recv() => {
                    debug!(?event, "liveness change, reconciling early");
                }
                event = next_watch_event(&mut deployments_watch) => {
                    match event {
                        Some(ev) => debug!(key=%ev.key, revision=ev.revision, "deployment changed, reconciling early"),
                        None => {
                            warn!("deployment watch ended, reopening on next tick");
                            deployments_watch = None;
                            continue;
                        }
                    }
                }
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        info!("reconcile loop shutting down");
                        break;
                    }
                }
            }
            self.run_pass_logged().await;
        }
    }

    async fn open_watch(&self) -> Option<WatchStream> {
        match self.store.meta().watch_prefix(keys::DEPLOYMENTS, None).await {
            Ok(stream) => Some(stream),
            Err(e) => {
                warn!(error=%e, "failed to watch deployments");
                None
            }
        }
    }

    async fn run_pass_logged(&self) {
        SharedMetrics::incr(&self.metrics.reconcile_total);
        match self.run_pass().await {
            Ok(stats) if stats.is_quiet() => debug!(?stats, "reconcile pass complete"),
            Ok(stats) => info!(
                workers_lost = stats.workers_lost,
                failed = stats.instances_failed,
                created = stats.instances_created,
                stopped = stats.instances_stopped,
                retried = stats.instances_retried,
                scheduled = stats.instances_scheduled,
                infeasible = stats.instances_infeasible,
                dispatched = stats.commands_dispatched,
                collected = stats.instances_collected,
                errors = stats.errors,
                "reconcile pass complete"
            ),
            Err(e) => {
                SharedMetrics::incr(&self.metrics.reconcile_errors);
                warn!(error=%e, "reconcile pass failed");
            }
        }
    }

    pub async fn run_pass(&self) -> Result<PassStats, SchedulerError> {
        self.run_pass_at(now_ms()).await
    }

    /// One full pass at time `now`. Only store failures abort it; anything
    /// going wrong for a single instance or deployment is logged and counted.
    pub async fn run_pass_at(&self, now: u64) -> Result<PassStats, SchedulerError> {
        let mut stats = PassStats::default();

        let lost = self.liveness.sweep(now).await?;
        stats.workers_lost = lost.len();
        SharedMetrics::add(&self.metrics.workers_offline_total, lost.len() as u64);

        let fleet = self.store.snapshot().await?;
        self.handle_worker_loss(&fleet.workers, &fleet.instances, now, &mut stats).await;
        self.handle_timeouts(&fleet.instances, now, &mut stats).await;

        let instances = self.store.list_instances().await?;
        self.reconcile_replicas(&fleet.deployments, &instances, now, &mut stats).await;
        self.collect_stopped(&instances, &mut stats).await;
        self.retry_failed(&instances, now, &mut stats).await;

        self.place_pending(&fleet.deployments, now, &mut stats).await?;
        self.dispatch(&fleet.deployments, now, &mut stats).await?;

        Ok(stats)
    }

    fn isolate(&self, stats: &mut PassStats, instance_id: &str, what: &str, e: &SchedulerError) {
        stats.errors += 1;
        SharedMetrics::incr(&self.metrics.instance_errors_total);
        warn!(instance_id, error=%e, "{what} failed");
    }

    async fn handle_worker_loss(
        &self,
        workers: &BTreeMap<String, Versioned<Worker>>,
        instances: &BTreeMap<String, Versioned<Instance>>,
        now: u64,
        stats: &mut PassStats,
    ) {
        for inst in instances.values().map(|v| &v.value) {
            if !inst.state.holds_assignment() {
                continue;
            }
            let Some(worker_id) = inst.worker_id.as_deref() else {
                continue;
            };
            let alive = workers.get(worker_id).is_some_and(|w| w.value.is_online());
            if alive {
                continue;
            }
            match self
                .lifecycle
                .fail_for_worker_loss(&inst.instance_id, worker_id, now)
                .await
            {
                Ok(Some(next)) => {
                    stats.instances_failed += 1;
                    warn!(
                        instance_id=%inst.instance_id,
                        worker_id,
                        state=%next.state,
                        "instance lost with its worker"
                    );
                }
                Ok(None) => {}
                Err(e) => self.isolate(stats, &inst.instance_id, "worker loss handling", &e),
            }
        }
    }

    async fn handle_timeouts(&self, instances: &BTreeMap<String, Versioned<Instance>>, now: u64, stats: &mut PassStats) {
        for inst in instances.values().map(|v| &v.value) {
            if self.dispatcher.is_in_flight(&inst.instance_id) {
                continue;
            }
            let Some(reason) = self.lifecycle.start_timeout(inst, now) else {
                continue;
            };
            match self
                .lifecycle
                .time_out(&inst.instance_id, inst.generation, &reason, now)
                .await
            {
                Ok(Some(_)) => {
                    stats.instances_failed += 1;
                    warn!(instance_id=%inst.instance_id, reason=%reason, "instance timed out");
                }
                Ok(None) => {}
                Err(e) => self.isolate(stats, &inst.instance_id, "timeout handling", &e),
            }
        }
    }

    async fn reconcile_replicas(
        &self,
        deployments: &BTreeMap<String, Versioned<Deployment>>,
        instances: &[Versioned<Instance>],
        now: u64,
        stats: &mut PassStats,
    ) {
        // Keyed by owner id and uid: replicas of a deleted deployment are never
        // adopted by a new one that reuses its id.
        let mut owned: HashMap<(&str, &str), Vec<&Instance>> = HashMap::new();
        for inst in instances.iter().map(|v| &v.value) {
            owned
                .entry((inst.deployment_id.as_str(), inst.deployment_uid.as_str()))
                .or_default()
                .push(inst);
        }

        for dep in deployments.values().map(|v| &v.value) {
            let mine = owned
                .remove(&(dep.deployment_id.as_str(), dep.uid.as_str()))
                .unwrap_or_default();
            let plan = plan_replicas(dep, &mine);

            if plan.create > 0 {
                let mut next_ordinal = mine.iter().map(|i| i.ordinal + 1).max().unwrap_or(0);
                for _ in 0..plan.create {
                    match self.create_instance(dep, next_ordinal, now).await {
                        Ok(inst) => {
                            stats.instances_created += 1;
                            SharedMetrics::incr(&self.metrics.instances_created_total);
                            info!(
                                deployment_id=%dep.deployment_id,
                                instance_id=%inst.instance_id,
                                name=%inst.name,
                                "created pending instance"
                            );
                        }
                        Err(e) => {
                            stats.errors += 1;
                            warn!(deployment_id=%dep.deployment_id, error=%e, "failed to create instance");
                        }
                    }
                    next_ordinal += 1;
                }
            }

            for id in &plan.stop {
                self.stop_instance(id, &dep.deployment_id, "scale down", now, stats).await;
            }
        }

        // Whatever is left belongs to deleted or replaced deployments.
        for ((deployment_id, _), orphans) in owned {
            for inst in orphans.into_iter().filter(|i| !i.state.is_terminal()) {
                self.stop_instance(&inst.instance_id, deployment_id, "deployment deleted", now, stats)
                    .await;
            }
        }
    }

    async fn create_instance(&self, dep: &Deployment, ordinal: u64, now: u64) -> Result<Instance, SchedulerError> {
        let mut inst = Instance::new_pending(
            Uuid::new_v4().to_string(),
            &dep.deployment_id,
            ordinal,
            dep.spec_generation,
            dep.resources.clone(),
            now,
        );
        inst.deployment_uid = dep.uid.clone();
        self.store
            .cas(&keys::instance(&inst.instance_id), 0, &inst)
            .await?;
        Ok(inst)
    }

    async fn stop_instance(&self, instance_id: &str, deployment_id: &str, why: &str, now: u64, stats: &mut PassStats) {
        match self.lifecycle.request_stop(instance_id, now).await {
            Ok(Some(next)) => {
                stats.instances_stopped += 1;
                SharedMetrics::incr(&self.metrics.instances_stopped_total);
                info!(instance_id, deployment_id, state=%next.state, reason=why, "stopping instance");
            }
            Ok(None) => {}
            Err(e) => self.isolate(stats, instance_id, "stop request", &e),
        }
    }

    async fn collect_stopped(&self, instances: &[Versioned<Instance>], stats: &mut PassStats) {
        for inst in instances.iter().filter(|v| v.value.state.is_terminal()) {
            match self.lifecycle.remove_stopped(inst).await {
                Ok(()) => stats.instances_collected += 1,
                Err(e) => self.isolate(stats, &inst.value.instance_id, "garbage collection", &e),
            }
        }
    }

    async fn retry_failed(&self, instances: &[Versioned<Instance>], now: u64, stats: &mut PassStats) {
        for inst in instances.iter().map(|v| &v.value) {
            if inst.state != InstanceState::Error || inst.persistent_failure {
                continue;
            }
            match self.lifecycle.retry(&inst.instance_id, now).await {
                Ok(Some(_)) => {
                    stats.instances_retried += 1;
                    debug!(instance_id=%inst.instance_id, restart_count=inst.restart_count, "retrying instance");
                }
                Ok(None) => {}
                Err(e) => self.isolate(stats, &inst.instance_id, "retry", &e),
            }
        }
    }

    async fn place_pending(
        &self,
        deployments: &BTreeMap<String, Versioned<Deployment>>,
        now: u64,
        stats: &mut PassStats,
    ) -> Result<(), SchedulerError> {
        let mut pending: Vec<Versioned<Instance>> = self
            .store
            .list_instances()
            .await?
            .into_iter()
            .filter(|v| v.value.state == InstanceState::Pending)
            .collect();
        if pending.is_empty() {
            return Ok(());
        }
        pending.sort_by(|a, b| {
            (a.value.created_at_ms, a.value.ordinal, &a.value.instance_id)
                .cmp(&(b.value.created_at_ms, b.value.ordinal, &b.value.instance_id))
        });

        let mut inventory = InventorySnapshot::from_parts(
            self.store.list_workers().await?,
            self.store.list_allocations().await?,
        );

        for inst in pending {
            let Some(dep) = deployments.get(&inst.value.deployment_id) else {
                continue;
            };
            let id = inst.value.instance_id.clone();
            if let Err(e) = self
                .place_one(inst, &dep.value.placement, &mut inventory, now, stats)
                .await
            {
                self.isolate(stats, &id, "placement", &e);
            }
        }
        Ok(())
    }

    async fn place_one(
        &self,
        mut inst: Versioned<Instance>,
        constraints: &PlacementConstraints,
        inventory: &mut InventorySnapshot,
        now: u64,
        stats: &mut PassStats,
    ) -> Result<(), SchedulerError> {
        for _ in 0..MAX_PLACEMENT_ATTEMPTS {
            let assignment = match place(&inst.value.resources, constraints, inventory, self.config.placement_policy) {
                PlacementDecision::Assigned(a) => a,
                PlacementDecision::Infeasible(reason) => {
                    stats.instances_infeasible += 1;
                    SharedMetrics::incr(&self.metrics.infeasible_total);
                    if inst.value.infeasible != Some(reason) {
                        info!(instance_id=%inst.value.instance_id, reason=?reason, "instance unschedulable");
                    }
                    return self.lifecycle.record_infeasible(&inst, reason, now).await;
                }
            };

            let Some(target) = inventory.get(&assignment.worker_id) else {
                return Ok(());
            };
            let ledger = Versioned::new(target.allocations.clone(), target.allocations_revision);

            match self
                .lifecycle
                .commit_placement(&inst, &ledger, &assignment, now)
                .await
            {
                Ok((_, committed)) => {
                    if let Some(snap) = inventory.get_mut(&assignment.worker_id) {
                        snap.allocations = committed.value;
                        snap.allocations_revision = committed.revision;
                    }
                    stats.instances_scheduled += 1;
                    SharedMetrics::incr(&self.metrics.placements_total);
                    return Ok(());
                }
                Err(SchedulerError::Store(StoreError::Conflict(what))) => {
                    SharedMetrics::incr(&self.metrics.conflicts_total);
                    debug!(instance_id=%inst.value.instance_id, conflict=%what, "placement commit conflicted, re-reading");
                    let Some(fresh) = self.store.get_instance(&inst.value.instance_id).await? else {
                        return Ok(());
                    };
                    if fresh.value.state != InstanceState::Pending {
                        return Ok(());
                    }
                    inst = fresh;
                    let ledger = self.store.get_allocations(&assignment.worker_id).await?;
                    if let Some(snap) = inventory.get_mut(&assignment.worker_id) {
                        snap.allocations = ledger.value;
                        snap.allocations_revision = ledger.revision;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(SchedulerError::Contended(keys::instance(&inst.value.instance_id)))
    }

    async fn dispatch(
        &self,
        deployments: &BTreeMap<String, Versioned<Deployment>>,
        now: u64,
        stats: &mut PassStats,
    ) -> Result<(), SchedulerError> {
        let workers: BTreeMap<String, Worker> = self
            .store
            .list_workers()
            .await?
            .into_iter()
            .map(|w| (w.value.worker_id.clone(), w.value))
            .collect();

        for inst in self.store.list_instances().await?.into_iter().map(|v| v.value) {
            let Some(worker) = inst
                .worker_id
                .as_deref()
                .and_then(|id| workers.get(id))
                .filter(|w| w.is_online())
            else {
                continue;
            };
            match inst.state {
                InstanceState::Scheduled => {
                    let Some(dep) = deployments.get(&inst.deployment_id) else {
                        continue;
                    };
                    match self.dispatcher.start(worker, &inst, &dep.value, now).await {
                        Ok(true) => stats.commands_dispatched += 1,
                        Ok(false) => {}
                        Err(e) => self.isolate(stats, &inst.instance_id, "start dispatch", &e),
                    }
                }
                InstanceState::Stopping => {
                    if self.dispatcher.stop(worker, &inst) {
                        stats.commands_dispatched += 1;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_common::{DesiredState, ModelSource, ResourceRequest, UpdatePolicy};

    fn deployment(replicas: u32, spec_generation: u64) -> Deployment {
        Deployment {
            deployment_id: "qwen".to_string(),
            uid: String::new(),
            model_name: "Qwen/Qwen2.5-7B-Instruct".to_string(),
            model_source: ModelSource::HuggingFace,
            desired_state: DesiredState::Running,
            replicas,
            resources: ResourceRequest::default(),
            placement: PlacementConstraints::default(),
            update_policy: UpdatePolicy::default(),
            spec_generation,
            created_at_ms: 0,
            updated_at_ms: 0,
        }
    }

    fn instance(ordinal: u64, state: InstanceState, spec_generation: u64) -> Instance {
        let mut i = Instance::new_pending(
            format!("i{ordinal}"),
            "qwen",
            ordinal,
            spec_generation,
            ResourceRequest::default(),
            100 + ordinal,
        );
        i.state = state;
        i
    }

    #[test]
    fn test_deficit_creates_pending() {
        let dep = deployment(3, 1);
        let a = instance(0, InstanceState::Running, 1);
        let plan = plan_replicas(&dep, &[&a]);
        assert_eq!(plan.create, 2);
        assert!(plan.stop.is_empty());
    }

    #[test]
    fn test_scale_down_stops_newest_running_first() {
        let dep = deployment(1, 1);
        let (a, b, c) = (
            instance(0, InstanceState::Running, 1),
            instance(1, InstanceState::Running, 1),
            instance(2, InstanceState::Running, 1),
        );
        let plan = plan_replicas(&dep, &[&a, &b, &c]);
        assert_eq!(plan.create, 0);
        assert_eq!(plan.stop, vec!["i2".to_string(), "i1".to_string()]);
    }

    #[test]
    fn test_scale_down_prefers_least_progressed() {
        let dep = deployment(2, 1);
        let (a, b, c) = (
            instance(0, InstanceState::Pending, 1),
            instance(1, InstanceState::Running, 1),
            instance(2, InstanceState::Running, 1),
        );
        let plan = plan_replicas(&dep, &[&a, &b, &c]);
        assert_eq!(plan.stop, vec!["i0".to_string()]);
    }

    #[test]
    fn test_stopping_instances_do_not_count() {
        let dep = deployment(1, 1);
        let a = instance(0, InstanceState::Stopping, 1);
        let b = instance(1, InstanceState::Stopped, 1);
        let plan = plan_replicas(&dep, &[&a, &b]);
        assert_eq!(plan.create, 1);
    }

    #[test]
    fn test_rolling_update_surges_before_stopping() {
        let dep = deployment(2, 2);
        let (a, b) = (
            instance(0, InstanceState::Running, 1),
            instance(1, InstanceState::Running, 1),
        );
        let plan = plan_replicas(&dep, &[&a, &b]);
        assert_eq!(plan.create, 1);
        assert!(plan.stop.is_empty());

        // one replacement ready: one old replica may go
        let c = instance(2, InstanceState::Running, 2);
        let plan = plan_replicas(&dep, &[&a, &b, &c]);
        assert_eq!(plan.create, 0);
        assert_eq!(plan.stop, vec!["i1".to_string()]);
    }

    #[test]
    fn test_rolling_update_with_unavailability_budget() {
        let mut dep = deployment(2, 2);
        dep.update_policy = UpdatePolicy {
            max_surge: 0,
            max_unavailable: 1,
        };
        let (a, b) = (
            instance(0, InstanceState::Running, 1),
            instance(1, InstanceState::Error, 1),
        );
        let plan = plan_replicas(&dep, &[&a, &b]);
        assert_eq!(plan.create, 0);
        // the broken old replica goes right away; the running one would drop
        // availability below 1
        assert_eq!(plan.stop, vec!["i1".to_string()]);
    }

    #[test]
    fn test_desired_stopped_stops_everything() {
        let mut dep = deployment(2, 1);
        dep.desired_state = DesiredState::Stopped;
        let (a, b) = (
            instance(0, InstanceState::Running, 1),
            instance(1, InstanceState::Pending, 1),
        );
        let plan = plan_replicas(&dep, &[&a, &b]);
        assert_eq!(plan.stop, vec!["i1".to_string(), "i0".to_string()]);
    }
}
