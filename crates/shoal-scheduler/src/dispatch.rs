//! Asynchronous worker commands.
//!
//! Each command runs on its own task, bounded by a global fan-out limit and a
//! per-worker limit, and every RPC is wrapped in a timeout. Results are fed
//! back through the [`LifecycleController`], which matches them by instance
//! id and generation. Commands are never cancelled once sent.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, info, warn};

use shoal_common::{
    CommandReply, Deployment, Instance, InstanceState, StartInstanceCommand, StartOutcome,
    StopInstanceCommand, StopOutcome, Worker,
};

use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::lifecycle::{CompensatingStop, LifecycleController};
use crate::metrics::SharedMetrics;
use crate::util::now_ms;

/// RPC surface of a worker agent.
#[async_trait]
pub trait WorkerClient: Send + Sync {
    async fn start_instance(&self, address: &str, cmd: &StartInstanceCommand) -> anyhow::Result<CommandReply>;
    async fn stop_instance(&self, address: &str, cmd: &StopInstanceCommand) -> anyhow::Result<CommandReply>;
}

/// JSON over HTTP: `POST {address}/v1/instances/start|stop`.
#[derive(Debug, Clone)]
pub struct HttpWorkerClient {
    http: reqwest::Client,
}

impl HttpWorkerClient {
    pub fn new(timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { http }
    }

    async fn post<T: Serialize + Sync>(&self, address: &str, path: &str, body: &T) -> anyhow::Result<CommandReply> {
        let url = format!("{}{}", address.trim_end_matches('/'), path);
        let resp = self.http.post(&url).json(body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Ok(CommandReply {
                accepted: false,
                message: Some(format!("{status}: {text}")),
            });
        }
        Ok(resp.json::<CommandReply>().await?)
    }
}

#[async_trait]
impl WorkerClient for HttpWorkerClient {
    async fn start_instance(&self, address: &str, cmd: &StartInstanceCommand) -> anyhow::Result<CommandReply> {
        self.post(address, "/v1/instances/start", cmd).await
    }

    async fn stop_instance(&self, address: &str, cmd: &StopInstanceCommand) -> anyhow::Result<CommandReply> {
        self.post(address, "/v1/instances/stop", cmd).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Start,
    Stop,
}

pub struct Dispatcher {
    client: Arc<dyn WorkerClient>,
    lifecycle: LifecycleController,
    metrics: Arc<SharedMetrics>,
    global: Arc<Semaphore>,
    per_worker: DashMap<String, Arc<Semaphore>>,
    per_worker_limit: usize,
    command_timeout: Duration,
    in_flight: DashMap<String, CommandKind>,
    orphan_stops: DashMap<(String, String, u64), ()>,
    idle: Notify,
}

impl Dispatcher {
    pub fn new(
        client: Arc<dyn WorkerClient>,
        lifecycle: LifecycleController,
        config: &SchedulerConfig,
        metrics: Arc<SharedMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            lifecycle,
            metrics,
            global: Arc::new(Semaphore::new(config.dispatch_concurrency.max(1))),
            per_worker: DashMap::new(),
            per_worker_limit: config.per_worker_concurrency.max(1),
            command_timeout: config.command_timeout,
            in_flight: DashMap::new(),
            orphan_stops: DashMap::new(),
            idle: Notify::new(),
        })
    }

    pub fn is_in_flight(&self, instance_id: &str) -> bool {
        self.in_flight.contains_key(instance_id)
    }

    pub fn in_flight_kind(&self, instance_id: &str) -> Option<CommandKind> {
        self.in_flight.get(instance_id).map(|k| *k)
    }

    /// Commands currently outstanding, compensating stops included.
    pub fn outstanding(&self) -> usize {
        self.in_flight.len() + self.orphan_stops.len()
    }

    /// Resolves once no command is outstanding.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.outstanding() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn claim(&self, instance_id: &str, kind: CommandKind) -> bool {
        match self.in_flight.entry(instance_id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(kind);
                true
            }
        }
    }

    fn finish(&self, instance_id: &str) {
        self.in_flight.remove(instance_id);
        if self.outstanding() == 0 {
            self.idle.notify_waiters();
        }
    }

    fn worker_semaphore(&self, worker_id: &str) -> Arc<Semaphore> {
        self.per_worker
            .entry(worker_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_worker_limit)))
            .clone()
    }

    /// Runs one RPC under both concurrency limits. `None` means it timed out
    /// or could not be sent.
    async fn call<F, Fut>(&self, worker_id: &str, rpc: F) -> Option<CommandReply>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<CommandReply>>,
    {
        let Ok(_global) = self.global.clone().acquire_owned().await else {
            return None;
        };
        let Ok(_local) = self.worker_semaphore(worker_id).acquire_owned().await else {
            return None;
        };
        SharedMetrics::incr(&self.metrics.commands_dispatched_total);
        match tokio::time::timeout(self.command_timeout, rpc()).await {
            Ok(Ok(reply)) => Some(reply),
            Ok(Err(e)) => {
                warn!(worker_id, error=%e, "worker rpc failed");
                None
            }
            Err(_) => {
                warn!(worker_id, timeout_ms=self.command_timeout.as_millis() as u64, "worker rpc timed out");
                None
            }
        }
    }

    /// Moves a `scheduled` instance to `starting` and sends the start command.
    /// Returns false when nothing was sent.
    pub async fn start(
        self: &Arc<Self>,
        worker: &Worker,
        instance: &Instance,
        deployment: &Deployment,
        now: u64,
    ) -> Result<bool, SchedulerError> {
        if instance.state != InstanceState::Scheduled || !self.claim(&instance.instance_id, CommandKind::Start) {
            return Ok(false);
        }
        let starting = match self
            .lifecycle
            .mark_starting(&instance.instance_id, instance.generation, now)
            .await
        {
            Ok(Some(inst)) => inst,
            Ok(None) => {
                self.finish(&instance.instance_id);
                return Ok(false);
            }
            Err(e) => {
                self.finish(&instance.instance_id);
                return Err(e);
            }
        };

        let cmd = StartInstanceCommand {
            instance_id: starting.instance_id.clone(),
            generation: starting.generation,
            deployment_id: starting.deployment_id.clone(),
            model_name: deployment.model_name.clone(),
            model_source: deployment.model_source,
            resources: starting.resources.clone(),
            gpu_indices: starting.gpu_indices.clone().unwrap_or_default(),
        };
        let worker_id = worker.worker_id.clone();
        let address = worker.address.clone();
        info!(instance_id=%cmd.instance_id, worker_id=%worker_id, generation=cmd.generation, "dispatching start");

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let reply = this
                .call(&worker_id, || this.client.start_instance(&address, &cmd))
                .await;
            let outcome = match reply {
                Some(r) if r.accepted => StartOutcome::Accepted,
                Some(r) => StartOutcome::Rejected(r.message.unwrap_or_else(|| "rejected".to_string())),
                None => StartOutcome::Timeout,
            };
            if outcome != StartOutcome::Accepted {
                SharedMetrics::incr(&this.metrics.command_failures_total);
            }

            match this
                .lifecycle
                .apply_start_result(&cmd.instance_id, &worker_id, cmd.generation, &outcome, now_ms())
                .await
            {
                Ok(Some(stop)) => {
                    this.compensating_stop(&address, stop);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(instance_id=%cmd.instance_id, error=%e, "failed to apply start result");
                }
            }
            this.finish(&cmd.instance_id);
        });
        Ok(true)
    }

    /// Sends a stop for a `stopping` instance. Returns false when another
    /// command for the instance is still outstanding.
    pub fn stop(self: &Arc<Self>, worker: &Worker, instance: &Instance) -> bool {
        if instance.state != InstanceState::Stopping || !self.claim(&instance.instance_id, CommandKind::Stop) {
            return false;
        }
        let cmd = StopInstanceCommand {
            instance_id: instance.instance_id.clone(),
            generation: instance.generation,
        };
        let worker_id = worker.worker_id.clone();
        let address = worker.address.clone();
        info!(instance_id=%cmd.instance_id, worker_id=%worker_id, generation=cmd.generation, "dispatching stop");

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let reply = this
                .call(&worker_id, || this.client.stop_instance(&address, &cmd))
                .await;
            let outcome = match reply {
                Some(r) if r.accepted => StopOutcome::Accepted,
                _ => StopOutcome::Timeout,
            };
            if outcome != StopOutcome::Accepted {
                SharedMetrics::incr(&this.metrics.command_failures_total);
            }
            if let Err(e) = this
                .lifecycle
                .apply_stop_result(&cmd.instance_id, &worker_id, cmd.generation, &outcome, now_ms())
                .await
            {
                warn!(instance_id=%cmd.instance_id, error=%e, "failed to apply stop result");
            }
            this.finish(&cmd.instance_id);
        });
        true
    }

    /// Fire-and-forget stop for work a worker runs without the control plane
    /// wanting it. Deduplicated per worker, instance and generation.
    pub fn compensating_stop(self: &Arc<Self>, address: &str, stop: CompensatingStop) -> bool {
        let key = (stop.worker_id.clone(), stop.instance_id.clone(), stop.generation);
        match self.orphan_stops.entry(key.clone()) {
            Entry::Occupied(_) => return false,
            Entry::Vacant(slot) => {
                slot.insert(());
            }
        }
        SharedMetrics::incr(&self.metrics.compensating_stops_total);
        info!(
            instance_id=%stop.instance_id,
            worker_id=%stop.worker_id,
            generation=stop.generation,
            "dispatching compensating stop"
        );

        let address = address.to_string();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let cmd = StopInstanceCommand {
                instance_id: stop.instance_id.clone(),
                generation: stop.generation,
            };
            let reply = this
                .call(&stop.worker_id, || this.client.stop_instance(&address, &cmd))
                .await;
            if !reply.is_some_and(|r| r.accepted) {
                // The next heartbeat still listing it triggers another attempt.
                debug!(instance_id=%stop.instance_id, worker_id=%stop.worker_id, "compensating stop not confirmed");
                SharedMetrics::incr(&this.metrics.command_failures_total);
            }
            this.orphan_stops.remove(&key);
            if this.outstanding() == 0 {
                this.idle.notify_waiters();
            }
        });
        true
    }
}
