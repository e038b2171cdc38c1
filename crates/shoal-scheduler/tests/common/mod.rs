//! Shared harness: an in-memory store, a scripted worker client and helpers
//! to drive passes at chosen timestamps.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::Notify;

use shoal_common::{
    CommandReply, DesiredState, GpuDevice, GpuVendor, HeartbeatReport, HostResources, Instance, InstanceState,
    InstanceStatusReport, ModelSource, PlacementConstraints, ReportedStatus, ResourceRequest, StartInstanceCommand,
    StopInstanceCommand, UpdatePolicy, WorkerAllocations, WorkerInventory,
};
use shoal_meta::MemoryMetaStore;
use shoal_scheduler::admin::{AdminService, NewDeployment};
use shoal_scheduler::metrics::SharedMetrics;
use shoal_scheduler::reconcile::{PassStats, Reconciler};
use shoal_scheduler::store::EntityStore;
use shoal_scheduler::{SchedulerConfig, WorkerClient};

/// What the mock worker answers to start commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartBehavior {
    Accept,
    Reject(String),
    /// Transport failure, seen by the scheduler as a timeout.
    Unreachable,
}

#[derive(Debug)]
pub struct MockWorkerClient {
    behavior: Mutex<StartBehavior>,
    /// When set, start calls block until the gate is notified.
    gate: Mutex<Option<Arc<Notify>>>,
    pub starts: Mutex<Vec<(String, StartInstanceCommand)>>,
    pub stops: Mutex<Vec<(String, StopInstanceCommand)>>,
}

impl MockWorkerClient {
    pub fn new() -> Self {
        Self {
            behavior: Mutex::new(StartBehavior::Accept),
            gate: Mutex::new(None),
            starts: Mutex::new(Vec::new()),
            stops: Mutex::new(Vec::new()),
        }
    }

    pub fn set_start_behavior(&self, behavior: StartBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    /// Holds every later start call until the returned gate is notified
    /// once per call.
    pub fn hold_starts(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn start_count(&self) -> usize {
        self.starts.lock().unwrap().len()
    }

    pub fn stopped_ids(&self) -> Vec<(String, u64)> {
        self.stops
            .lock()
            .unwrap()
            .iter()
            .map(|(_, c)| (c.instance_id.clone(), c.generation))
            .collect()
    }
}

#[async_trait]
impl WorkerClient for MockWorkerClient {
    async fn start_instance(&self, address: &str, cmd: &StartInstanceCommand) -> anyhow::Result<CommandReply> {
        self.starts
            .lock()
            .unwrap()
            .push((address.to_string(), cmd.clone()));
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let behavior = self.behavior.lock().unwrap().clone();
        match behavior {
            StartBehavior::Accept => Ok(CommandReply {
                accepted: true,
                message: None,
            }),
            StartBehavior::Reject(msg) => Ok(CommandReply {
                accepted: false,
                message: Some(msg),
            }),
            StartBehavior::Unreachable => Err(anyhow::anyhow!("connection refused")),
        }
    }

    async fn stop_instance(&self, address: &str, cmd: &StopInstanceCommand) -> anyhow::Result<CommandReply> {
        self.stops
            .lock()
            .unwrap()
            .push((address.to_string(), cmd.clone()));
        Ok(CommandReply {
            accepted: true,
            message: None,
        })
    }
}

pub fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

pub fn test_config() -> SchedulerConfig {
    SchedulerConfig {
        heartbeat_interval: Duration::from_secs(10),
        command_timeout: Duration::from_secs(2),
        retry_backoff_base: Duration::from_millis(1),
        retry_backoff_cap: Duration::from_millis(1),
        max_start_attempts: 3,
        ..Default::default()
    }
}

pub fn inventory(gpu_mem: &[u64]) -> WorkerInventory {
    WorkerInventory {
        gpus: gpu_mem
            .iter()
            .enumerate()
            .map(|(i, &mem)| GpuDevice {
                index: i as u32,
                vendor: GpuVendor::Nvidia,
                memory_total_mb: mem,
                memory_used_mb: 0,
                compute_capability: None,
                name: None,
            })
            .collect(),
        host: Some(HostResources {
            cpu_count: 32,
            memory_total_mb: 262_144,
            memory_free_mb: 262_144,
        }),
    }
}

pub fn gpu_deployment(id: &str, replicas: u32, gpu_memory_mb: u64) -> NewDeployment {
    NewDeployment {
        deployment_id: id.to_string(),
        model_name: "Qwen/Qwen2.5-7B-Instruct".to_string(),
        model_source: ModelSource::HuggingFace,
        desired_state: DesiredState::Running,
        replicas,
        resources: ResourceRequest {
            gpu_count: 1,
            gpu_memory_mb,
            ..Default::default()
        },
        placement: PlacementConstraints::default(),
        update_policy: UpdatePolicy::default(),
    }
}

pub struct Harness {
    pub reconciler: Arc<Reconciler>,
    pub admin: AdminService,
    pub client: Arc<MockWorkerClient>,
    pub store: EntityStore,
    /// Start of simulated time, at or after the real clock so that
    /// timestamps written by command tasks never run ahead of it.
    pub t0: u64,
    workers: Mutex<BTreeMap<String, Vec<u64>>>,
}

impl Harness {
    pub fn new(config: SchedulerConfig) -> Self {
        let store = EntityStore::new(Arc::new(MemoryMetaStore::new()));
        let client = Arc::new(MockWorkerClient::new());
        let (reconciler, _events) = Reconciler::new(
            store.clone(),
            client.clone(),
            config,
            Arc::new(SharedMetrics::default()),
        );
        let reconciler = Arc::new(reconciler);
        Self {
            admin: AdminService::new(reconciler.clone()),
            reconciler,
            client,
            store,
            t0: wall_clock_ms() + 1_000,
            workers: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn address(worker_id: &str) -> String {
        format!("http://{worker_id}.test:10150")
    }

    /// Heartbeat with an explicit per-instance status list.
    pub async fn heartbeat_with(&self, worker_id: &str, gpu_mem: &[u64], instances: Vec<InstanceStatusReport>, now: u64) {
        self.workers
            .lock()
            .unwrap()
            .insert(worker_id.to_string(), gpu_mem.to_vec());
        let report = HeartbeatReport {
            worker_id: worker_id.to_string(),
            address: Self::address(worker_id),
            timestamp_ms: now,
            inventory: inventory(gpu_mem),
            labels: BTreeMap::new(),
            backends: Vec::new(),
            instances,
        };
        self.reconciler.ingest_heartbeat(&report, now).await.unwrap();
        self.reconciler.dispatcher().wait_idle().await;
    }

    /// Heartbeat from a worker that runs everything it was told to start.
    pub async fn heartbeat(&self, worker_id: &str, gpu_mem: &[u64], now: u64) {
        let running = self
            .instances()
            .await
            .into_iter()
            .filter(|i| i.worker_id.as_deref() == Some(worker_id))
            .filter(|i| matches!(i.state, InstanceState::Starting | InstanceState::Running))
            .map(|i| InstanceStatusReport {
                instance_id: i.instance_id,
                generation: i.generation,
                status: ReportedStatus::Running,
                message: None,
            })
            .collect();
        self.heartbeat_with(worker_id, gpu_mem, running, now).await;
    }

    /// Heartbeats every worker seen so far except `silent`.
    pub async fn heartbeat_all_except(&self, silent: &[&str], now: u64) {
        let workers = self.workers.lock().unwrap().clone();
        for (id, mem) in workers {
            if !silent.contains(&id.as_str()) {
                self.heartbeat(&id, &mem, now).await;
            }
        }
    }

    /// One reconcile pass followed by every command it dispatched.
    pub async fn pass(&self, now: u64) -> PassStats {
        let stats = self.reconciler.run_pass_at(now).await.unwrap();
        self.reconciler.dispatcher().wait_idle().await;
        stats
    }

    pub async fn instances(&self) -> Vec<Instance> {
        let mut all: Vec<Instance> = self
            .store
            .list_instances()
            .await
            .unwrap()
            .into_iter()
            .map(|v| v.value)
            .collect();
        all.sort_by_key(|i| (i.deployment_id.clone(), i.ordinal));
        all
    }

    pub async fn in_state(&self, state: InstanceState) -> Vec<Instance> {
        self.instances()
            .await
            .into_iter()
            .filter(|i| i.state == state)
            .collect()
    }

    pub async fn ledger(&self, worker_id: &str) -> WorkerAllocations {
        self.store.get_allocations(worker_id).await.unwrap().value
    }

    pub fn metric(&self, pick: impl Fn(&SharedMetrics) -> &std::sync::atomic::AtomicU64) -> u64 {
        pick(self.reconciler.metrics()).load(std::sync::atomic::Ordering::Relaxed)
    }
}
