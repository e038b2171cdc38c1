//! Heartbeat-driven worker health.
//!
//! This module is the only writer of `Worker::liveness`.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use shoal_common::{HeartbeatReport, Worker, WorkerInventory, WorkerLiveness};

use crate::error::{SchedulerError, StoreError};
use crate::store::{keys, EntityStore, Versioned};

/// Attempts per heartbeat before giving up on a contended worker record.
const MAX_CAS_ATTEMPTS: usize = 5;

/// Consecutive missed heartbeats that mark a worker offline.
const MISSED_HEARTBEATS: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LivenessEvent {
    Online { worker_id: String },
    Offline { worker_id: String },
}

#[derive(Clone)]
pub struct LivenessTracker {
    store: EntityStore,
    heartbeat_interval: Duration,
    events: mpsc::UnboundedSender<LivenessEvent>,
}

impl LivenessTracker {
    pub fn new(
        store: EntityStore,
        heartbeat_interval: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<LivenessEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                store,
                heartbeat_interval,
                events,
            },
            rx,
        )
    }

    /// Age after which an online or unknown worker is considered lost.
    pub fn offline_after(&self) -> Duration {
        self.heartbeat_interval * MISSED_HEARTBEATS
    }

    fn emit(&self, event: LivenessEvent) {
        // The receiver goes away on shutdown; nothing left to notify.
        let _ = self.events.send(event);
    }

    /// Upserts the reporting worker and marks it online.
    pub async fn record_heartbeat(&self, report: &HeartbeatReport, now: u64) -> Result<Worker, SchedulerError> {
        let key = keys::worker(&report.worker_id);
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current: Option<Versioned<Worker>> = self.store.get(&key).await?;
            let (mut worker, expected) = match current {
                Some(v) => (v.value, v.revision),
                None => (
                    Worker {
                        worker_id: report.worker_id.clone(),
                        address: report.address.clone(),
                        inventory: WorkerInventory::default(),
                        labels: BTreeMap::new(),
                        backends: Vec::new(),
                        liveness: WorkerLiveness::Unknown,
                        last_heartbeat_ms: 0,
                        registered_at_ms: now,
                        liveness_changed_at_ms: now,
                    },
                    0,
                ),
            };

            let previous = worker.liveness;
            worker.address = report.address.clone();
            worker.inventory = report.inventory.clone();
            // Reported labels override; labels set at registration survive.
            worker
                .labels
                .extend(report.labels.iter().map(|(k, v)| (k.clone(), v.clone())));
            worker.backends = report.backends.clone();
            worker.last_heartbeat_ms = now;
            if previous != WorkerLiveness::Online {
                worker.liveness = WorkerLiveness::Online;
                worker.liveness_changed_at_ms = now;
            }

            match self.store.cas(&key, expected, &worker).await {
                Ok(_) => {
                    if previous != WorkerLiveness::Online {
                        info!(worker_id=%worker.worker_id, from=?previous, "worker online");
                        self.emit(LivenessEvent::Online {
                            worker_id: worker.worker_id.clone(),
                        });
                    }
                    return Ok(worker);
                }
                Err(StoreError::Conflict(_)) => {
                    debug!(worker_id=%report.worker_id, "heartbeat lost a write race, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(SchedulerError::Contended(key))
    }

    /// Registers a worker ahead of its first heartbeat. Its liveness stays
    /// `unknown` until it reports, and it expires like any silent worker.
    pub async fn register(
        &self,
        worker_id: &str,
        address: &str,
        labels: BTreeMap<String, String>,
        now: u64,
    ) -> Result<Worker, SchedulerError> {
        let worker = Worker {
            worker_id: worker_id.to_string(),
            address: address.to_string(),
            inventory: WorkerInventory::default(),
            labels,
            backends: Vec::new(),
            liveness: WorkerLiveness::Unknown,
            last_heartbeat_ms: 0,
            registered_at_ms: now,
            liveness_changed_at_ms: now,
        };
        match self.store.cas(&keys::worker(worker_id), 0, &worker).await {
            Ok(_) => Ok(worker),
            Err(StoreError::Conflict(_)) => Err(SchedulerError::AlreadyExists {
                kind: "worker",
                id: worker_id.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    pub fn is_expired(&self, worker: &Worker, now: u64) -> bool {
        let seen = worker.last_heartbeat_ms.max(worker.registered_at_ms);
        now.saturating_sub(seen) >= self.offline_after().as_millis() as u64
    }

    /// Flips every silent worker to offline and returns their ids.
    ///
    /// A worker that heartbeats between the read and the write wins the race:
    /// its CAS bumps the revision and this sweep skips it.
    pub async fn sweep(&self, now: u64) -> Result<Vec<String>, SchedulerError> {
        let mut flipped = Vec::new();
        for Versioned { value: mut worker, revision } in self.store.list_workers().await? {
            if worker.liveness == WorkerLiveness::Offline || !self.is_expired(&worker, now) {
                continue;
            }
            let previous = worker.liveness;
            worker.liveness = WorkerLiveness::Offline;
            worker.liveness_changed_at_ms = now;
            match self.store.cas(&keys::worker(&worker.worker_id), revision, &worker).await {
                Ok(_) => {
                    warn!(
                        worker_id=%worker.worker_id,
                        from=?previous,
                        last_heartbeat_ms=worker.last_heartbeat_ms,
                        "worker offline: missed heartbeats"
                    );
                    self.emit(LivenessEvent::Offline {
                        worker_id: worker.worker_id.clone(),
                    });
                    flipped.push(worker.worker_id);
                }
                Err(StoreError::Conflict(_)) => {
                    debug!(worker_id=%worker.worker_id, "worker changed during sweep, skipping");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(flipped)
    }
}
