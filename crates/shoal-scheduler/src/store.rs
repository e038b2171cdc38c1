//! Typed records on top of the key/value [`MetaStore`].
//!
//! Layout:
//!
//! | key | value |
//! |---|---|
//! | `/workers/{worker_id}` | [`Worker`] |
//! | `/deployments/{deployment_id}` | [`Deployment`] |
//! | `/instances/{instance_id}` | [`Instance`] |
//! | `/allocations/{worker_id}` | [`WorkerAllocations`] |
//!
//! The mod revision of a key is the optimistic version of its record.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use shoal_common::{Deployment, Instance, Worker, WorkerAllocations};
use shoal_meta::{MetaStore, MetaTxn};

use crate::error::StoreError;

pub mod keys {
    pub const WORKERS: &str = "/workers/";
    pub const DEPLOYMENTS: &str = "/deployments/";
    pub const INSTANCES: &str = "/instances/";
    pub const ALLOCATIONS: &str = "/allocations/";

    pub fn worker(id: &str) -> String {
        format!("{WORKERS}{id}")
    }

    pub fn deployment(id: &str) -> String {
        format!("{DEPLOYMENTS}{id}")
    }

    pub fn instance(id: &str) -> String {
        format!("{INSTANCES}{id}")
    }

    pub fn allocations(worker_id: &str) -> String {
        format!("{ALLOCATIONS}{worker_id}")
    }
}

/// A record together with the revision it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    pub value: T,
    pub revision: u64,
}

impl<T> Versioned<T> {
    pub fn new(value: T, revision: u64) -> Self {
        Self { value, revision }
    }
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(value).map_err(StoreError::Encode)
}

fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<T, StoreError> {
    serde_json::from_slice(bytes).map_err(|source| StoreError::Decode {
        key: key.to_string(),
        source,
    })
}

/// Everything a reconcile pass reads, taken in one go.
#[derive(Debug, Clone, Default)]
pub struct FleetSnapshot {
    pub workers: BTreeMap<String, Versioned<Worker>>,
    pub allocations: BTreeMap<String, Versioned<WorkerAllocations>>,
    pub deployments: BTreeMap<String, Versioned<Deployment>>,
    pub instances: BTreeMap<String, Versioned<Instance>>,
}

#[derive(Clone)]
pub struct EntityStore {
    meta: Arc<dyn MetaStore>,
}

impl EntityStore {
    pub fn new(meta: Arc<dyn MetaStore>) -> Self {
        Self { meta }
    }

    pub fn meta(&self) -> &Arc<dyn MetaStore> {
        &self.meta
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<Versioned<T>>, StoreError> {
        match self.meta.get(key).await? {
            Some((bytes, rev)) => Ok(Some(Versioned::new(decode(key, &bytes)?, rev))),
            None => Ok(None),
        }
    }

    /// Lists and decodes every record under `prefix`. Undecodable records are
    /// logged and skipped so one bad write cannot wedge the whole fleet.
    pub async fn list<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<Versioned<T>>, StoreError> {
        let kvs = self.meta.list_prefix(prefix).await?;
        let mut out = Vec::with_capacity(kvs.len());
        for (key, bytes, rev) in kvs {
            match decode(&key, &bytes) {
                Ok(value) => out.push(Versioned::new(value, rev)),
                Err(e) => warn!(key=%key, error=%e, "skipping undecodable record"),
            }
        }
        Ok(out)
    }

    /// Conditional single-key write. `expected_revision` 0 means "create".
    pub async fn cas<T: Serialize>(&self, key: &str, expected_revision: u64, value: &T) -> Result<u64, StoreError> {
        let (ok, rev) = self
            .meta
            .compare_and_swap(key, expected_revision, encode(value)?)
            .await?;
        if ok {
            Ok(rev)
        } else {
            Err(StoreError::Conflict(key.to_string()))
        }
    }

    pub async fn commit(&self, txn: MetaTxn) -> Result<u64, StoreError> {
        let what = txn
            .guards
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(",");
        match self.meta.commit(txn).await? {
            Some(rev) => Ok(rev),
            None => Err(StoreError::Conflict(what)),
        }
    }

    /// Deletes `key` only if it is still at `expected_revision`.
    pub async fn delete(&self, key: &str, expected_revision: u64) -> Result<u64, StoreError> {
        self.commit(MetaTxn::new().guard(key, expected_revision).delete(key))
            .await
    }

    pub async fn get_worker(&self, id: &str) -> Result<Option<Versioned<Worker>>, StoreError> {
        self.get(&keys::worker(id)).await
    }

    pub async fn list_workers(&self) -> Result<Vec<Versioned<Worker>>, StoreError> {
        self.list(keys::WORKERS).await
    }

    pub async fn get_deployment(&self, id: &str) -> Result<Option<Versioned<Deployment>>, StoreError> {
        self.get(&keys::deployment(id)).await
    }

    pub async fn list_deployments(&self) -> Result<Vec<Versioned<Deployment>>, StoreError> {
        self.list(keys::DEPLOYMENTS).await
    }

    pub async fn get_instance(&self, id: &str) -> Result<Option<Versioned<Instance>>, StoreError> {
        self.get(&keys::instance(id)).await
    }

    pub async fn list_instances(&self) -> Result<Vec<Versioned<Instance>>, StoreError> {
        self.list(keys::INSTANCES).await
    }

    /// Ledger of one worker; an absent key reads as an empty ledger at revision 0.
    pub async fn get_allocations(&self, worker_id: &str) -> Result<Versioned<WorkerAllocations>, StoreError> {
        Ok(self
            .get(&keys::allocations(worker_id))
            .await?
            .unwrap_or_else(|| Versioned::new(WorkerAllocations::new(worker_id), 0)))
    }

    pub async fn list_allocations(&self) -> Result<Vec<Versioned<WorkerAllocations>>, StoreError> {
        self.list(keys::ALLOCATIONS).await
    }

    pub async fn snapshot(&self) -> Result<FleetSnapshot, StoreError> {
        let workers = self.list_workers().await?;
        let allocations = self.list_allocations().await?;
        let deployments = self.list_deployments().await?;
        let instances = self.list_instances().await?;
        Ok(FleetSnapshot {
            workers: workers
                .into_iter()
                .map(|w| (w.value.worker_id.clone(), w))
                .collect(),
            allocations: allocations
                .into_iter()
                .map(|a| (a.value.worker_id.clone(), a))
                .collect(),
            deployments: deployments
                .into_iter()
                .map(|d| (d.value.deployment_id.clone(), d))
                .collect(),
            instances: instances
                .into_iter()
                .map(|i| (i.value.instance_id.clone(), i))
                .collect(),
        })
    }
}
