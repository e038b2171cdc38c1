//! Administrative accessors. Everything here is a synchronous store call; the
//! reconcile loop picks changes up on its next pass or through the
//! deployments watch.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info};
use uuid::Uuid;

use shoal_common::{
    Deployment, DesiredState, Instance, InstanceState, ModelSource, PlacementConstraints, ResourceRequest,
    UpdatePolicy, Worker,
};

use crate::error::{SchedulerError, StoreError};
use crate::reconcile::Reconciler;
use crate::store::keys;
use crate::util::now_ms;

const MAX_UPDATE_ATTEMPTS: usize = 5;

/// Fields accepted when declaring a deployment.
#[derive(Debug, Clone, Deserialize)]
pub struct NewDeployment {
    pub deployment_id: String,
    pub model_name: String,
    pub model_source: ModelSource,
    #[serde(default = "default_desired_state")]
    pub desired_state: DesiredState,
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    #[serde(default)]
    pub resources: ResourceRequest,
    #[serde(default)]
    pub placement: PlacementConstraints,
    #[serde(default)]
    pub update_policy: UpdatePolicy,
}

fn default_desired_state() -> DesiredState {
    DesiredState::Running
}

fn default_replicas() -> u32 {
    1
}

/// Partial update; absent fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeploymentUpdate {
    pub replicas: Option<u32>,
    pub desired_state: Option<DesiredState>,
    pub placement: Option<PlacementConstraints>,
    pub update_policy: Option<UpdatePolicy>,
    pub resources: Option<ResourceRequest>,
    pub model_name: Option<String>,
    pub model_source: Option<ModelSource>,
}

impl DeploymentUpdate {
    /// Applies the update, bumping `spec_generation` when a field that
    /// replicas are built from changes.
    fn apply(&self, current: &Deployment, now: u64) -> Deployment {
        let mut next = current.clone();
        if let Some(replicas) = self.replicas {
            next.replicas = replicas;
        }
        if let Some(state) = self.desired_state {
            next.desired_state = state;
        }
        if let Some(placement) = &self.placement {
            next.placement = placement.clone();
        }
        if let Some(policy) = self.update_policy {
            next.update_policy = policy;
        }
        if let Some(resources) = &self.resources {
            next.resources = resources.clone();
        }
        if let Some(model) = &self.model_name {
            next.model_name = model.clone();
        }
        if let Some(source) = self.model_source {
            next.model_source = source;
        }

        let respec = next.resources != current.resources
            || next.model_name != current.model_name
            || next.model_source != current.model_source;
        if respec {
            next.spec_generation = current.spec_generation.saturating_add(1);
        }
        next.updated_at_ms = now;
        next
    }
}

/// Query filter for instance listings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InstanceFilter {
    pub deployment_id: Option<String>,
    pub worker_id: Option<String>,
    pub state: Option<InstanceState>,
}

impl InstanceFilter {
    pub fn matches(&self, inst: &Instance) -> bool {
        self.deployment_id.as_ref().map_or(true, |d| d == &inst.deployment_id)
            && self
                .worker_id
                .as_ref()
                .map_or(true, |w| inst.worker_id.as_ref() == Some(w))
            && self.state.map_or(true, |s| s == inst.state)
    }
}

fn is_valid_id(id: &str) -> bool {
    if id.is_empty() || id.len() > 63 {
        return false;
    }
    let mut chars = id.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c.is_ascii_digit() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Rejects declarations that can never be satisfied or are self-contradictory.
pub fn validate(dep: &Deployment) -> Result<(), SchedulerError> {
    let invalid = |msg: String| Err(SchedulerError::InvalidDeployment(msg));

    if !is_valid_id(&dep.deployment_id) {
        return invalid(format!(
            "deployment_id '{}' must match [a-z0-9][a-z0-9-]* (max 63 chars)",
            dep.deployment_id
        ));
    }
    if dep.model_name.trim().is_empty() {
        return invalid("model_name must not be empty".to_string());
    }

    let res = &dep.resources;
    if res.gpu_count == 0 && res.gpu_memory_mb > 0 {
        return invalid("gpu_memory_mb requires gpu_count > 0".to_string());
    }
    if res.gpu_count == 0 {
        if let Some(backend) = res.backend.filter(|b| !b.supports_cpu_only()) {
            return invalid(format!("backend {} cannot run without GPUs", backend.as_str()));
        }
    }

    if let Some(indices) = &dep.placement.gpu_indices {
        if dep.placement.worker_pin.is_none() {
            return invalid("gpu_indices requires worker_pin".to_string());
        }
        if indices.len() != res.gpu_count as usize {
            return invalid(format!(
                "gpu_indices names {} GPUs but gpu_count is {}",
                indices.len(),
                res.gpu_count
            ));
        }
        let mut sorted = indices.clone();
        sorted.sort_unstable();
        sorted.dedup();
        if sorted.len() != indices.len() {
            return invalid("gpu_indices contains duplicates".to_string());
        }
    }

    if dep.update_policy.max_surge == 0 && dep.update_policy.max_unavailable == 0 {
        return invalid("update_policy needs max_surge or max_unavailable above 0".to_string());
    }
    Ok(())
}

/// Admin operations over deployments, instances and workers.
#[derive(Clone)]
pub struct AdminService {
    reconciler: Arc<Reconciler>,
}

impl AdminService {
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        Self { reconciler }
    }

    pub async fn create_deployment(&self, req: NewDeployment) -> Result<Deployment, SchedulerError> {
        let now = now_ms();
        let dep = Deployment {
            deployment_id: req.deployment_id,
            uid: Uuid::new_v4().to_string(),
            model_name: req.model_name,
            model_source: req.model_source,
            desired_state: req.desired_state,
            replicas: req.replicas,
            resources: req.resources,
            placement: req.placement,
            update_policy: req.update_policy,
            spec_generation: 1,
            created_at_ms: now,
            updated_at_ms: now,
        };
        validate(&dep)?;

        let store = self.reconciler.store();
        match store.cas(&keys::deployment(&dep.deployment_id), 0, &dep).await {
            Ok(_) => {
                info!(
                    deployment_id=%dep.deployment_id,
                    model=%dep.model_name,
                    replicas=dep.replicas,
                    "deployment created"
                );
                Ok(dep)
            }
            Err(StoreError::Conflict(_)) => Err(SchedulerError::AlreadyExists {
                kind: "deployment",
                id: dep.deployment_id,
            }),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn update_deployment(&self, deployment_id: &str, update: DeploymentUpdate) -> Result<Deployment, SchedulerError> {
        let store = self.reconciler.store();
        let key = keys::deployment(deployment_id);
        for _ in 0..MAX_UPDATE_ATTEMPTS {
            let current = store
                .get_deployment(deployment_id)
                .await?
                .ok_or_else(|| SchedulerError::not_found("deployment", deployment_id))?;
            let next = update.apply(&current.value, now_ms());
            validate(&next)?;
            match store.cas(&key, current.revision, &next).await {
                Ok(_) => {
                    info!(
                        deployment_id,
                        replicas=next.replicas,
                        spec_generation=next.spec_generation,
                        "deployment updated"
                    );
                    return Ok(next);
                }
                Err(StoreError::Conflict(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(SchedulerError::Contended(key))
    }

    /// Removes the declaration. Its instances are stopped by the next pass.
    /// The delete is guarded by the revision it read, so a concurrent update
    /// is never lost silently.
    pub async fn delete_deployment(&self, deployment_id: &str) -> Result<(), SchedulerError> {
        let store = self.reconciler.store();
        let key = keys::deployment(deployment_id);
        for _ in 0..MAX_UPDATE_ATTEMPTS {
            let current = store
                .get_deployment(deployment_id)
                .await?
                .ok_or_else(|| SchedulerError::not_found("deployment", deployment_id))?;
            match store.delete(&key, current.revision).await {
                Ok(_) => {
                    info!(deployment_id, uid=%current.value.uid, "deployment deleted");
                    return Ok(());
                }
                Err(StoreError::Conflict(_)) => {
                    debug!(deployment_id, "deployment changed under delete, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(SchedulerError::Contended(key))
    }

    pub async fn get_deployment(&self, deployment_id: &str) -> Result<Deployment, SchedulerError> {
        self.reconciler
            .store()
            .get_deployment(deployment_id)
            .await?
            .map(|v| v.value)
            .ok_or_else(|| SchedulerError::not_found("deployment", deployment_id))
    }

    pub async fn list_deployments(&self) -> Result<Vec<Deployment>, SchedulerError> {
        Ok(self
            .reconciler
            .store()
            .list_deployments()
            .await?
            .into_iter()
            .map(|v| v.value)
            .collect())
    }

    pub async fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<Instance>, SchedulerError> {
        let mut out: Vec<Instance> = self
            .reconciler
            .store()
            .list_instances()
            .await?
            .into_iter()
            .map(|v| v.value)
            .filter(|i| filter.matches(i))
            .collect();
        out.sort_by(|a, b| {
            (&a.deployment_id, a.ordinal, &a.instance_id).cmp(&(&b.deployment_id, b.ordinal, &b.instance_id))
        });
        Ok(out)
    }

    pub async fn get_instance(&self, instance_id: &str) -> Result<Instance, SchedulerError> {
        self.reconciler
            .store()
            .get_instance(instance_id)
            .await?
            .map(|v| v.value)
            .ok_or_else(|| SchedulerError::not_found("instance", instance_id))
    }

    pub async fn list_workers(&self) -> Result<Vec<Worker>, SchedulerError> {
        Ok(self
            .reconciler
            .store()
            .list_workers()
            .await?
            .into_iter()
            .map(|v| v.value)
            .collect())
    }

    pub async fn get_worker(&self, worker_id: &str) -> Result<Worker, SchedulerError> {
        self.reconciler
            .store()
            .get_worker(worker_id)
            .await?
            .map(|v| v.value)
            .ok_or_else(|| SchedulerError::not_found("worker", worker_id))
    }

    /// Pre-registers a worker; it stays `unknown` until its first heartbeat.
    pub async fn register_worker(
        &self,
        worker_id: &str,
        address: &str,
        labels: BTreeMap<String, String>,
    ) -> Result<Worker, SchedulerError> {
        if !is_valid_id(worker_id) {
            return Err(SchedulerError::InvalidDeployment(format!(
                "worker_id '{worker_id}' must match [a-z0-9][a-z0-9-]*"
            )));
        }
        let worker = self
            .reconciler
            .liveness()
            .register(worker_id, address, labels, now_ms())
            .await?;
        info!(worker_id, address, "worker registered");
        Ok(worker)
    }
}
