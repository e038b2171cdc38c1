//! Capacity arithmetic over a worker's reported hardware and the allocation
//! ledger kept by the control plane.
//!
//! Everything here fails closed: a worker that is not online, has no host
//! report, or reports a GPU with zero memory offers no capacity on the
//! affected dimension.

use std::collections::BTreeMap;

use thiserror::Error;

use shoal_common::{
    GpuSharing, PlacementConstraints, ResourceRequest, Worker, WorkerAllocations,
};

use crate::store::Versioned;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FitFailure {
    #[error("worker is not online")]
    NotOnline,
    #[error("worker has not reported host resources")]
    IncompleteReport,
    #[error("worker labels do not match selector")]
    LabelMismatch,
    #[error("host memory: requested {requested} MiB, available {available} MiB")]
    HostMemory { requested: u64, available: u64 },
    #[error("gpu count: requested {requested}, eligible {eligible}")]
    GpuCount { requested: u32, eligible: u32 },
    #[error("pinned gpu {index} cannot take the request")]
    PinnedGpu { index: u32 },
}

/// One worker plus its allocation ledger, read together.
#[derive(Debug, Clone)]
pub struct WorkerSnapshot {
    pub worker: Worker,
    pub allocations: WorkerAllocations,
    /// Ledger revision; 0 when the worker has no ledger yet.
    pub allocations_revision: u64,
}

impl WorkerSnapshot {
    pub fn new(worker: Worker, allocations: Versioned<WorkerAllocations>) -> Self {
        Self {
            worker,
            allocations: allocations.value,
            allocations_revision: allocations.revision,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker.worker_id
    }

    /// Instances currently holding resources here.
    pub fn allocated_instances(&self) -> usize {
        self.allocations.len()
    }

    /// Remaining memory on one GPU. Unknown indices and GPUs reporting zero
    /// total memory have nothing left.
    pub fn remaining(&self, gpu_index: u32) -> u64 {
        remaining_on(&self.worker, &self.allocations, gpu_index)
    }

    pub fn remaining_host_memory(&self) -> u64 {
        match &self.worker.inventory.host {
            Some(host) => host
                .memory_total_mb
                .saturating_sub(self.allocations.host_memory_mb()),
            None => 0,
        }
    }

    /// Checks every dimension and returns the GPU indices the request would
    /// take, best first.
    pub fn check_fit(
        &self,
        request: &ResourceRequest,
        constraints: &PlacementConstraints,
    ) -> Result<Vec<u32>, FitFailure> {
        if !self.worker.is_online() {
            return Err(FitFailure::NotOnline);
        }
        check_against(&self.worker, &self.allocations, request, constraints)
    }

    pub fn can_fit(&self, request: &ResourceRequest, constraints: &PlacementConstraints) -> bool {
        self.check_fit(request, constraints).is_ok()
    }

    /// Whether the request would fit on this worker with nothing else
    /// allocated, regardless of liveness. Used to tell configuration errors
    /// from temporary shortage.
    pub fn fits_when_idle(&self, request: &ResourceRequest, constraints: &PlacementConstraints) -> bool {
        let empty = WorkerAllocations::new(self.worker.worker_id.clone());
        check_against(&self.worker, &empty, request, constraints).is_ok()
    }

    pub fn has_complete_report(&self) -> bool {
        self.worker.inventory.host.is_some()
    }
}

fn remaining_on(worker: &Worker, ledger: &WorkerAllocations, gpu_index: u32) -> u64 {
    match worker.inventory.gpu(gpu_index) {
        Some(gpu) if gpu.memory_total_mb > 0 => gpu
            .memory_total_mb
            .saturating_sub(ledger.gpu_claim(gpu_index).memory_mb),
        _ => 0,
    }
}

fn gpu_accepts(worker: &Worker, ledger: &WorkerAllocations, index: u32, request: &ResourceRequest) -> bool {
    let Some(gpu) = worker.inventory.gpu(index) else {
        return false;
    };
    if gpu.memory_total_mb == 0 {
        return false;
    }
    let claim = ledger.gpu_claim(index);
    let shareable = match request.sharing {
        GpuSharing::Exclusive => claim.holders == 0,
        GpuSharing::Shared => !claim.exclusive,
    };
    shareable && remaining_on(worker, ledger, index) >= request.gpu_memory_mb
}

fn check_against(
    worker: &Worker,
    ledger: &WorkerAllocations,
    request: &ResourceRequest,
    constraints: &PlacementConstraints,
) -> Result<Vec<u32>, FitFailure> {
    let Some(host) = &worker.inventory.host else {
        return Err(FitFailure::IncompleteReport);
    };
    if !worker.matches_labels(&constraints.label_selector) {
        return Err(FitFailure::LabelMismatch);
    }

    let host_available = host.memory_total_mb.saturating_sub(ledger.host_memory_mb());
    if request.host_memory_mb > host_available {
        return Err(FitFailure::HostMemory {
            requested: request.host_memory_mb,
            available: host_available,
        });
    }

    if request.gpu_count == 0 {
        return Ok(Vec::new());
    }

    if let Some(pinned) = &constraints.gpu_indices {
        if let Some(&index) = pinned
            .iter()
            .find(|&&i| !gpu_accepts(worker, ledger, i, request))
        {
            return Err(FitFailure::PinnedGpu { index });
        }
        if pinned.len() != request.gpu_count as usize {
            return Err(FitFailure::GpuCount {
                requested: request.gpu_count,
                eligible: pinned.len() as u32,
            });
        }
        return Ok(pinned.clone());
    }

    // Largest remaining memory first, lowest index on ties.
    let mut eligible: Vec<(u64, u32)> = worker
        .inventory
        .gpus
        .iter()
        .filter(|g| gpu_accepts(worker, ledger, g.index, request))
        .map(|g| (remaining_on(worker, ledger, g.index), g.index))
        .collect();
    if eligible.len() < request.gpu_count as usize {
        return Err(FitFailure::GpuCount {
            requested: request.gpu_count,
            eligible: eligible.len() as u32,
        });
    }
    eligible.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    Ok(eligible
        .into_iter()
        .take(request.gpu_count as usize)
        .map(|(_, index)| index)
        .collect())
}

/// Read-only view of the fleet used by placement.
#[derive(Debug, Clone, Default)]
pub struct InventorySnapshot {
    workers: BTreeMap<String, WorkerSnapshot>,
}

impl InventorySnapshot {
    pub fn from_parts(
        workers: Vec<Versioned<Worker>>,
        ledgers: Vec<Versioned<WorkerAllocations>>,
    ) -> Self {
        let mut ledgers: BTreeMap<String, Versioned<WorkerAllocations>> = ledgers
            .into_iter()
            .map(|l| (l.value.worker_id.clone(), l))
            .collect();
        let workers = workers
            .into_iter()
            .map(|w| {
                let id = w.value.worker_id.clone();
                let ledger = ledgers
                    .remove(&id)
                    .unwrap_or_else(|| Versioned::new(WorkerAllocations::new(id.clone()), 0));
                (id, WorkerSnapshot::new(w.value, ledger))
            })
            .collect();
        Self { workers }
    }

    pub fn insert(&mut self, snapshot: WorkerSnapshot) {
        self.workers
            .insert(snapshot.worker.worker_id.clone(), snapshot);
    }

    pub fn get(&self, worker_id: &str) -> Option<&WorkerSnapshot> {
        self.workers.get(worker_id)
    }

    pub fn get_mut(&mut self, worker_id: &str) -> Option<&mut WorkerSnapshot> {
        self.workers.get_mut(worker_id)
    }

    /// Workers in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = &WorkerSnapshot> {
        self.workers.values()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use shoal_common::{
        Allocation, GpuDevice, GpuVendor, HostResources, WorkerInventory, WorkerLiveness,
    };

    use super::*;

    pub fn worker(id: &str, gpu_mem: &[u64]) -> Worker {
        Worker {
            worker_id: id.to_string(),
            address: format!("http://{id}:10150"),
            inventory: WorkerInventory {
                gpus: gpu_mem
                    .iter()
                    .enumerate()
                    .map(|(i, mem)| GpuDevice {
                        index: i as u32,
                        vendor: GpuVendor::Nvidia,
                        memory_total_mb: *mem,
                        memory_used_mb: 0,
                        compute_capability: Some("8.9".to_string()),
                        name: None,
                    })
                    .collect(),
                host: Some(HostResources {
                    cpu_count: 32,
                    memory_total_mb: 131_072,
                    memory_free_mb: 131_072,
                }),
            },
            labels: Default::default(),
            backends: Vec::new(),
            liveness: WorkerLiveness::Online,
            last_heartbeat_ms: 1,
            registered_at_ms: 1,
            liveness_changed_at_ms: 1,
        }
    }

    pub fn snapshot(worker: Worker, allocs: Vec<Allocation>) -> WorkerSnapshot {
        let mut ledger = WorkerAllocations::new(worker.worker_id.clone());
        for a in allocs {
            ledger.insert(a);
        }
        WorkerSnapshot::new(worker, Versioned::new(ledger, 0))
    }

    pub fn alloc(id: &str, gpus: &[u32], mem: u64, sharing: GpuSharing) -> Allocation {
        Allocation {
            instance_id: id.to_string(),
            gpu_indices: gpus.to_vec(),
            gpu_memory_mb: mem,
            host_memory_mb: 0,
            sharing,
        }
    }

    pub fn gpu_request(count: u32, mem: u64) -> ResourceRequest {
        ResourceRequest {
            gpu_count: count,
            gpu_memory_mb: mem,
            ..Default::default()
        }
    }
}
