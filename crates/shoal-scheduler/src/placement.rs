use std::fmt;
use std::str::FromStr;

use shoal_common::{InfeasibleReason, PlacementConstraints, ResourceRequest, Worker};

use crate::inventory::{InventorySnapshot, WorkerSnapshot};

/// Worker ranking among the ones that fit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PlacementPolicy {
    /// Fewest allocated instances first.
    #[default]
    Spread,
    /// Most allocated instances first.
    Binpack,
}

impl FromStr for PlacementPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "spread" => Ok(PlacementPolicy::Spread),
            "binpack" => Ok(PlacementPolicy::Binpack),
            other => Err(format!("unknown placement policy '{other}', available: spread, binpack")),
        }
    }
}

impl fmt::Display for PlacementPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlacementPolicy::Spread => f.write_str("spread"),
            PlacementPolicy::Binpack => f.write_str("binpack"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub worker_id: String,
    pub gpu_indices: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlacementDecision {
    Assigned(Assignment),
    Infeasible(InfeasibleReason),
}

/// Static constraints: pinning, labels and backend capability. Liveness and
/// capacity are checked separately.
fn matches_constraints(worker: &Worker, request: &ResourceRequest, constraints: &PlacementConstraints) -> bool {
    if let Some(pin) = &constraints.worker_pin {
        if pin != &worker.worker_id {
            return false;
        }
    }
    if !worker.matches_labels(&constraints.label_selector) {
        return false;
    }
    match request.backend {
        Some(backend) => backend.runs_on(worker),
        None => true,
    }
}

/// Chooses a worker and GPU subset for one replica.
///
/// Pure over `snapshot`: identical inputs always yield the same decision and
/// nothing is reserved. The caller commits the allocation.
pub fn place(
    request: &ResourceRequest,
    constraints: &PlacementConstraints,
    snapshot: &InventorySnapshot,
    policy: PlacementPolicy,
) -> PlacementDecision {
    if request.gpu_count > 1 && request.backend.is_some_and(|b| !b.supports_multi_gpu()) {
        return PlacementDecision::Infeasible(InfeasibleReason::Unsatisfiable);
    }

    let matching: Vec<&WorkerSnapshot> = snapshot
        .iter()
        .filter(|s| matches_constraints(&s.worker, request, constraints))
        .collect();

    let mut best: Option<(&WorkerSnapshot, Vec<u32>)> = None;
    for &candidate in matching.iter().filter(|s| s.worker.is_online()) {
        let Ok(gpus) = candidate.check_fit(request, constraints) else {
            continue;
        };
        let better = match &best {
            None => true,
            Some((current, _)) => ranks_before(candidate, current, policy),
        };
        if better {
            best = Some((candidate, gpus));
        }
    }

    if let Some((chosen, gpu_indices)) = best {
        return PlacementDecision::Assigned(Assignment {
            worker_id: chosen.worker_id().to_string(),
            gpu_indices,
        });
    }

    let reported: Vec<&&WorkerSnapshot> = matching.iter().filter(|s| s.has_complete_report()).collect();
    if !reported.is_empty() && !reported.iter().any(|s| s.fits_when_idle(request, constraints)) {
        return PlacementDecision::Infeasible(InfeasibleReason::Unsatisfiable);
    }
    if !matching.iter().any(|s| s.worker.is_online()) {
        return PlacementDecision::Infeasible(InfeasibleReason::NoMatchingWorker);
    }
    PlacementDecision::Infeasible(InfeasibleReason::InsufficientCapacity)
}

fn ranks_before(a: &WorkerSnapshot, b: &WorkerSnapshot, policy: PlacementPolicy) -> bool {
    let (la, lb) = (a.allocated_instances(), b.allocated_instances());
    let by_load = match policy {
        PlacementPolicy::Spread => la.cmp(&lb),
        PlacementPolicy::Binpack => lb.cmp(&la),
    };
    by_load.then_with(|| a.worker_id().cmp(b.worker_id())).is_lt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::testing::*;
    use shoal_common::{BackendKind, GpuSharing, GpuVendor, WorkerLiveness};

    fn inventory(snaps: Vec<WorkerSnapshot>) -> InventorySnapshot {
        let mut inv = InventorySnapshot::default();
        for s in snaps {
            inv.insert(s);
        }
        inv
    }

    fn offline(mut w: Worker) -> Worker {
        w.liveness = WorkerLiveness::Offline;
        w
    }

    fn assigned(worker_id: &str, gpus: &[u32]) -> PlacementDecision {
        PlacementDecision::Assigned(Assignment {
            worker_id: worker_id.to_string(),
            gpu_indices: gpus.to_vec(),
        })
    }

    #[test]
    fn test_spread_prefers_least_loaded_then_lowest_id() {
        let inv = inventory(vec![
            snapshot(worker("b", &[16_384, 16_384]), vec![]),
            snapshot(
                worker("a", &[16_384, 16_384]),
                vec![alloc("x", &[0], 1_000, GpuSharing::Exclusive)],
            ),
            snapshot(worker("c", &[16_384, 16_384]), vec![]),
        ]);
        let none = PlacementConstraints::default();
        assert_eq!(
            place(&gpu_request(1, 8_192), &none, &inv, PlacementPolicy::Spread),
            assigned("b", &[0])
        );
        assert_eq!(
            place(&gpu_request(1, 8_192), &none, &inv, PlacementPolicy::Binpack),
            assigned("a", &[1])
        );
    }

    #[test]
    fn test_placement_is_deterministic() {
        let inv = inventory(vec![
            snapshot(worker("w2", &[24_576]), vec![]),
            snapshot(worker("w1", &[24_576]), vec![]),
        ]);
        let none = PlacementConstraints::default();
        let first = place(&gpu_request(1, 8_192), &none, &inv, PlacementPolicy::Spread);
        for _ in 0..10 {
            assert_eq!(place(&gpu_request(1, 8_192), &none, &inv, PlacementPolicy::Spread), first);
        }
        assert_eq!(first, assigned("w1", &[0]));
    }

    #[test]
    fn test_infeasible_reasons() {
        let none = PlacementConstraints::default();

        let inv = inventory(vec![snapshot(offline(worker("a", &[16_384])), vec![])]);
        assert_eq!(
            place(&gpu_request(1, 8_192), &none, &inv, PlacementPolicy::Spread),
            PlacementDecision::Infeasible(InfeasibleReason::NoMatchingWorker)
        );

        let inv = inventory(vec![snapshot(
            worker("a", &[16_384]),
            vec![alloc("x", &[0], 8_192, GpuSharing::Exclusive)],
        )]);
        assert_eq!(
            place(&gpu_request(1, 8_192), &none, &inv, PlacementPolicy::Spread),
            PlacementDecision::Infeasible(InfeasibleReason::InsufficientCapacity)
        );

        let inv = inventory(vec![
            snapshot(worker("a", &[16_384]), vec![]),
            snapshot(offline(worker("b", &[24_576])), vec![]),
        ]);
        assert_eq!(
            place(&gpu_request(1, 32_768), &none, &inv, PlacementPolicy::Spread),
            PlacementDecision::Infeasible(InfeasibleReason::Unsatisfiable)
        );

        assert_eq!(
            place(&gpu_request(1, 8_192), &none, &InventorySnapshot::default(), PlacementPolicy::Spread),
            PlacementDecision::Infeasible(InfeasibleReason::NoMatchingWorker)
        );
    }

    #[test]
    fn test_worker_pin_and_labels() {
        let mut labelled = worker("b", &[16_384]);
        labelled.labels.insert("zone".to_string(), "east".to_string());
        let inv = inventory(vec![
            snapshot(worker("a", &[16_384]), vec![]),
            snapshot(labelled, vec![]),
        ]);

        let pinned = PlacementConstraints {
            worker_pin: Some("b".to_string()),
            ..Default::default()
        };
        assert_eq!(
            place(&gpu_request(1, 8_192), &pinned, &inv, PlacementPolicy::Spread),
            assigned("b", &[0])
        );

        let east = PlacementConstraints {
            label_selector: [("zone".to_string(), "east".to_string())].into(),
            ..Default::default()
        };
        assert_eq!(
            place(&gpu_request(1, 8_192), &east, &inv, PlacementPolicy::Spread),
            assigned("b", &[0])
        );

        let west = PlacementConstraints {
            label_selector: [("zone".to_string(), "west".to_string())].into(),
            ..Default::default()
        };
        assert_eq!(
            place(&gpu_request(1, 8_192), &west, &inv, PlacementPolicy::Spread),
            PlacementDecision::Infeasible(InfeasibleReason::NoMatchingWorker)
        );
    }

    #[test]
    fn test_backend_compatibility() {
        let mut ascend = worker("a", &[32_768]);
        ascend.inventory.gpus[0].vendor = GpuVendor::Ascend;
        let inv = inventory(vec![snapshot(ascend, vec![]), snapshot(worker("b", &[16_384]), vec![])]);
        let none = PlacementConstraints::default();

        let vllm = ResourceRequest {
            backend: Some(BackendKind::Vllm),
            ..gpu_request(1, 8_192)
        };
        assert_eq!(place(&vllm, &none, &inv, PlacementPolicy::Spread), assigned("b", &[0]));

        let mindie = ResourceRequest {
            backend: Some(BackendKind::AscendMindie),
            ..gpu_request(1, 8_192)
        };
        assert_eq!(place(&mindie, &none, &inv, PlacementPolicy::Spread), assigned("a", &[0]));

        let vox_multi = ResourceRequest {
            backend: Some(BackendKind::VoxBox),
            ..gpu_request(2, 1_024)
        };
        assert_eq!(
            place(&vox_multi, &none, &inv, PlacementPolicy::Spread),
            PlacementDecision::Infeasible(InfeasibleReason::Unsatisfiable)
        );
    }

    #[test]
    fn test_cpu_only_request() {
        let inv = inventory(vec![snapshot(worker("cpu", &[]), vec![])]);
        let req = ResourceRequest {
            host_memory_mb: 4_096,
            backend: Some(BackendKind::LlamaBox),
            ..Default::default()
        };
        assert_eq!(
            place(&req, &PlacementConstraints::default(), &inv, PlacementPolicy::Spread),
            assigned("cpu", &[])
        );
    }

    #[test]
    fn test_parse_policy() {
        assert_eq!("binpack".parse::<PlacementPolicy>(), Ok(PlacementPolicy::Binpack));
        assert_eq!("Spread".parse::<PlacementPolicy>(), Ok(PlacementPolicy::Spread));
        assert!("random".parse::<PlacementPolicy>().is_err());
    }
}
