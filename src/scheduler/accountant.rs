//! Computes available CPU/memory/GPU per node from declared capacity minus
//! the sum of live task reservations (§4.3 "Availability accounting").

use std::collections::{BTreeSet, HashMap};

use crate::types::{GpuRequest, Node, Task};

#[derive(Debug, Clone, Default)]
pub struct Availability {
    pub available_cores: i64,
    pub available_memory_bytes: i64,
    pub free_gpus: BTreeSet<u32>,
}

/// Snapshot of telemetry reported by the most recent heartbeat from each
/// node, used to take the max against declared reservations for memory
/// accounting (spec.md §4.3).
#[derive(Debug, Clone, Default)]
pub struct ReportedUsage {
    pub used_memory_bytes: HashMap<String, u64>,
}

/// Recomputes availability for every node from scratch given the current
/// task snapshot. Called once per scheduling tick; cheap relative to the
/// network/dispatch work it gates.
pub fn compute(
    nodes: &[Node],
    tasks: &[Task],
    reported: &ReportedUsage,
) -> HashMap<String, Availability> {
    let mut reserved_cores: HashMap<&str, i64> = HashMap::new();
    let mut reserved_memory: HashMap<&str, i64> = HashMap::new();
    let mut allocated_gpus: HashMap<&str, BTreeSet<u32>> = HashMap::new();

    for task in tasks {
        if !task.status.is_live_reservation() {
            continue;
        }
        let Some(node) = task.assigned_node.as_deref() else {
            continue;
        };
        *reserved_cores.entry(node).or_insert(0) += task.resources.cores as i64;
        if let Some(mem) = task.resources.memory_bytes {
            *reserved_memory.entry(node).or_insert(0) += mem as i64;
        }
        allocated_gpus
            .entry(node)
            .or_default()
            .extend(task.required_gpus.iter().copied());
    }

    nodes
        .iter()
        .map(|node| {
            let hostname = node.hostname.as_str();
            let declared_cores = node.capacity.cores as i64;
            let declared_memory = node.capacity.memory_bytes as i64;

            let used_cores = reserved_cores.get(hostname).copied().unwrap_or(0);
            let reserved_mem = reserved_memory.get(hostname).copied().unwrap_or(0);
            let reported_mem = reported
                .used_memory_bytes
                .get(hostname)
                .copied()
                .unwrap_or(0) as i64;
            let used_memory = reserved_mem.max(reported_mem);

            let declared_gpus = node.declared_gpu_indices();
            let used_gpus = allocated_gpus.get(hostname).cloned().unwrap_or_default();
            let free_gpus = declared_gpus.difference(&used_gpus).copied().collect();

            (
                node.hostname.clone(),
                Availability {
                    available_cores: declared_cores - used_cores,
                    available_memory_bytes: declared_memory - used_memory,
                    free_gpus,
                },
            )
        })
        .collect()
}

/// Whether `avail` can satisfy `gpu` on `node` (§4.3, B2). Explicit index
/// requests must match exactly: if any requested index is already
/// allocated (or never declared), there is no silent substitution.
pub fn gpu_satisfiable(node: &Node, avail: &Availability, gpu: &GpuRequest) -> bool {
    match gpu {
        GpuRequest::None => true,
        GpuRequest::Count(n) => avail.free_gpus.len() as u32 >= *n,
        GpuRequest::Indices(indices) => {
            let declared = node.declared_gpu_indices();
            indices.is_subset(&declared) && indices.is_subset(&avail.free_gpus)
        }
    }
}
