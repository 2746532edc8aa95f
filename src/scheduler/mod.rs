//! Parses target specifications, selects a node, allocates specific GPU
//! indices, and marks the task ASSIGNING (§4.3).

pub mod accountant;
pub mod target;

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, info};

use crate::error::Result;
use crate::metrics;
use crate::store::{NodeRegistry, TaskQuery, TaskStore};
use crate::types::{GpuRequest, Liveness, Node, Task, TaskStatus};

pub use accountant::{Availability, ReportedUsage};
pub use target::{TargetSpec, parse_target};

/// Shared, process-wide view of each node's most recently heartbeated
/// memory usage, consulted by the Resource Accountant (§4.3) and updated
/// by the heartbeat handler.
pub type ReportedMemory = Arc<DashMap<String, u64>>;

pub struct Scheduler {
    tasks: Arc<TaskStore>,
    nodes: Arc<NodeRegistry>,
    reported_memory: ReportedMemory,
}

impl Scheduler {
    pub fn new(tasks: Arc<TaskStore>, nodes: Arc<NodeRegistry>, reported_memory: ReportedMemory) -> Self {
        Self {
            tasks,
            nodes,
            reported_memory,
        }
    }

    /// Runs one scheduling pass: every PENDING task is considered in
    /// submission order, against a view of availability that is updated
    /// in-place as tasks are assigned within this same pass so two PENDING
    /// tasks in one tick never overcommit the same node.
    pub async fn tick(&self) -> Vec<Task> {
        metrics::SCHEDULER_SWEEPS_TOTAL.inc();

        let mut pending = self
            .tasks
            .query(&TaskQuery {
                statuses: Some([TaskStatus::Pending].into_iter().collect()),
                ..Default::default()
            })
            .await;
        pending.sort_by_key(|t| t.submitted_at);
        if pending.is_empty() {
            return Vec::new();
        }

        let all_nodes = self.nodes.snapshot().await;
        let online_nodes: Vec<Node> = all_nodes
            .into_iter()
            .filter(|n| n.liveness == Liveness::Online)
            .collect();
        let all_tasks = self.tasks.snapshot().await;

        let reported = ReportedUsage {
            used_memory_bytes: self
                .reported_memory
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
        };
        let mut availability = accountant::compute(&online_nodes, &all_tasks, &reported);

        let mut assigned = Vec::new();
        for task in pending {
            if let Some(selection) = select_node(&task, &online_nodes, &availability) {
                let Availability {
                    available_cores,
                    available_memory_bytes,
                    free_gpus,
                } = availability.get(&selection.hostname).cloned().unwrap();

                let gpus = allocate_gpus(&task.resources.gpu, &free_gpus);

                let patched = self
                    .tasks
                    .update(task.id, |t| {
                        t.status = TaskStatus::Assigning;
                        t.assigned_node = Some(selection.hostname.clone());
                        t.required_gpus = gpus.clone();
                        t.assignment_suspicion_count = 0;
                        Ok(())
                    })
                    .await;

                match patched {
                    Ok(updated) => {
                        info!(task_id = updated.id, node = %selection.hostname, "task assigned");
                        // Update the in-pass availability view so later
                        // tasks this tick see the reservation just made.
                        if let Some(a) = availability.get_mut(&selection.hostname) {
                            a.available_cores = available_cores - updated.resources.cores as i64;
                            a.available_memory_bytes = available_memory_bytes
                                - updated.resources.memory_bytes.unwrap_or(0) as i64;
                            a.free_gpus = free_gpus.difference(&gpus).copied().collect();
                        }
                        assigned.push(updated);
                    }
                    Err(e) => {
                        debug!(task_id = task.id, error = %e, "failed to commit assignment");
                    }
                }
            }
        }

        assigned
    }
}

struct Selection {
    hostname: String,
}

/// Candidate filter + selection (§4.3). Nodes are sorted by available
/// cores descending; hostname ascending breaks ties deterministically.
fn select_node(
    task: &Task,
    nodes: &[Node],
    availability: &std::collections::HashMap<String, Availability>,
) -> Option<Selection> {
    let mut candidates: Vec<&Node> = nodes
        .iter()
        .filter(|node| {
            if let Some(pinned) = &task.requested_node
                && &node.hostname != pinned
            {
                return false;
            }
            let Some(avail) = availability.get(&node.hostname) else {
                return false;
            };
            if task.resources.cores > 0 && avail.available_cores < task.resources.cores as i64 {
                return false;
            }
            if let Some(mem) = task.resources.memory_bytes
                && avail.available_memory_bytes < mem as i64
            {
                return false;
            }
            if !accountant::gpu_satisfiable(node, avail, &task.resources.gpu) {
                return false;
            }
            if let Some(numa) = task.resources.numa_node
                && !node.has_numa_node(numa)
            {
                return false;
            }
            true
        })
        .collect();

    candidates.sort_by(|a, b| {
        let a_cores = availability[&a.hostname].available_cores;
        let b_cores = availability[&b.hostname].available_cores;
        b_cores.cmp(&a_cores).then_with(|| a.hostname.cmp(&b.hostname))
    });

    candidates.first().map(|n| Selection {
        hostname: n.hostname.clone(),
    })
}

/// Picks the concrete GPU indices granted to a task. Explicit requests are
/// returned unchanged (the candidate filter already verified they are
/// free); a count request takes the lowest-numbered free indices so
/// allocation is deterministic.
fn allocate_gpus(request: &GpuRequest, free: &BTreeSet<u32>) -> BTreeSet<u32> {
    match request {
        GpuRequest::None => BTreeSet::new(),
        GpuRequest::Indices(indices) => indices.clone(),
        GpuRequest::Count(n) => free.iter().take(*n as usize).copied().collect(),
    }
}

/// Current UTC time; a single seam so scheduler accounting timestamps are
/// easy to stub in tests.
pub fn now() -> chrono::DateTime<Utc> {
    Utc::now()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GpuDescriptor, NodeCapacity, NumaNode, ResourceRequest};

    fn node(hostname: &str, cores: u32, memory: u64, gpus: &[u32]) -> Node {
        Node {
            hostname: hostname.to_string(),
            address: format!("{hostname}.local"),
            capacity: NodeCapacity {
                cores,
                memory_bytes: memory,
                gpus: gpus
                    .iter()
                    .map(|i| GpuDescriptor {
                        index: *i,
                        vfio_eligible: false,
                        model: None,
                    })
                    .collect(),
                numa: vec![NumaNode {
                    id: 0,
                    cpu_indices: (0..cores).collect(),
                    memory_bytes: memory,
                }],
            },
            last_heartbeat: Utc::now(),
            liveness: Liveness::Online,
            vm_capable: false,
            runner_version: "test".into(),
            overlay: None,
            labels: Default::default(),
        }
    }

    fn task_req(cores: u32) -> ResourceRequest {
        ResourceRequest {
            cores,
            ..Default::default()
        }
    }

    #[test]
    fn s1_happy_path_picks_most_free_node() {
        let a = node("a", 8, 1 << 30, &[]);
        let b = node("b", 4, 1 << 30, &[]);
        let nodes = vec![a, b];
        let tasks: Vec<Task> = Vec::new();
        let reported = ReportedUsage::default();
        let availability = accountant::compute(&nodes, &tasks, &reported);

        let mut task = sample_task(1, task_req(2));
        task.status = TaskStatus::Pending;
        let selection = select_node(&task, &nodes, &availability).unwrap();
        assert_eq!(selection.hostname, "a");
    }

    #[test]
    fn s2_gpu_contention() {
        let a = node("a", 8, 1 << 30, &[0, 1, 2, 3]);
        let mut t1 = sample_task(1, task_req(1));
        t1.status = TaskStatus::Running;
        t1.assigned_node = Some("a".into());
        t1.required_gpus = [0, 1].into_iter().collect();

        let nodes = vec![a.clone()];
        let tasks = vec![t1];
        let reported = ReportedUsage::default();
        let availability = accountant::compute(&nodes, &tasks, &reported);

        let mut t2 = sample_task(2, task_req(1));
        t2.status = TaskStatus::Pending;
        t2.resources.gpu = GpuRequest::Indices([0, 1].into_iter().collect());
        assert!(select_node(&t2, &nodes, &availability).is_none());

        let mut t3 = sample_task(3, task_req(1));
        t3.status = TaskStatus::Pending;
        t3.resources.gpu = GpuRequest::Indices([2].into_iter().collect());
        let selection = select_node(&t3, &nodes, &availability).unwrap();
        assert_eq!(selection.hostname, "a");
    }

    #[test]
    fn b1_zero_cores_never_filters_out() {
        let a = node("a", 1, 1024, &[]);
        let mut t1 = sample_task(1, task_req(1));
        t1.status = TaskStatus::Running;
        t1.assigned_node = Some("a".into());
        let nodes = vec![a];
        let tasks = vec![t1];
        let reported = ReportedUsage::default();
        let availability = accountant::compute(&nodes, &tasks, &reported);

        let mut t2 = sample_task(2, task_req(0));
        t2.status = TaskStatus::Pending;
        assert!(select_node(&t2, &nodes, &availability).is_some());
    }

    #[test]
    fn b2_explicit_index_outside_declared_set_fails() {
        let a = node("a", 8, 1 << 30, &[0, 1]);
        let nodes = vec![a];
        let tasks: Vec<Task> = Vec::new();
        let reported = ReportedUsage::default();
        let availability = accountant::compute(&nodes, &tasks, &reported);

        let mut t = sample_task(1, task_req(1));
        t.status = TaskStatus::Pending;
        t.resources.gpu = GpuRequest::Indices([5].into_iter().collect());
        assert!(select_node(&t, &nodes, &availability).is_none());
    }

    fn sample_task(id: i64, resources: ResourceRequest) -> Task {
        Task {
            id,
            batch_id: None,
            kind: crate::types::TaskKind::Command,
            name: None,
            owner_id: "u1".into(),
            created_by_tier: crate::types::PrincipalTier::Operator,
            approval_state: None,
            approver_id: None,
            approved_at: None,
            rejection_reason: None,
            command: "echo".into(),
            args: vec![],
            env: Default::default(),
            resources,
            environment_name: None,
            image_ref: None,
            mounts: vec![],
            privileged: false,
            vps_backend: None,
            ssh_port: None,
            vm_base_image: None,
            vm_disk_size_bytes: None,
            vm_ip: None,
            requested_node: None,
            status: TaskStatus::Pending,
            assigned_node: None,
            assignment_suspicion_count: 0,
            required_gpus: Default::default(),
            reserved_ip: None,
            exit_code: None,
            error_message: None,
            stdout_path: None,
            stderr_path: None,
            submitted_at: Utc::now(),
            started_at: None,
            completed_at: None,
            labels: Default::default(),
        }
    }
}
