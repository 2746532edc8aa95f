// tests/property/scheduler_invariants_test.rs

//! P1/P2/B1 — for any mix of node capacities and task core/GPU requests,
//! one scheduling pass never assigns more cores than a node declares and
//! never double-allocates a GPU index (spec.md §8, P1, P2, B1).

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use fleetd::scheduler::Scheduler;
use fleetd::store::{self, NodeRegistry, TaskStore};
use fleetd::types::{
    GpuDescriptor, GpuRequest, Liveness, Node, NodeCapacity, PrincipalTier, ResourceRequest, Task,
    TaskKind, TaskStatus,
};
use proptest::prelude::*;

fn blank_task(id: i64, cores: u32) -> Task {
    Task {
        id,
        batch_id: None,
        kind: TaskKind::Command,
        name: None,
        owner_id: "prop".into(),
        created_by_tier: PrincipalTier::Operator,
        approval_state: None,
        approver_id: None,
        approved_at: None,
        rejection_reason: None,
        command: "noop".into(),
        args: vec![],
        env: Default::default(),
        resources: ResourceRequest {
            cores,
            ..Default::default()
        },
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

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        ..ProptestConfig::default()
    })]

    /// P1: one scheduling pass never reserves more cores on a node than it
    /// declares, regardless of how many tasks compete for it. B1: a
    /// `cores = 0` request never filters a node out, so it must always be
    /// included among the assigned set when capacity allows (it always
    /// does, since 0 never consumes any).
    #[test]
    fn p1_never_overcommits_declared_cores(
        declared_cores in 1u32..33,
        request_cores in prop::collection::vec(0u32..9, 1..20),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let conn = store::open_in_memory().unwrap();
            let tasks = Arc::new(TaskStore::load(conn.clone()).unwrap());
            let nodes = Arc::new(NodeRegistry::load(conn).unwrap());
            let reported = Arc::new(DashMap::new());

            nodes
                .upsert(Node {
                    hostname: "n".into(),
                    address: "n.local".into(),
                    capacity: NodeCapacity {
                        cores: declared_cores,
                        memory_bytes: u64::MAX,
                        gpus: vec![],
                        numa: vec![],
                    },
                    last_heartbeat: Utc::now(),
                    liveness: Liveness::Online,
                    vm_capable: false,
                    runner_version: "t".into(),
                    overlay: None,
                    labels: Default::default(),
                })
                .await
                .unwrap();

            for (i, cores) in request_cores.iter().enumerate() {
                tasks.create(blank_task(i as i64 + 1, *cores)).await.unwrap();
            }

            let scheduler = Scheduler::new(tasks.clone(), nodes.clone(), reported);
            scheduler.tick().await;

            let assigned = tasks
                .snapshot()
                .await
                .into_iter()
                .filter(|t| t.status == TaskStatus::Assigning)
                .collect::<Vec<_>>();
            let total: u32 = assigned.iter().map(|t| t.resources.cores).sum();
            prop_assert!(total <= declared_cores);

            // Every zero-core request must have been assigned: it never
            // consumes capacity, so it can never be the reason a node was
            // filtered out (B1).
            let zero_core_ids: Vec<i64> = request_cores
                .iter()
                .enumerate()
                .filter(|(_, c)| **c == 0)
                .map(|(i, _)| i as i64 + 1)
                .collect();
            for id in zero_core_ids {
                let t = tasks.get(id).await.unwrap();
                prop_assert_eq!(t.status, TaskStatus::Assigning);
            }
        });
    }

    /// P2: distinct tasks assigned to the same node in one pass never share
    /// a GPU index, whether requested by count or by explicit index list.
    #[test]
    fn p2_gpu_allocations_are_disjoint(
        gpu_count in 1u32..9,
        requests in prop::collection::vec(0u32..3, 1..10),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let conn = store::open_in_memory().unwrap();
            let tasks = Arc::new(TaskStore::load(conn.clone()).unwrap());
            let nodes = Arc::new(NodeRegistry::load(conn).unwrap());
            let reported = Arc::new(DashMap::new());

            nodes
                .upsert(Node {
                    hostname: "n".into(),
                    address: "n.local".into(),
                    capacity: NodeCapacity {
                        cores: 64,
                        memory_bytes: u64::MAX,
                        gpus: (0..gpu_count)
                            .map(|i| GpuDescriptor { index: i, vfio_eligible: false, model: None })
                            .collect(),
                        numa: vec![],
                    },
                    last_heartbeat: Utc::now(),
                    liveness: Liveness::Online,
                    vm_capable: false,
                    runner_version: "t".into(),
                    overlay: None,
                    labels: Default::default(),
                })
                .await
                .unwrap();

            for (i, gpus_wanted) in requests.iter().enumerate() {
                let mut t = blank_task(i as i64 + 1, 1);
                t.resources.gpu = GpuRequest::Count(*gpus_wanted);
                tasks.create(t).await.unwrap();
            }

            let scheduler = Scheduler::new(tasks.clone(), nodes.clone(), reported);
            scheduler.tick().await;

            let assigned = tasks
                .snapshot()
                .await
                .into_iter()
                .filter(|t| t.status == TaskStatus::Assigning)
                .collect::<Vec<_>>();

            for (i, a) in assigned.iter().enumerate() {
                for b in assigned.iter().skip(i + 1) {
                    prop_assert!(a.required_gpus.is_disjoint(&b.required_gpus));
                }
            }
        });
    }
}
