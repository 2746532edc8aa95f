// tests/integration/s3_vps_recovery_test.rs

//! S3 — heartbeat-loss recovery half: a VPS task marked LOST (the detection
//! half of §4.5 is covered by `liveness.rs`'s own unit test) transitions
//! back to RUNNING with `completed_at` cleared once a heartbeat from its
//! runner lists the task id in `running_tasks` (spec.md §8, S3; §4.5).

use std::time::Duration;

use serde_json::json;

use fleetd::types::TaskStatus;

use super::test_helpers::{FakeRunner, TestHost};

#[tokio::test]
async fn s3_lost_vps_recovers_to_running_via_heartbeat() {
    let host = TestHost::spawn(false).await;
    let runner = FakeRunner::spawn().await;
    host.register_node("r", &runner.address, 4, 1 << 33).await;

    let (status, task) = host
        .submit(
            "alice",
            "OPERATOR",
            json!({
                "kind": "VPS",
                "command": "sshd",
                "vps_backend": "CONTAINER",
                "cores": 1,
            }),
        )
        .await;
    assert_eq!(status, reqwest::StatusCode::CREATED);
    let id = task["id"].as_i64().unwrap();

    host.wait_for_task(id, Duration::from_secs(6), |t| t["assigned_node"] == "r")
        .await;

    let (status, _) = host
        .post_json("/runner/task_status", json!({ "task_id": id, "status": "RUNNING" }))
        .await;
    assert_eq!(status, reqwest::StatusCode::OK);

    // Simulate the liveness sweep's own mutation (§4.5) directly rather than
    // waiting out the real 30s heartbeat timeout: mark the node's task LOST
    // with completed_at set, exactly as `LivenessMonitor::sweep` would.
    host.state
        .status
        .transition(id, TaskStatus::Lost, |t| {
            t.completed_at = Some(chrono::Utc::now());
        })
        .await
        .unwrap();

    let lost = host.get_task(id).await;
    assert_eq!(lost["status"], "LOST");
    assert!(lost["completed_at"].is_string());

    // The runner resumes heartbeating and lists the VPS id as still running.
    let (status, _) = host
        .post_json(
            "/runner/heartbeat",
            json!({
                "hostname": "r",
                "running_tasks": [id],
                "killed_tasks": [],
                "cpu_percent": 1.0,
                "memory_used_bytes": 0,
                "memory_percent": 0.0,
                "gpu_metrics": [],
                "vm_capable": false,
                "runner_version": "test",
            }),
        )
        .await;
    assert_eq!(status, reqwest::StatusCode::OK);

    let recovered = host.get_task(id).await;
    assert_eq!(recovered["status"], "RUNNING");
    assert!(recovered["completed_at"].is_null());

    let node = host
        .state
        .nodes
        .get("r")
        .await
        .expect("node r should still be registered");
    assert_eq!(node.liveness, fleetd::types::Liveness::Online);
}
