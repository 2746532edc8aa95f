// tests/integration/s5_suspicion_test.rs

//! S5 — suspicion and requeue: a runner that never accepts dispatch causes
//! the task to cross the suspicion threshold and fall back to PENDING,
//! suspicion counter cleared, free to be picked up again (spec.md §8, S5).

use std::time::Duration;

use serde_json::json;

use super::test_helpers::{FakeRunner, TestHost};

#[tokio::test]
async fn s5_failed_dispatch_requeues_after_threshold() {
    let host = TestHost::spawn(false).await;
    let bad_runner = FakeRunner::spawn().await;
    bad_runner.set_fail_execute(true);
    host.register_node("flaky", &bad_runner.address, 4, 1 << 33).await;

    let (status, task) = host
        .submit(
            "bob",
            "OPERATOR",
            json!({ "kind": "COMMAND", "command": "echo", "cores": 1 }),
        )
        .await;
    assert_eq!(status, reqwest::StatusCode::CREATED);
    let id = task["id"].as_i64().unwrap();

    // The dispatcher's suspicion_threshold is 2 and its health-check period
    // is 500ms in the test harness; it requeues to PENDING well within the
    // scheduler's own 2s re-pick cadence.
    let requeued = host
        .wait_for_task(id, Duration::from_secs(12), |t| {
            t["status"] == "PENDING" && t["assignment_suspicion_count"] == 0
        })
        .await;
    assert_eq!(requeued["status"], "PENDING");
    assert!(requeued["assigned_node"].is_null());
    assert_eq!(requeued["assignment_suspicion_count"], 0);

    // Once the runner heals, the next scheduler tick can pick the same
    // node back up and dispatch succeeds.
    bad_runner.set_fail_execute(false);
    let reassigned = host
        .wait_for_task(id, Duration::from_secs(12), |t| {
            t["status"] == "ASSIGNING" || t["status"] == "RUNNING"
        })
        .await;
    assert_eq!(reassigned["assigned_node"], "flaky");
}
