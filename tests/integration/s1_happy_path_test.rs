// tests/integration/s1_happy_path_test.rs

//! S1 — happy path, auto-select: two nodes, the most-free one wins, and the
//! task rides PENDING -> ASSIGNING -> RUNNING -> COMPLETED end to end over
//! real HTTP (spec.md §8, S1).

use std::time::Duration;

use serde_json::json;

use super::test_helpers::{FakeRunner, TestHost};

#[tokio::test]
async fn s1_happy_path_auto_select_runs_to_completion() {
    let host = TestHost::spawn(false).await;
    let runner_a = FakeRunner::spawn().await;
    let runner_b = FakeRunner::spawn().await;

    host.register_node("a", &runner_a.address, 8, 1 << 34).await;
    host.register_node("b", &runner_b.address, 4, 1 << 34).await;

    let (status, task) = host
        .submit(
            "alice",
            "OPERATOR",
            json!({
                "kind": "COMMAND",
                "command": "echo",
                "args": ["hi"],
                "cores": 2,
            }),
        )
        .await;
    assert_eq!(status, reqwest::StatusCode::CREATED);
    assert_eq!(task["status"], "PENDING");
    let id = task["id"].as_i64().unwrap();

    let assigned = host
        .wait_for_task(id, Duration::from_secs(6), |t| t["status"] == "ASSIGNING" || t["status"] == "RUNNING")
        .await;
    assert_eq!(assigned["assigned_node"], "a");

    // Node "a" has more free cores (8 vs 4), so the tie-break never needs to
    // fire, but the dispatcher should have delivered the execute call there.
    let delivered = host
        .wait_for_task(id, Duration::from_secs(6), |_| !runner_a.execute_calls.is_empty())
        .await;
    let _ = delivered;
    assert!(runner_a.execute_calls.contains_key(&id));
    assert!(runner_b.execute_calls.is_empty());

    // Runner reports RUNNING, then COMPLETED, via the callback API.
    let (status, _) = host
        .post_json(
            "/runner/task_status",
            json!({ "task_id": id, "status": "RUNNING" }),
        )
        .await;
    assert_eq!(status, reqwest::StatusCode::OK);

    let running = host.get_task(id).await;
    assert_eq!(running["status"], "RUNNING");
    assert_eq!(running["assigned_node"], "a");

    let (status, _) = host
        .post_json(
            "/runner/task_status",
            json!({ "task_id": id, "status": "COMPLETED", "exit_code": 0 }),
        )
        .await;
    assert_eq!(status, reqwest::StatusCode::OK);

    let completed = host.get_task(id).await;
    assert_eq!(completed["status"], "COMPLETED");
    assert_eq!(completed["exit_code"], 0);
    assert!(completed["completed_at"].is_string());
}
