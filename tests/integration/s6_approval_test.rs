// tests/integration/s6_approval_test.rs

//! S6 — approval flow: a USER-tier submission is held in PENDING_APPROVAL;
//! an operator rejection makes it terminal without ever dispatching; a
//! second submission approved by an admin proceeds to normal scheduling
//! (spec.md §8, S6).

use std::time::Duration;

use serde_json::json;

use super::test_helpers::{FakeRunner, TestHost};

#[tokio::test]
async fn s6_user_submission_is_gated_then_rejected() {
    let host = TestHost::spawn(true).await;
    let runner = FakeRunner::spawn().await;
    host.register_node("a", &runner.address, 4, 1 << 33).await;

    let (status, task) = host
        .submit(
            "carol",
            "USER",
            json!({ "kind": "COMMAND", "command": "echo", "cores": 1 }),
        )
        .await;
    assert_eq!(status, reqwest::StatusCode::CREATED);
    assert_eq!(task["status"], "PENDING_APPROVAL");
    assert_eq!(task["approval_state"], "PENDING");
    let id = task["id"].as_i64().unwrap();

    // Never dispatched while gated (T4): no execute call should ever land,
    // even after a window wide enough for the scheduler to have ticked.
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(runner.execute_calls.is_empty());

    let (status, rejected) = host
        .post_json(
            &format!("/api/v1/tasks/{id}/reject"),
            json!({ "reason": "quota" }),
        )
        .await;
    assert_eq!(status, reqwest::StatusCode::OK);
    assert_eq!(rejected["status"], "REJECTED");
    assert_eq!(rejected["rejection_reason"], "quota");
    assert_eq!(rejected["approval_state"], "REJECTED");
}

#[tokio::test]
async fn s6_approved_submission_schedules_normally() {
    let host = TestHost::spawn(true).await;
    let runner = FakeRunner::spawn().await;
    host.register_node("a", &runner.address, 4, 1 << 33).await;

    let (_, task) = host
        .submit(
            "carol",
            "USER",
            json!({ "kind": "COMMAND", "command": "echo", "cores": 1 }),
        )
        .await;
    let id = task["id"].as_i64().unwrap();

    let (status, approved) = host
        .post_json(&format!("/api/v1/tasks/{id}/approve"), json!({}))
        .await;
    assert_eq!(status, reqwest::StatusCode::OK);
    assert_eq!(approved["status"], "PENDING");
    assert_eq!(approved["approval_state"], "APPROVED");

    let scheduled = host
        .wait_for_task(id, Duration::from_secs(6), |t| {
            t["status"] == "ASSIGNING" || t["status"] == "RUNNING"
        })
        .await;
    assert_eq!(scheduled["assigned_node"], "a");
}
