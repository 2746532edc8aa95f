// tests/integration/s4_ip_reservation_test.rs

//! S4 — IP reservation round-trip: reserve an address on a runner's overlay
//! subnet ahead of submission, submit a task carrying the token, and
//! confirm the scheduler pins it to that runner and records the reserved
//! address (spec.md §8, S4; R1).

use chrono::Utc;
use fleetd::config::OverlaySubnetLayout;
use fleetd::types::{Liveness, NodeCapacity, OverlayAllocation};
use serde_json::json;

use super::test_helpers::{FakeRunner, TestHost};

async fn node_with_overlay(
    host: &TestHost,
    hostname: &str,
    address: &str,
    runner_id: u32,
) -> fleetd::types::Node {
    let layout = OverlaySubnetLayout::parse("10.128.0.0/9/9/14").unwrap();
    let subnet = layout.runner_subnet(runner_id);
    let node = fleetd::types::Node {
        hostname: hostname.into(),
        address: address.into(),
        capacity: NodeCapacity {
            cores: 8,
            memory_bytes: 1 << 34,
            gpus: vec![],
            numa: vec![],
        },
        last_heartbeat: Utc::now(),
        liveness: Liveness::Online,
        vm_capable: false,
        runner_version: "test".into(),
        overlay: Some(OverlayAllocation {
            runner_id,
            subnet,
            gateway_ip: subnet.nth(1),
            vni: 100 + runner_id,
            tunnel_endpoint: format!("fleetd-ovl-{runner_id}"),
            runner_physical_ip: "10.0.0.9".into(),
            last_active: Utc::now(),
            placeholder: false,
        }),
        labels: Default::default(),
    };
    host.state.nodes.upsert(node.clone()).await.unwrap();
    node
}

#[tokio::test]
async fn s4_reservation_pins_task_to_reserved_runner_and_ip() {
    let host = TestHost::spawn(false).await;
    let runner = FakeRunner::spawn().await;
    node_with_overlay(&host, "r2", &runner.address, 2).await;

    let (status, body) = host
        .post_json("/api/v1/overlay/reservations", json!({ "runner": "r2" }))
        .await;
    assert_eq!(status, reqwest::StatusCode::OK);
    let token = body["token"].as_str().unwrap().to_string();

    // The reserved address must come from r2's subnet (10.128.128.0/18) and
    // must exclude the gateway (10.128.128.1) and the host's address on
    // that subnet (10.128.191.254).
    let reservations = host
        .post_json("/api/v1/overlay/reservations", json!({}))
        .await;
    let _ = reservations;

    let (status, task) = host
        .submit(
            "alice",
            "OPERATOR",
            json!({
                "kind": "COMMAND",
                "command": "sleep",
                "args": ["1"],
                "cores": 1,
                "reservation_token": token,
            }),
        )
        .await;
    assert_eq!(status, reqwest::StatusCode::CREATED);
    let id = task["id"].as_i64().unwrap();

    let running_or_assigned = host
        .wait_for_task(id, std::time::Duration::from_secs(6), |t| {
            t["status"] == "ASSIGNING" || t["status"] == "RUNNING"
        })
        .await;
    assert_eq!(running_or_assigned["assigned_node"], "r2");
    let reserved_ip = running_or_assigned["reserved_ip"].as_str().unwrap();
    assert!(reserved_ip.starts_with("10.128.128."));
    assert_ne!(reserved_ip, "10.128.128.1");
    assert_ne!(reserved_ip, "10.128.191.254");

    // Releasing the token invalidates it for future submissions.
    let (status, _) = host
        .post_json("/api/v1/overlay/reservations/release", json!({ "token": token }))
        .await;
    assert_eq!(status, reqwest::StatusCode::NO_CONTENT);
    let (status, _) = host
        .post_json("/api/v1/overlay/reservations/release", json!({ "token": token }))
        .await;
    assert_eq!(status, reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn s4_reserve_twice_yields_distinct_ips() {
    let host = TestHost::spawn(false).await;
    let runner = FakeRunner::spawn().await;
    node_with_overlay(&host, "r3", &runner.address, 3).await;

    let (_, first) = host
        .post_json("/api/v1/overlay/reservations", json!({ "runner": "r3" }))
        .await;
    let (_, second) = host
        .post_json("/api/v1/overlay/reservations", json!({ "runner": "r3" }))
        .await;
    assert_ne!(first["token"], second["token"]);

    let list = host
        .state
        .reservations
        .list();
    assert_eq!(list.len(), 2);
    assert_ne!(list[0].ip, list[1].ip);
}
