// tests/integration/test_helpers.rs

//! Shared scaffolding for end-to-end Host tests: spins up a real Host
//! (background loops included) on a loopback TCP port, plus one or more
//! "fake runner" HTTP servers standing in for the Runner Agent side of the
//! Host<->Runner RPCs (§6.1). Both sides talk real HTTP over real sockets
//! rather than mocking request dispatch.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use dashmap::DashMap;
use fleetd::config::Config;
use fleetd::dispatcher::{Dispatcher, DispatcherConfig};
use fleetd::host::{self, HostState};
use fleetd::ids::IdGenerator;
use fleetd::liveness::LivenessMonitor;
use fleetd::reservation::ReservationManager;
use fleetd::scheduler::Scheduler;
use fleetd::status::StatusAuthority;
use fleetd::store::{self, NodeRegistry, TaskStore};
use fleetd::transport::{ControlRequest, ControlResponse, ExecuteRequest};
use fleetd::types::{Liveness, Node, NodeCapacity};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// A running Host, reachable at `base_url`, with its background loops
/// (scheduler/dispatcher/liveness/reservation sweeps) active.
pub struct TestHost {
    pub base_url: String,
    pub state: HostState,
    client: reqwest::Client,
    _shutdown: broadcast::Sender<()>,
}

impl TestHost {
    /// Builds a Host with fast dispatch timeouts (so suspicion and
    /// dispatch tests don't need to wait out the 30s/60s production
    /// defaults) and the given auth setting.
    pub async fn spawn(auth_enabled: bool) -> Self {
        let conn = store::open_in_memory().unwrap();
        let tasks = Arc::new(TaskStore::load(conn.clone()).unwrap());
        let nodes = Arc::new(NodeRegistry::load(conn).unwrap());
        let status = Arc::new(StatusAuthority::new(tasks.clone()));
        let reported_memory = Arc::new(DashMap::new());
        let scheduler = Arc::new(Scheduler::new(tasks.clone(), nodes.clone(), reported_memory.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            tasks.clone(),
            nodes.clone(),
            status.clone(),
            DispatcherConfig {
                command_timeout: Duration::from_millis(500),
                vps_timeout: Duration::from_millis(500),
                suspicion_threshold: 2,
            },
        ));
        let liveness = Arc::new(LivenessMonitor::new(
            nodes.clone(),
            tasks.clone(),
            status.clone(),
            Duration::from_secs(30),
            Duration::from_secs(1),
        ));
        let reservations = Arc::new(ReservationManager::new(
            nodes.clone(),
            b"test-hmac-secret".to_vec(),
            Duration::from_secs(300),
            Duration::from_secs(60),
        ));

        let mut config = Config::default();
        config.auth_enabled = auth_enabled;
        config.port = 0;

        let state = HostState {
            config: Arc::new(config),
            tasks,
            nodes,
            status,
            scheduler,
            dispatcher,
            liveness,
            overlay: None,
            reservations,
            ids: Arc::new(IdGenerator::new(0)),
            reported_memory,
        };

        let (shutdown_tx, _) = broadcast::channel(4);
        host::spawner::spawn_all(&state, &shutdown_tx);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = host::server::router(state.clone());
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    shutdown_rx.recv().await.ok();
                })
                .await
                .ok();
        });

        Self {
            base_url: format!("http://{addr}"),
            state,
            client: reqwest::Client::new(),
            _shutdown: shutdown_tx,
        }
    }

    pub async fn register_node(&self, hostname: &str, address: &str, cores: u32, memory_bytes: u64) {
        self.state
            .nodes
            .upsert(Node {
                hostname: hostname.into(),
                address: address.into(),
                capacity: NodeCapacity {
                    cores,
                    memory_bytes,
                    gpus: vec![],
                    numa: vec![],
                },
                last_heartbeat: Utc::now(),
                liveness: Liveness::Online,
                vm_capable: false,
                runner_version: "test-runner".into(),
                overlay: None,
                labels: BTreeMap::new(),
            })
            .await
            .unwrap();
    }

    pub async fn register_node_with_gpus(&self, hostname: &str, address: &str, cores: u32, gpus: &[u32]) {
        self.state
            .nodes
            .upsert(Node {
                hostname: hostname.into(),
                address: address.into(),
                capacity: NodeCapacity {
                    cores,
                    memory_bytes: 1 << 34,
                    gpus: gpus
                        .iter()
                        .map(|&index| fleetd::types::GpuDescriptor {
                            index,
                            vfio_eligible: false,
                            model: None,
                        })
                        .collect(),
                    numa: vec![],
                },
                last_heartbeat: Utc::now(),
                liveness: Liveness::Online,
                vm_capable: false,
                runner_version: "test-runner".into(),
                overlay: None,
                labels: BTreeMap::new(),
            })
            .await
            .unwrap();
    }

    pub async fn submit(&self, owner: &str, tier: &str, body: Value) -> (StatusCode, Value) {
        let resp = self
            .client
            .post(format!("{}/api/v1/tasks", self.base_url))
            .header("x-owner-id", owner)
            .header("x-principal-tier", tier)
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = resp.status();
        (status, resp.json().await.unwrap())
    }

    pub async fn get_task(&self, id: i64) -> Value {
        self.client
            .get(format!("{}/api/v1/tasks/{id}", self.base_url))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    pub async fn post_empty(&self, path: &str) -> StatusCode {
        self.client
            .post(format!("{}{path}", self.base_url))
            .send()
            .await
            .unwrap()
            .status()
    }

    pub async fn post_json(&self, path: &str, body: Value) -> (StatusCode, Value) {
        let resp = self
            .client
            .post(format!("{}{path}", self.base_url))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = resp.status();
        let text = resp.text().await.unwrap();
        let value = serde_json::from_str(&text).unwrap_or(Value::Null);
        (status, value)
    }

    /// Polls `get_task` until `pred` holds or `timeout` elapses, returning
    /// the last observed value. Scheduler/dispatcher loops tick on their own
    /// fixed cadence, so scenario tests wait rather than assume instant
    /// transitions.
    pub async fn wait_for_task(
        &self,
        id: i64,
        timeout: Duration,
        pred: impl Fn(&Value) -> bool,
    ) -> Value {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let task = self.get_task(id).await;
            if pred(&task) {
                return task;
            }
            if tokio::time::Instant::now() >= deadline {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

/// A fake Runner Agent: answers the Host's dispatch/control RPCs over a
/// real loopback socket without ever touching a container runtime.
pub struct FakeRunner {
    pub address: String,
    pub execute_calls: Arc<DashMap<i64, ExecuteRequest>>,
    fail_execute: Arc<AtomicBool>,
    _shutdown: broadcast::Sender<()>,
}

#[derive(Clone)]
struct FakeRunnerState {
    execute_calls: Arc<DashMap<i64, ExecuteRequest>>,
    fail_execute: Arc<AtomicBool>,
}

impl FakeRunner {
    pub async fn spawn() -> Self {
        let execute_calls = Arc::new(DashMap::new());
        let fail_execute = Arc::new(AtomicBool::new(false));
        let state = FakeRunnerState {
            execute_calls: execute_calls.clone(),
            fail_execute: fail_execute.clone(),
        };

        let app = Router::new()
            .route("/rpc/execute", post(fake_execute))
            .route("/rpc/kill", post(fake_control_ok))
            .route("/rpc/unmark_inflight", post(fake_control_ok))
            .route("/rpc/pause", post(fake_control_ok))
            .route("/rpc/resume", post(fake_control_ok))
            .route("/rpc/vps_stop", post(fake_control_ok))
            .route("/rpc/vps_restart", post(fake_control_ok))
            .with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, _) = broadcast::channel(1);
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    shutdown_rx.recv().await.ok();
                })
                .await
                .ok();
        });

        Self {
            address: addr.to_string(),
            execute_calls,
            fail_execute,
            _shutdown: shutdown_tx,
        }
    }

    /// Makes every subsequent `/rpc/execute` call return an error, to drive
    /// the suspicion/requeue path (S5) without a real runner failure.
    pub fn set_fail_execute(&self, fail: bool) {
        self.fail_execute.store(fail, Ordering::SeqCst);
    }
}

async fn fake_execute(
    State(state): State<FakeRunnerState>,
    Json(req): Json<ExecuteRequest>,
) -> Result<StatusCode, StatusCode> {
    if state.fail_execute.load(Ordering::SeqCst) {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    state.execute_calls.insert(req.task_id, req);
    Ok(StatusCode::ACCEPTED)
}

async fn fake_control_ok(
    State(_state): State<FakeRunnerState>,
    Json(_req): Json<ControlRequest>,
) -> Json<ControlResponse> {
    Json(ControlResponse { accepted: true })
}
