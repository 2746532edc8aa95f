//! The Host process: central scheduler, node registry, status authority,
//! dispatcher, overlay hub, and IP reservation issuer.

pub mod metrics_server;
pub mod server;
pub mod spawner;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tracing::info;

use crate::config::Config;
use crate::dispatcher::{Dispatcher, DispatcherConfig};
use crate::ids::IdGenerator;
use crate::liveness::LivenessMonitor;
use crate::metrics;
use crate::overlay::netlink::CliNetlinkGateway;
use crate::overlay::OverlayAllocator;
use crate::reservation::ReservationManager;
use crate::scheduler::{ReportedMemory, Scheduler};
use crate::status::StatusAuthority;
use crate::store::{self, NodeRegistry, TaskStore};

/// Everything an axum handler or a background loop needs; cloned cheaply
/// since every field is an `Arc`.
#[derive(Clone)]
pub struct HostState {
    pub config: Arc<Config>,
    pub tasks: Arc<TaskStore>,
    pub nodes: Arc<NodeRegistry>,
    pub status: Arc<StatusAuthority>,
    pub scheduler: Arc<Scheduler>,
    pub dispatcher: Arc<Dispatcher>,
    pub liveness: Arc<LivenessMonitor>,
    pub overlay: Option<Arc<OverlayAllocator>>,
    pub reservations: Arc<ReservationManager>,
    pub ids: Arc<IdGenerator>,
    pub reported_memory: ReportedMemory,
}

pub async fn run(config: Config) -> Result<()> {
    let conn = store::open(&config.storage.db_path).context("failed to open task store")?;
    let tasks = Arc::new(TaskStore::load(conn.clone()).context("failed to load tasks")?);
    let nodes = Arc::new(NodeRegistry::load(conn).context("failed to load nodes")?);
    let status = Arc::new(StatusAuthority::new(tasks.clone()));
    let reported_memory: ReportedMemory = Arc::new(dashmap::DashMap::new());
    let scheduler = Arc::new(Scheduler::new(tasks.clone(), nodes.clone(), reported_memory.clone()));
    let dispatcher = Arc::new(Dispatcher::new(
        tasks.clone(),
        nodes.clone(),
        status.clone(),
        DispatcherConfig {
            command_timeout: std::time::Duration::from_secs(config.dispatch_timeout_command_secs),
            vps_timeout: std::time::Duration::from_secs(config.dispatch_timeout_vps_secs),
            suspicion_threshold: config.suspicion_threshold,
        },
    ));
    let liveness = Arc::new(LivenessMonitor::new(
        nodes.clone(),
        tasks.clone(),
        status.clone(),
        config.heartbeat_timeout(),
        std::time::Duration::from_secs(config.cleanup_interval_secs),
    ));

    let overlay = if config.overlay.enabled {
        let layout = config
            .overlay
            .layout()
            .context("invalid overlay subnet configuration")?;
        let host_addr: std::net::Ipv4Addr = config
            .host
            .parse()
            .unwrap_or(std::net::Ipv4Addr::UNSPECIFIED);
        let allocator = Arc::new(OverlayAllocator::new(
            nodes.clone(),
            Arc::new(CliNetlinkGateway::new()),
            layout,
            config.overlay.base_vni,
            config.overlay.port,
            host_addr,
        ));
        if let Err(e) = allocator.rehydrate().await {
            tracing::warn!(error = %e, "overlay rehydration failed; continuing without it");
        }
        Some(allocator)
    } else {
        None
    };

    let secret = config
        .reservation_hmac_secret
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let reservations = Arc::new(ReservationManager::new(
        nodes.clone(),
        secret.into_bytes(),
        std::time::Duration::from_secs(config.reservation_ttl_secs),
        std::time::Duration::from_secs(config.reservation_sweep_interval_secs),
    ));

    let state = HostState {
        config: Arc::new(config.clone()),
        tasks,
        nodes,
        status,
        scheduler,
        dispatcher,
        liveness,
        overlay,
        reservations,
        ids: Arc::new(IdGenerator::new(0)),
        reported_memory,
    };

    let (shutdown_tx, _) = broadcast::channel(1);
    spawner::spawn_all(&state, &shutdown_tx);

    if state.config.metrics.enabled {
        let metrics_host = state.config.host.clone();
        let metrics_port = state.config.metrics.port;
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            metrics_server::run(&metrics_host, metrics_port, shutdown_rx).await;
        });
    }

    let app = server::router(state);
    let addr = std::net::SocketAddr::from((
        config.host.parse::<std::net::IpAddr>().unwrap_or(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)),
        config.port,
    ));
    info!(%addr, "fleetd host listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c().await.ok();
            shutdown_tx.send(()).ok();
        })
        .await?;

    metrics::NODES_ONLINE.set(0.0);
    Ok(())
}
