//! The Runner Agent process: workload executor, heartbeat sender, overlay
//! spoke (§4.9, §4.10, §4.7 "spoke side"). Started with `--agent
//! <config path>` instead of the Host's default mode.

pub mod executor;
pub mod heartbeat;
pub mod overlay;
pub mod server;
pub mod store;

use std::sync::Arc;

use anyhow::{Context, Result};
use dashmap::DashMap;
use sysinfo::System;
use tokio::sync::{broadcast, Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{info, warn};

use crate::config::AgentConfig;
use crate::overlay::netlink::CliNetlinkGateway;
use crate::overlay::NetlinkGateway;
use crate::runtime::container::{CliContainerRuntime, ContainerRuntime};
use crate::transport::{HostClient, KilledTaskReport, RegisterRequest};
use crate::types::NumaNode;
use store::InFlightStore;

/// Everything a runner-side handler or background loop needs.
pub struct AgentState {
    pub config: Arc<AgentConfig>,
    pub host: HostClient,
    pub containers: Arc<dyn ContainerRuntime>,
    pub inflight: Arc<InFlightStore>,
    /// Ambiguous signal-kill (possible OOM) reports awaiting the next
    /// heartbeat, which is the channel the Host's callback handler expects
    /// them on (`host::server::runner_heartbeat`).
    pub pending_killed: AsyncMutex<Vec<KilledTaskReport>>,
    /// This runner's overlay registration, if overlay networking is up;
    /// supplies the tunnel-client connection parameters (§4.9 step 2)
    /// injected into every workload's environment.
    pub overlay: Option<crate::transport::RegisterResponse>,
    /// Serializes concurrent `load_environment_if_stale` calls for the same
    /// environment name (§4.9 step 1, §5) so two tasks sharing an image
    /// don't race `docker load`.
    image_load_locks: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl AgentState {
    /// Acquires the per-name image-load lock, creating it on first use.
    pub async fn lock_image_load(&self, name: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .image_load_locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        lock.lock_owned().await
    }
}

fn detect_capacity(config: &AgentConfig) -> (u32, u64) {
    let mut sys = System::new_all();
    sys.refresh_all();
    let cores = config.cores_override.unwrap_or(sys.cpus().len() as u32);
    let memory_bytes = config.memory_bytes_override.unwrap_or(sys.total_memory());
    (cores, memory_bytes)
}

const NUMA_SYSFS_ROOT: &str = "/sys/devices/system/node";

/// Declares this runner's NUMA topology (§3, §4.3): an explicit override
/// first, then whatever the kernel exposes under `/sys/devices/system/node`,
/// falling back to a single synthetic node spanning all detected cores so a
/// runner with no queryable topology (non-Linux, most containers) still
/// reports something consistent with `cores`.
fn detect_numa_topology(config: &AgentConfig, cores: u32) -> Vec<NumaNode> {
    if let Some(nodes) = &config.numa_override {
        return nodes.clone();
    }
    match read_numa_topology_from_sysfs(NUMA_SYSFS_ROOT.as_ref()) {
        Some(nodes) if !nodes.is_empty() => nodes,
        _ => vec![NumaNode {
            id: 0,
            cpu_indices: (0..cores).collect(),
            memory_bytes: 0,
        }],
    }
}

fn read_numa_topology_from_sysfs(root: &std::path::Path) -> Option<Vec<NumaNode>> {
    let entries = std::fs::read_dir(root).ok()?;
    let mut nodes = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(id_str) = name.strip_prefix("node") else { continue };
        let Ok(id) = id_str.parse::<u32>() else { continue };

        let cpu_indices = std::fs::read_to_string(entry.path().join("cpulist"))
            .ok()
            .map(|s| parse_cpulist(&s))
            .unwrap_or_default();
        let memory_bytes = std::fs::read_to_string(entry.path().join("meminfo"))
            .ok()
            .and_then(|s| parse_node_meminfo_total(&s))
            .unwrap_or(0);
        nodes.push(NumaNode { id, cpu_indices, memory_bytes });
    }
    nodes.sort_by_key(|n| n.id);
    (!nodes.is_empty()).then_some(nodes)
}

/// Parses Linux cpulist range syntax, e.g. `"0-3,8,10-11"`.
fn parse_cpulist(s: &str) -> Vec<u32> {
    let mut cpus = Vec::new();
    for part in s.trim().split(',') {
        if part.is_empty() {
            continue;
        }
        match part.split_once('-') {
            Some((start, end)) => {
                if let (Ok(start), Ok(end)) = (start.parse::<u32>(), end.parse::<u32>()) {
                    cpus.extend(start..=end);
                }
            }
            None => {
                if let Ok(n) = part.parse::<u32>() {
                    cpus.push(n);
                }
            }
        }
    }
    cpus
}

/// Pulls `MemTotal` out of a node's `meminfo` file (`"Node 0 MemTotal: N kB"`).
fn parse_node_meminfo_total(s: &str) -> Option<u64> {
    let line = s.lines().find(|l| l.contains("MemTotal:"))?;
    let kb_str = line.split("MemTotal:").nth(1)?.trim().split_whitespace().next()?;
    kb_str.parse::<u64>().ok().map(|kb| kb * 1024)
}

pub async fn run(config: AgentConfig) -> Result<()> {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    tracing_subscriber::fmt().with_env_filter(log_level).compact().with_ansi(true).init();

    info!(hostname = %config.hostname, "starting fleetd runner agent");

    let conn = crate::store::open(&config.storage.db_path).context("failed to open runner store")?;
    let inflight = Arc::new(InFlightStore::load(conn).context("failed to load in-flight set")?);

    let host = HostClient::new(config.host_url.clone());
    let (cores, memory_bytes) = detect_capacity(&config);
    let numa = detect_numa_topology(&config, cores);
    let own_address = format!("{}:{}", config.hostname, config.port);

    let register_req = RegisterRequest {
        hostname: config.hostname.clone(),
        address: own_address.clone(),
        cores,
        memory_bytes,
        gpu_indices: config.gpu_indices.clone(),
        vfio_eligible_gpu_indices: config.vfio_eligible_gpu_indices.clone(),
        numa,
        vm_capable: config.vm_capable,
        runner_version: env!("CARGO_PKG_VERSION").to_string(),
    };

    let registered = register_with_retry(&host, &register_req).await?;
    match &registered.overlay {
        Some(o) => info!(runner_id = o.runner_id, subnet = %o.subnet, "registered with host"),
        None => info!("registered with host (overlay disabled)"),
    }

    let netlink: Arc<dyn NetlinkGateway> = Arc::new(CliNetlinkGateway::new());
    let overlay_up = match &registered.overlay {
        Some(overlay_registration) => {
            match overlay::setup_spoke(
                netlink.as_ref(),
                &registered.host_physical_address,
                overlay_registration,
                &own_address,
            )
            .await
            {
                Ok(()) => true,
                Err(e) => {
                    warn!(error = %e, "overlay spoke setup failed; continuing without overlay networking");
                    false
                }
            }
        }
        None => {
            info!("overlay networking disabled by host; running without it");
            false
        }
    };

    let state = Arc::new(AgentState {
        config: Arc::new(config.clone()),
        host,
        containers: Arc::new(CliContainerRuntime::new("docker")),
        inflight,
        pending_killed: AsyncMutex::new(Vec::new()),
        overlay: overlay_up.then(|| registered.clone()),
        image_load_locks: DashMap::new(),
    });

    // A task still marked in-flight from a prior process lifetime needs its
    // exit re-watched; its container may have kept running or already exited
    // while this runner was down.
    for task_id in state.inflight.task_ids() {
        if let Some(container_id) = state.inflight.container_id(task_id) {
            executor::spawn_exit_watcher(state.clone(), task_id, container_id);
        }
    }

    let (shutdown_tx, _) = broadcast::channel(1);

    let heartbeat_state = state.clone();
    let heartbeat_shutdown = shutdown_tx.subscribe();
    tokio::spawn(async move {
        heartbeat::run(heartbeat_state, heartbeat_shutdown).await;
    });

    let app = server::router(state.clone());
    let addr = std::net::SocketAddr::from((
        state
            .config
            .bind_host
            .parse::<std::net::IpAddr>()
            .unwrap_or(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)),
        state.config.port,
    ));
    info!(%addr, "fleetd runner agent listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    if state.config.metrics.enabled {
        let metrics_host = state.config.bind_host.clone();
        let metrics_port = state.config.metrics.port;
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            crate::host::metrics_server::run(&metrics_host, metrics_port, shutdown_rx).await;
        });
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c().await.ok();
            shutdown_tx.send(()).ok();
        })
        .await?;

    Ok(())
}

async fn register_with_retry(
    host: &HostClient,
    req: &RegisterRequest,
) -> Result<crate::transport::RegisterResponse> {
    let mut backoff = std::time::Duration::from_secs(1);
    loop {
        match host.register(req).await {
            Ok(resp) => return Ok(resp),
            Err(e) => {
                warn!(error = %e, backoff_secs = backoff.as_secs(), "registration failed; retrying");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(std::time::Duration::from_secs(30));
            }
        }
    }
}
