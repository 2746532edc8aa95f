//! Carries out an `ExecuteRequest` against the container runtime collaborator
//! and watches the resulting container through to exit (§4.9).
//!
//! Step order for a fresh COMMAND or VPS-container workload: load or pull
//! the image, create the container, mark it in-flight, start it, report
//! RUNNING, then hand off to a background exit watcher. A VPS task whose
//! container is still present (a restart rather than a first dispatch)
//! skips straight to re-attaching.

use std::collections::BTreeMap;

use tracing::{info, warn};

use crate::error::{FleetError, Result};
use crate::runner::AgentState;
use crate::runtime::container::{CreateContainerRequest, ExitOutcome};
use crate::transport::{ExecuteRequest, KilledTaskReport, TaskStatusUpdate};
use crate::types::{BindMount, TaskId};

fn container_name(task_id: TaskId) -> String {
    format!("fleetd-task-{task_id}")
}

/// Canonical in-container path stdout/stderr are redirected under (§4.9
/// step 3); the host-side directory backing it lives under shared storage
/// so logs survive container removal and are reachable from `/shared` too.
const CONTAINER_LOGS_PATH: &str = "/fleetd/logs";
const CONTAINER_SHARED_PATH: &str = "/shared";
const CONTAINER_LOCAL_TEMP_PATH: &str = "/local_temp";

fn host_logs_dir(state: &AgentState, task_id: TaskId) -> String {
    format!("{}/logs/{task_id}", state.config.shared_storage_path)
}

fn stdout_log_path(state: &AgentState, task_id: TaskId) -> String {
    format!("{}/stdout.log", host_logs_dir(state, task_id))
}

fn stderr_log_path(state: &AgentState, task_id: TaskId) -> String {
    format!("{}/stderr.log", host_logs_dir(state, task_id))
}

/// The required mounts (§4.9 step 2): shared storage, this task's logs
/// subdirectory, a local temp dir, plus whatever the task itself declared.
fn build_mounts(state: &AgentState, req: &ExecuteRequest) -> Vec<BindMount> {
    let mut mounts = vec![
        BindMount {
            host_path: state.config.shared_storage_path.clone(),
            container_path: CONTAINER_SHARED_PATH.to_string(),
            read_only: false,
        },
        BindMount {
            host_path: host_logs_dir(state, req.task_id),
            container_path: CONTAINER_LOGS_PATH.to_string(),
            read_only: false,
        },
        BindMount {
            host_path: state.config.local_temp_path.clone(),
            container_path: CONTAINER_LOCAL_TEMP_PATH.to_string(),
            read_only: false,
        },
    ];
    mounts.extend(req.mounts.iter().cloned());
    mounts
}

/// Injected env vars (§4.9 step 2): task id, the mounted paths, the pinned
/// NUMA node if any, and tunnel-client connection parameters so the
/// in-container tunnel client can dial the overlay hub.
fn build_env(state: &AgentState, req: &ExecuteRequest) -> BTreeMap<String, String> {
    let mut env = req.env.clone();
    env.insert("FLEETD_TASK_ID".into(), req.task_id.to_string());
    env.insert("FLEETD_SHARED_PATH".into(), CONTAINER_SHARED_PATH.into());
    env.insert("FLEETD_LOG_PATH".into(), CONTAINER_LOGS_PATH.into());
    env.insert("FLEETD_LOCAL_TEMP_PATH".into(), CONTAINER_LOCAL_TEMP_PATH.into());
    if let Some(node) = req.numa_node {
        env.insert("FLEETD_NUMA_NODE".into(), node.to_string());
    }
    if let Some(port) = req.ssh_port {
        env.insert("FLEETD_SSH_PORT".into(), port.to_string());
    }
    if let Some(registered) = &state.overlay
        && let Some(overlay) = &registered.overlay
    {
        env.insert("FLEETD_TUNNEL_HOST".into(), registered.host_physical_address.clone());
        env.insert("FLEETD_TUNNEL_PORT".into(), overlay.overlay_port.to_string());
        env.insert("FLEETD_TUNNEL_GATEWAY_IP".into(), overlay.gateway_ip.to_string());
        env.insert("FLEETD_TUNNEL_VNI".into(), overlay.vni.to_string());
    }
    env
}

/// Wraps the workload command so stdout/stderr redirect to log files under
/// the logs mount, with an exec-replace so the task command itself becomes
/// PID 1 of the container and signals reach it directly (§4.9 step 3). NUMA
/// pinning, when requested, wraps the innermost command so the process is
/// bound from its very first instruction rather than migrated afterward.
fn build_command(req: &ExecuteRequest) -> Vec<String> {
    let mut inner = vec![req.command.clone()];
    inner.extend(req.args.iter().cloned());
    if let Some(node) = req.numa_node {
        let mut pinned = vec![
            "numactl".to_string(),
            format!("--cpunodebind={node}"),
            format!("--membind={node}"),
        ];
        pinned.extend(inner);
        inner = pinned;
    }

    let redirect = format!(
        "exec \"$@\" >>'{CONTAINER_LOGS_PATH}/stdout.log' 2>>'{CONTAINER_LOGS_PATH}/stderr.log'"
    );
    let mut wrapped = vec!["/bin/sh".to_string(), "-c".to_string(), redirect, "--".to_string()];
    wrapped.extend(inner);
    wrapped
}

pub async fn execute(state: std::sync::Arc<AgentState>, req: ExecuteRequest) -> Result<()> {
    if req.is_vps && req.vps_backend_is_vm {
        warn!(
            task_id = req.task_id,
            "VM-backed VPS dispatched to a runner build with no VmHypervisor wired; failing"
        );
        state
            .host
            .task_status_update(&TaskStatusUpdate {
                task_id: req.task_id,
                status: crate::types::TaskStatus::Failed,
                exit_code: None,
                error_message: Some("this runner has no VM backend configured".into()),
                stdout_path: None,
                stderr_path: None,
            })
            .await?;
        return Ok(());
    }

    let name = container_name(req.task_id);
    let already_present = state.containers.is_present(&name).await.unwrap_or(false);
    let logs_dir = host_logs_dir(&state, req.task_id);
    tokio::fs::create_dir_all(&logs_dir)
        .await
        .map_err(|e| FleetError::Transient(format!("could not create logs dir {logs_dir}: {e}")))?;

    if already_present {
        state.containers.restart(&name).await?;
        info!(task_id = req.task_id, container = %name, "re-attached to existing VPS container");
    } else {
        if let Some(env_name) = &req.environment_name {
            // Serializes concurrent loads of the same environment name
            // (§4.9 step 1, §5); different names proceed independently.
            let _guard = state.lock_image_load(env_name).await;
            let tarball = format!("{}/environments/{env_name}.tar", state.config.shared_storage_path);
            state.containers.load_environment_if_stale(env_name, &tarball).await?;
        } else if let Some(image) = &req.image_ref {
            state.containers.pull_image(image).await?;
        }

        let env = build_env(&state, &req);

        let create = CreateContainerRequest {
            name: name.clone(),
            image: req.image_ref.clone().unwrap_or_else(|| "scratch".to_string()),
            command: build_command(&req),
            cpu_quota_cores: req.cores as f64,
            memory_limit_bytes: req.memory_bytes,
            gpu_device_indices: req.gpu_indices.iter().copied().collect(),
            network: crate::runner::overlay::BRIDGE_NAME.to_string(),
            reserved_ip: req.reserved_ip,
            mounts: build_mounts(&state, &req),
            env,
            privileged: req.privileged,
            persistent: req.is_vps,
        };
        let container_id = state.containers.create(&create).await?;
        state.containers.start(&container_id).await?;
        info!(task_id = req.task_id, container = %container_id, "container started");
    }

    state.inflight.mark(req.task_id, &name)?;
    state
        .host
        .task_status_update(&TaskStatusUpdate {
            task_id: req.task_id,
            status: crate::types::TaskStatus::Running,
            exit_code: None,
            error_message: None,
            stdout_path: Some(stdout_log_path(&state, req.task_id)),
            stderr_path: Some(stderr_log_path(&state, req.task_id)),
        })
        .await?;

    spawn_exit_watcher(state, req.task_id, name);
    Ok(())
}

/// Spawns the background task that blocks on the container's exit and
/// reports the outcome, unless the task was unmarked (killed, stopped, or
/// otherwise handled) by the time it resolves.
pub fn spawn_exit_watcher(state: std::sync::Arc<AgentState>, task_id: TaskId, container_id: String) {
    tokio::spawn(async move {
        let outcome = match state.containers.wait_exit(&container_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(task_id, error = %e, "failed waiting for container exit");
                return;
            }
        };

        if !state.inflight.is_marked(task_id) {
            // Externally commanded (kill/stop) or already reported; the Host
            // already knows the final status.
            return;
        }

        match outcome {
            ExitOutcome::Success => {
                let _ = state.inflight.unmark(task_id);
                report_terminal(&state, task_id, crate::types::TaskStatus::Completed, Some(0), None).await;
            }
            ExitOutcome::Failed(code) => {
                let _ = state.inflight.unmark(task_id);
                let stderr = state.containers.tail_stderr(&container_id, 4096).await.unwrap_or_default();
                let message = (!stderr.is_empty()).then(|| String::from_utf8_lossy(&stderr).into_owned());
                report_terminal(&state, task_id, crate::types::TaskStatus::Failed, Some(code), message).await;
            }
            ExitOutcome::SignalKilled(signal) => {
                let _ = state.inflight.unmark(task_id);
                state.pending_killed.lock().await.push(KilledTaskReport {
                    task_id,
                    reason: format!("container exited via signal {signal} (possible oom)"),
                });
            }
        }
    });
}

async fn report_terminal(
    state: &AgentState,
    task_id: TaskId,
    status: crate::types::TaskStatus,
    exit_code: Option<i32>,
    error_message: Option<String>,
) {
    let result = state
        .host
        .task_status_update(&TaskStatusUpdate {
            task_id,
            status,
            exit_code,
            error_message,
            stdout_path: Some(stdout_log_path(state, task_id)),
            stderr_path: Some(stderr_log_path(state, task_id)),
        })
        .await;
    if let Err(e) = result {
        warn!(task_id, error = %e, "failed to report terminal task status");
    }
}

pub async fn kill(state: &AgentState, task_id: TaskId) -> Result<()> {
    let container_id = state
        .inflight
        .container_id(task_id)
        .ok_or_else(|| FleetError::NotFound(format!("task {task_id} is not in flight here")))?;
    state.containers.kill(&container_id).await
}

pub async fn pause(state: &AgentState, task_id: TaskId) -> Result<()> {
    let container_id = state
        .inflight
        .container_id(task_id)
        .ok_or_else(|| FleetError::NotFound(format!("task {task_id} is not in flight here")))?;
    state.containers.pause(&container_id).await
}

pub async fn resume(state: &AgentState, task_id: TaskId) -> Result<()> {
    let container_id = state
        .inflight
        .container_id(task_id)
        .ok_or_else(|| FleetError::NotFound(format!("task {task_id} is not in flight here")))?;
    state.containers.resume(&container_id).await
}

/// Stops a persistent VPS container without removing it. Unmarks in-flight
/// first so the exit watcher sees the stop as externally commanded rather
/// than as a failure to report.
pub async fn vps_stop(state: &AgentState, task_id: TaskId) -> Result<()> {
    let container_id = state
        .inflight
        .container_id(task_id)
        .ok_or_else(|| FleetError::NotFound(format!("task {task_id} is not in flight here")))?;
    state.inflight.unmark(task_id)?;
    state.containers.stop(&container_id).await
}

/// Restarts a previously stopped VPS container and resumes watching it.
pub async fn vps_restart(state: std::sync::Arc<AgentState>, task_id: TaskId) -> Result<()> {
    let name = container_name(task_id);
    state.containers.restart(&name).await?;
    state.inflight.mark(task_id, &name)?;
    spawn_exit_watcher(state, task_id, name);
    Ok(())
}
