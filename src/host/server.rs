//! The Host's HTTP surface: the Client-facing task/VPS/node/overlay API and
//! the Runner-facing callback API (register/heartbeat/status-update), all on
//! one axum `Router` (§6.1-§6.3).

use std::collections::{BTreeMap, BTreeSet};

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::HostState;
use crate::error::{FleetError, Result};
use crate::scheduler::target::parse_target;
use crate::transport::{HeartbeatRequest, HeartbeatResponse, RegisterRequest, RegisterResponse, TaskStatusUpdate};
use crate::types::{
    ApprovalState, BindMount, GpuDescriptor, Liveness, Node, NodeCapacity, PrincipalTier,
    ResourceRequest, Task, TaskId, TaskKind, TaskStatus, VpsBackend,
};

pub fn router(state: HostState) -> Router {
    Router::new()
        .route("/api/v1/tasks", get(list_tasks).post(submit_task))
        .route(
            "/api/v1/tasks/{id}",
            get(get_task).delete(delete_task),
        )
        .route("/api/v1/tasks/{id}/approve", post(approve_task))
        .route("/api/v1/tasks/{id}/reject", post(reject_task))
        .route("/api/v1/tasks/{id}/kill", post(kill_task))
        .route("/api/v1/tasks/{id}/pause", post(pause_task))
        .route("/api/v1/tasks/{id}/resume", post(resume_task))
        .route("/api/v1/tasks/{id}/restart", post(restart_task))
        .route("/api/v1/vps", get(list_vps).post(create_vps))
        .route("/api/v1/vps/{id}", get(get_vps))
        .route("/api/v1/vps/{id}/stop", post(vps_stop))
        .route("/api/v1/vps/{id}/restart", post(restart_task))
        .route("/api/v1/vps/{id}/pause", post(pause_task))
        .route("/api/v1/vps/{id}/resume", post(resume_task))
        .route("/api/v1/nodes", get(list_nodes))
        .route("/api/v1/nodes/{hostname}", get(get_node))
        .route("/api/v1/nodes/{hostname}/overlay", get(node_overlay_status))
        .route(
            "/api/v1/nodes/{hostname}/overlay/release",
            post(node_overlay_release),
        )
        .route(
            "/api/v1/overlay/reservations",
            get(list_reservations).post(reserve_ip),
        )
        .route("/api/v1/overlay/reservations/release", post(release_ip))
        .route("/runner/register", post(runner_register))
        .route("/runner/heartbeat", post(runner_heartbeat))
        .route("/runner/task_status", post(runner_task_status))
        .route("/runner/vm_phone_home", post(vm_phone_home))
        .route("/runner/vm_heartbeat", post(vm_heartbeat))
        .with_state(state)
}

fn principal(headers: &HeaderMap, state: &HostState) -> Result<(String, PrincipalTier)> {
    let owner = headers
        .get("x-owner-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let tier = headers
        .get("x-principal-tier")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<PrincipalTier>().ok());

    if !state.config.auth_enabled {
        return Ok((
            owner.unwrap_or_else(|| "anonymous".to_string()),
            tier.unwrap_or(PrincipalTier::Operator),
        ));
    }

    let owner = owner.ok_or_else(|| FleetError::ClientInput("missing X-Owner-Id header".into()))?;
    let tier = tier
        .ok_or_else(|| FleetError::ClientInput("missing or invalid X-Principal-Tier header".into()))?;
    Ok((owner, tier))
}

// ---- Task submission and listing ----

#[derive(Debug, Deserialize)]
struct SubmitTaskRequest {
    kind: TaskKind,
    #[serde(default)]
    name: Option<String>,
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    cores: u32,
    #[serde(default)]
    memory_bytes: Option<u64>,
    /// `node[:numa_id][::gpu_spec]`; empty string means auto-select (§4.3).
    #[serde(default)]
    target: String,
    #[serde(default)]
    environment_name: Option<String>,
    #[serde(default)]
    image_ref: Option<String>,
    #[serde(default)]
    mounts: Vec<BindMount>,
    #[serde(default)]
    privileged: bool,
    #[serde(default)]
    vps_backend: Option<VpsBackend>,
    #[serde(default)]
    ssh_port: Option<u16>,
    #[serde(default)]
    vm_base_image: Option<String>,
    #[serde(default)]
    vm_disk_size_bytes: Option<u64>,
    #[serde(default)]
    reservation_token: Option<String>,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    #[serde(default)]
    batch_id: Option<TaskId>,
}

async fn submit_task(
    State(state): State<HostState>,
    headers: HeaderMap,
    Json(req): Json<SubmitTaskRequest>,
) -> Result<(StatusCode, Json<Task>)> {
    submit_task_impl(state, headers, req).await
}

async fn create_vps(
    State(state): State<HostState>,
    headers: HeaderMap,
    Json(mut req): Json<SubmitTaskRequest>,
) -> Result<(StatusCode, Json<Task>)> {
    req.kind = TaskKind::Vps;
    submit_task_impl(state, headers, req).await
}

async fn submit_task_impl(
    state: HostState,
    headers: HeaderMap,
    req: SubmitTaskRequest,
) -> Result<(StatusCode, Json<Task>)> {
    let (owner_id, tier) = principal(&headers, &state)?;
    let target = parse_target(&req.target)?;

    let (requested_node, reserved_ip) = if let Some(token) = &req.reservation_token {
        let reservation = state.reservations.validate(token)?;
        let node = state
            .nodes
            .find_by_runner_id(reservation.runner_id)
            .await
            .ok_or_else(|| {
                FleetError::Precondition("reservation's runner is no longer registered".into())
            })?;
        if let Some(pinned) = &target.node
            && pinned != &node.hostname
        {
            return Err(FleetError::ClientInput(
                "target node conflicts with the reservation's runner".into(),
            ));
        }
        (Some(node.hostname), Some(reservation.ip))
    } else {
        (target.node.clone(), None)
    };

    if req.kind == TaskKind::Vps && req.vps_backend.is_none() {
        return Err(FleetError::ClientInput(
            "vps_backend is required for VPS tasks".into(),
        ));
    }

    let (status, approval_state) = if state.config.auth_enabled && tier == PrincipalTier::User {
        (TaskStatus::PendingApproval, Some(ApprovalState::Pending))
    } else {
        (TaskStatus::Pending, None)
    };

    let now = Utc::now();
    let task = Task {
        id: state.ids.next_id(),
        batch_id: req.batch_id,
        kind: req.kind,
        name: req.name,
        owner_id,
        created_by_tier: tier,
        approval_state,
        approver_id: None,
        approved_at: None,
        rejection_reason: None,
        command: req.command,
        args: req.args,
        env: req.env,
        resources: ResourceRequest {
            cores: req.cores,
            memory_bytes: req.memory_bytes,
            gpu: target.gpu,
            numa_node: target.numa_node,
        },
        environment_name: req.environment_name,
        image_ref: req.image_ref,
        mounts: req.mounts,
        privileged: req.privileged,
        vps_backend: req.vps_backend,
        ssh_port: req.ssh_port,
        vm_base_image: req.vm_base_image,
        vm_disk_size_bytes: req.vm_disk_size_bytes,
        vm_ip: None,
        requested_node,
        status,
        assigned_node: None,
        assignment_suspicion_count: 0,
        required_gpus: BTreeSet::new(),
        reserved_ip,
        exit_code: None,
        error_message: None,
        stdout_path: None,
        stderr_path: None,
        submitted_at: now,
        started_at: None,
        completed_at: None,
        labels: req.labels,
    };

    state.tasks.create(task.clone()).await?;
    crate::metrics::TASKS_SUBMITTED_TOTAL.inc();
    info!(task_id = task.id, status = %task.status, "task submitted");
    Ok((StatusCode::CREATED, Json(task)))
}

#[derive(Debug, Deserialize, Default)]
struct ListTasksParams {
    status: Option<TaskStatus>,
    node: Option<String>,
    owner: Option<String>,
    approval_state: Option<ApprovalState>,
    limit: Option<usize>,
    offset: Option<usize>,
}

async fn list_tasks(
    State(state): State<HostState>,
    Query(params): Query<ListTasksParams>,
) -> Json<Vec<Task>> {
    let query = crate::store::TaskQuery {
        statuses: params.status.map(|s| [s].into_iter().collect()),
        assigned_node: params.node,
        owner_id: params.owner,
        approval_state: params.approval_state.map(Some),
        submitted_after: None,
        submitted_before: None,
        limit: params.limit,
        offset: params.offset,
    };
    Json(state.tasks.query(&query).await)
}

async fn get_task(State(state): State<HostState>, Path(id): Path<TaskId>) -> Result<Json<Task>> {
    state
        .tasks
        .get(id)
        .await
        .map(Json)
        .ok_or_else(|| FleetError::NotFound(format!("task {id} not found")))
}

async fn delete_task(State(state): State<HostState>, Path(id): Path<TaskId>) -> Result<StatusCode> {
    state.tasks.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---- Approval gate ----

async fn approve_task(
    State(state): State<HostState>,
    Path(id): Path<TaskId>,
    headers: HeaderMap,
) -> Result<Json<Task>> {
    let (approver, _) = principal(&headers, &state)?;
    let task = state
        .status
        .transition(id, TaskStatus::Pending, move |t| {
            t.approval_state = Some(ApprovalState::Approved);
            t.approver_id = Some(approver);
            t.approved_at = Some(Utc::now());
        })
        .await?;
    Ok(Json(task))
}

#[derive(Debug, Deserialize, Default)]
struct RejectRequest {
    #[serde(default)]
    reason: Option<String>,
}

async fn reject_task(
    State(state): State<HostState>,
    Path(id): Path<TaskId>,
    headers: HeaderMap,
    Json(body): Json<RejectRequest>,
) -> Result<Json<Task>> {
    let (approver, _) = principal(&headers, &state)?;
    let task = state
        .status
        .transition(id, TaskStatus::Rejected, move |t| {
            t.approval_state = Some(ApprovalState::Rejected);
            t.approver_id = Some(approver);
            t.rejection_reason = body.reason;
            t.completed_at = Some(Utc::now());
        })
        .await?;
    Ok(Json(task))
}

// ---- Control actions ----

async fn require_status(state: &HostState, id: TaskId, expected: TaskStatus) -> Result<Task> {
    let task = state
        .tasks
        .get(id)
        .await
        .ok_or_else(|| FleetError::NotFound(format!("task {id} not found")))?;
    if task.status != expected {
        return Err(FleetError::Precondition(format!(
            "task {id} is {:?}, expected {:?}",
            task.status, expected
        )));
    }
    Ok(task)
}

async fn kill_task(State(state): State<HostState>, Path(id): Path<TaskId>) -> Result<Json<Task>> {
    let task = require_status(&state, id, TaskStatus::Running).await?;
    state.dispatcher.kill(&task).await?;
    let task = state
        .status
        .transition(id, TaskStatus::Killed, |t| {
            t.completed_at = Some(Utc::now());
        })
        .await?;
    Ok(Json(task))
}

async fn pause_task(State(state): State<HostState>, Path(id): Path<TaskId>) -> Result<Json<Task>> {
    let task = require_status(&state, id, TaskStatus::Running).await?;
    state.dispatcher.pause(&task).await?;
    let task = state.status.transition(id, TaskStatus::Paused, |_| {}).await?;
    Ok(Json(task))
}

async fn resume_task(State(state): State<HostState>, Path(id): Path<TaskId>) -> Result<Json<Task>> {
    let task = require_status(&state, id, TaskStatus::Paused).await?;
    state.dispatcher.resume(&task).await?;
    let task = state.status.transition(id, TaskStatus::Running, |_| {}).await?;
    Ok(Json(task))
}

/// `POST /tasks/{id}/restart` only has defined semantics for VPS tasks.
/// STOPPED is terminal (§4.2, T1), so a restart never mutates the stopped
/// record in place — it resubmits a fresh task (new id, batch-linked to
/// the original) carrying over the same request fields, which re-enters
/// the scheduler exactly as a new submission would.
async fn restart_task(State(state): State<HostState>, Path(id): Path<TaskId>) -> Result<Json<Task>> {
    let original = state
        .tasks
        .get(id)
        .await
        .ok_or_else(|| FleetError::NotFound(format!("task {id} not found")))?;
    if original.kind != TaskKind::Vps {
        return Err(FleetError::ClientInput(
            "restart is only defined for VPS tasks".into(),
        ));
    }
    if original.status != TaskStatus::Stopped {
        return Err(FleetError::Precondition(format!(
            "task {id} is {:?}, expected STOPPED",
            original.status
        )));
    }

    let (status, approval_state) = if state.config.auth_enabled
        && original.created_by_tier == PrincipalTier::User
    {
        (TaskStatus::PendingApproval, Some(ApprovalState::Pending))
    } else {
        (TaskStatus::Pending, None)
    };

    let task = Task {
        id: state.ids.next_id(),
        batch_id: original.batch_id.or(Some(original.id)),
        kind: original.kind,
        name: original.name.clone(),
        owner_id: original.owner_id.clone(),
        created_by_tier: original.created_by_tier,
        approval_state,
        approver_id: None,
        approved_at: None,
        rejection_reason: None,
        command: original.command.clone(),
        args: original.args.clone(),
        env: original.env.clone(),
        resources: original.resources.clone(),
        environment_name: original.environment_name.clone(),
        image_ref: original.image_ref.clone(),
        mounts: original.mounts.clone(),
        privileged: original.privileged,
        vps_backend: original.vps_backend,
        ssh_port: None,
        vm_base_image: original.vm_base_image.clone(),
        vm_disk_size_bytes: original.vm_disk_size_bytes,
        vm_ip: None,
        requested_node: original.assigned_node.clone(),
        status,
        assigned_node: None,
        assignment_suspicion_count: 0,
        required_gpus: BTreeSet::new(),
        reserved_ip: None,
        exit_code: None,
        error_message: None,
        stdout_path: None,
        stderr_path: None,
        submitted_at: Utc::now(),
        started_at: None,
        completed_at: None,
        labels: original.labels.clone(),
    };

    state.tasks.create(task.clone()).await?;
    crate::metrics::TASKS_SUBMITTED_TOTAL.inc();
    info!(task_id = task.id, restarted_from = id, "VPS task resubmitted via restart");
    Ok(Json(task))
}

async fn list_vps(
    State(state): State<HostState>,
    Query(params): Query<ListTasksParams>,
) -> Json<Vec<Task>> {
    let query = crate::store::TaskQuery {
        statuses: params.status.map(|s| [s].into_iter().collect()),
        assigned_node: params.node,
        owner_id: params.owner,
        approval_state: params.approval_state.map(Some),
        submitted_after: None,
        submitted_before: None,
        limit: params.limit,
        offset: params.offset,
    };
    let mut tasks = state.tasks.query(&query).await;
    tasks.retain(|t| t.kind == TaskKind::Vps);
    Json(tasks)
}

async fn get_vps(State(state): State<HostState>, Path(id): Path<TaskId>) -> Result<Json<Task>> {
    let task = state
        .tasks
        .get(id)
        .await
        .ok_or_else(|| FleetError::NotFound(format!("task {id} not found")))?;
    if task.kind != TaskKind::Vps {
        return Err(FleetError::NotFound(format!("task {id} is not a VPS task")));
    }
    Ok(Json(task))
}

async fn vps_stop(State(state): State<HostState>, Path(id): Path<TaskId>) -> Result<Json<Task>> {
    let task = require_status(&state, id, TaskStatus::Running).await?;
    if task.kind != TaskKind::Vps {
        return Err(FleetError::ClientInput("stop is only defined for VPS tasks".into()));
    }
    state.dispatcher.vps_stop(&task).await?;
    let task = state
        .status
        .transition(id, TaskStatus::Stopped, |t| {
            t.completed_at = Some(Utc::now());
        })
        .await?;
    Ok(Json(task))
}

// ---- Nodes ----

async fn list_nodes(State(state): State<HostState>) -> Json<Vec<Node>> {
    Json(state.nodes.snapshot().await)
}

async fn get_node(State(state): State<HostState>, Path(hostname): Path<String>) -> Result<Json<Node>> {
    state
        .nodes
        .get(&hostname)
        .await
        .map(Json)
        .ok_or_else(|| FleetError::NotFound(format!("node {hostname} not found")))
}

async fn node_overlay_status(
    State(state): State<HostState>,
    Path(hostname): Path<String>,
) -> Result<Json<Option<crate::types::OverlayAllocation>>> {
    let node = state
        .nodes
        .get(&hostname)
        .await
        .ok_or_else(|| FleetError::NotFound(format!("node {hostname} not found")))?;
    Ok(Json(node.overlay))
}

async fn node_overlay_release(
    State(state): State<HostState>,
    Path(hostname): Path<String>,
) -> Result<StatusCode> {
    let allocator = state
        .overlay
        .as_ref()
        .ok_or_else(|| FleetError::Precondition("overlay networking is disabled".into()))?;
    allocator.release(&hostname).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---- IP reservations ----

#[derive(Debug, Deserialize)]
struct ReserveIpRequest {
    runner: String,
}

#[derive(Debug, Serialize)]
struct ReserveIpResponse {
    token: String,
}

async fn reserve_ip(
    State(state): State<HostState>,
    Json(req): Json<ReserveIpRequest>,
) -> Result<Json<ReserveIpResponse>> {
    let token = state.reservations.reserve(&req.runner).await?;
    Ok(Json(ReserveIpResponse { token }))
}

#[derive(Debug, Deserialize)]
struct ReleaseIpRequest {
    token: String,
}

async fn release_ip(
    State(state): State<HostState>,
    Json(req): Json<ReleaseIpRequest>,
) -> Result<StatusCode> {
    state.reservations.release_token(&req.token)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_reservations(
    State(state): State<HostState>,
) -> Json<Vec<crate::types::IpReservation>> {
    Json(state.reservations.list())
}

// ---- Runner callbacks ----

async fn runner_register(
    State(state): State<HostState>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>> {
    let existing = state.nodes.get(&req.hostname).await;

    let overlay = match &state.overlay {
        Some(allocator) => Some(allocator.allocate(&req.hostname, &req.address).await?),
        None => None,
    };

    let gpus = req
        .gpu_indices
        .iter()
        .map(|&index| GpuDescriptor {
            index,
            vfio_eligible: req.vfio_eligible_gpu_indices.contains(&index),
            model: None,
        })
        .collect();

    let node = Node {
        hostname: req.hostname.clone(),
        address: req.address.clone(),
        capacity: NodeCapacity {
            cores: req.cores,
            memory_bytes: req.memory_bytes,
            gpus,
            numa: req.numa.clone(),
        },
        last_heartbeat: Utc::now(),
        liveness: Liveness::Online,
        vm_capable: req.vm_capable,
        runner_version: req.runner_version.clone(),
        overlay: overlay.clone(),
        labels: existing.map(|n| n.labels).unwrap_or_default(),
    };
    state.nodes.upsert(node).await?;
    info!(hostname = %req.hostname, "runner registered");

    let overlay_registration = match (&state.overlay, overlay) {
        (Some(allocator), Some(overlay)) => Some(crate::transport::OverlayRegistration {
            runner_id: overlay.runner_id,
            subnet: overlay.subnet.to_string(),
            gateway_ip: overlay.gateway_ip,
            host_overlay_ip: allocator.host_global_ip(),
            host_subnet_ip: allocator.host_subnet_ip(&overlay.subnet),
            vni: overlay.vni,
            overlay_port: state.config.overlay.port,
        }),
        (None, _) => None,
        (Some(_), None) => {
            return Err(FleetError::InvariantViolation(
                "overlay allocation missing after allocate()".into(),
            ));
        }
    };

    Ok(Json(RegisterResponse {
        host_physical_address: state.config.host.clone(),
        overlay: overlay_registration,
    }))
}

async fn runner_heartbeat(
    State(state): State<HostState>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<Json<HeartbeatResponse>> {
    state
        .nodes
        .update(&req.hostname, |n| {
            n.last_heartbeat = Utc::now();
            n.liveness = Liveness::Online;
            Ok(())
        })
        .await?;
    state
        .reported_memory
        .insert(req.hostname.clone(), req.memory_used_bytes);

    for killed in &req.killed_tasks {
        let Some(task) = state.tasks.get(killed.task_id).await else {
            continue;
        };
        if task.status != TaskStatus::Running {
            continue;
        }
        let is_oom = killed.reason.to_lowercase().contains("oom");
        let to = if is_oom {
            TaskStatus::KilledOom
        } else {
            TaskStatus::Killed
        };
        let reason = killed.reason.clone();
        if let Err(e) = state
            .status
            .transition(killed.task_id, to, move |t| {
                t.completed_at = Some(Utc::now());
                t.error_message = Some(reason);
            })
            .await
        {
            warn!(task_id = killed.task_id, error = %e, "could not apply runner-reported kill");
        }
    }

    let reported: std::collections::BTreeSet<TaskId> = req.running_tasks.iter().copied().collect();
    let mut corrective_commands = Vec::new();

    for task_id in &req.running_tasks {
        let _ = state.dispatcher.note_runner_contact(*task_id).await;
        let Some(task) = state.tasks.get(*task_id).await else {
            continue;
        };
        if task.status == TaskStatus::Lost && task.kind == TaskKind::Vps {
            let _ = state
                .status
                .transition(*task_id, TaskStatus::Running, |t| {
                    t.completed_at = None;
                })
                .await;
        } else if task.status.is_terminal() {
            // Zombie (§4.10): the Host considers this task done but the
            // runner still reports it live. Logged only; the Host never
            // kills it directly, it just advises the runner via the
            // heartbeat response and lets the runner act locally (§6.2).
            warn!(task_id, node = %req.hostname, "zombie: runner reports a host-terminal task as still running; advising kill");
            corrective_commands.push(crate::transport::CorrectiveCommand {
                task_id: *task_id,
                action: crate::transport::CorrectiveAction::Kill,
            });
        }
    }

    // Orphans (§4.10): tasks the Host believes are RUNNING/PAUSED on this
    // node but that the runner's heartbeat no longer lists. Detection-only
    // — no corrective action is specified, unlike zombies above.
    let query = crate::store::TaskQuery {
        statuses: Some([TaskStatus::Running, TaskStatus::Paused].into_iter().collect()),
        assigned_node: Some(req.hostname.clone()),
        ..Default::default()
    };
    for task in state.tasks.query(&query).await {
        if !reported.contains(&task.id) {
            warn!(
                task_id = task.id,
                node = %req.hostname,
                "orphan: host considers task running on this node but runner heartbeat omits it"
            );
        }
    }

    Ok(Json(HeartbeatResponse {
        acknowledged: true,
        corrective_commands,
    }))
}

async fn runner_task_status(
    State(state): State<HostState>,
    Json(update): Json<TaskStatusUpdate>,
) -> Result<StatusCode> {
    let _ = state.dispatcher.note_runner_contact(update.task_id).await;
    let now = Utc::now();
    state
        .status
        .transition(update.task_id, update.status, move |t| {
            t.exit_code = update.exit_code;
            t.error_message = update.error_message.clone();
            if let Some(path) = update.stdout_path.clone() {
                t.stdout_path = Some(path);
            }
            if let Some(path) = update.stderr_path.clone() {
                t.stderr_path = Some(path);
            }
            if update.status == TaskStatus::Running && t.started_at.is_none() {
                t.started_at = Some(now);
            }
            if update.status.is_terminal() {
                t.completed_at = Some(now);
            }
        })
        .await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
struct VmPhoneHomeRequest {
    task_id: TaskId,
}

/// The VM hypervisor's first callback once a VM has booted and its guest
/// agent is reachable; no production `VmHypervisor` exists yet (§4.9 "VM
/// backend"), so this only advances the state machine.
async fn vm_phone_home(
    State(state): State<HostState>,
    Json(req): Json<VmPhoneHomeRequest>,
) -> Result<StatusCode> {
    let _ = state.dispatcher.note_runner_contact(req.task_id).await;
    state
        .status
        .transition(req.task_id, TaskStatus::Running, |t| {
            t.started_at.get_or_insert(Utc::now());
        })
        .await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
struct VmHeartbeatRequest {
    task_id: TaskId,
}

async fn vm_heartbeat(
    State(state): State<HostState>,
    Json(req): Json<VmHeartbeatRequest>,
) -> Result<StatusCode> {
    state.dispatcher.note_runner_contact(req.task_id).await?;
    Ok(StatusCode::OK)
}
