//! HTTP surface the Host dials into: `RunnerClient`'s counterpart (§4.4,
//! §4.9). Each handler is a thin wrapper over `runner::executor`.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use tracing::warn;

use crate::error::Result;
use crate::runner::{executor, AgentState};
use crate::transport::{ControlRequest, ControlResponse, ExecuteRequest};

pub fn router(state: std::sync::Arc<AgentState>) -> Router {
    Router::new()
        .route("/rpc/execute", post(execute))
        .route("/rpc/kill", post(kill))
        .route("/rpc/unmark_inflight", post(unmark_inflight))
        .route("/rpc/pause", post(pause))
        .route("/rpc/resume", post(resume))
        .route("/rpc/vps_stop", post(vps_stop))
        .route("/rpc/vps_restart", post(vps_restart))
        .with_state(state)
}

async fn execute(
    State(state): State<std::sync::Arc<AgentState>>,
    Json(req): Json<ExecuteRequest>,
) -> Result<StatusCode> {
    let task_id = req.task_id;
    executor::execute(state, req).await.inspect_err(|e| {
        warn!(task_id, error = %e, "execute failed");
    })?;
    Ok(StatusCode::ACCEPTED)
}

async fn kill(
    State(state): State<std::sync::Arc<AgentState>>,
    Json(req): Json<ControlRequest>,
) -> Result<Json<ControlResponse>> {
    executor::kill(&state, req.task_id).await?;
    Ok(Json(ControlResponse { accepted: true }))
}

/// Clears a task from the in-flight set ahead of an imminent kill, so the
/// exit watcher does not race a legitimate kill and report it as a failure.
async fn unmark_inflight(
    State(state): State<std::sync::Arc<AgentState>>,
    Json(req): Json<ControlRequest>,
) -> Result<Json<ControlResponse>> {
    let was_present = state.inflight.unmark(req.task_id)?;
    Ok(Json(ControlResponse { accepted: was_present }))
}

async fn pause(
    State(state): State<std::sync::Arc<AgentState>>,
    Json(req): Json<ControlRequest>,
) -> Result<Json<ControlResponse>> {
    executor::pause(&state, req.task_id).await?;
    Ok(Json(ControlResponse { accepted: true }))
}

async fn resume(
    State(state): State<std::sync::Arc<AgentState>>,
    Json(req): Json<ControlRequest>,
) -> Result<Json<ControlResponse>> {
    executor::resume(&state, req.task_id).await?;
    Ok(Json(ControlResponse { accepted: true }))
}

async fn vps_stop(
    State(state): State<std::sync::Arc<AgentState>>,
    Json(req): Json<ControlRequest>,
) -> Result<Json<ControlResponse>> {
    executor::vps_stop(&state, req.task_id).await?;
    Ok(Json(ControlResponse { accepted: true }))
}

async fn vps_restart(
    State(state): State<std::sync::Arc<AgentState>>,
    Json(req): Json<ControlRequest>,
) -> Result<Json<ControlResponse>> {
    executor::vps_restart(state.clone(), req.task_id).await?;
    Ok(Json(ControlResponse { accepted: true }))
}
