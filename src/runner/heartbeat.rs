//! Periodically reports liveness, resource usage, and in-flight task state
//! back to the Host (§4.10).

use std::time::Duration;

use sysinfo::System;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::runner::{executor, AgentState};
use crate::transport::{CorrectiveAction, HeartbeatRequest};

pub async fn run(state: std::sync::Arc<AgentState>, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut interval = tokio::time::interval(Duration::from_secs(state.config.heartbeat_interval_secs));
    let mut sys = System::new();
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = tick(&state, &mut sys).await {
                    warn!(error = %e, "heartbeat failed; will retry next tick");
                }
            }
            _ = shutdown_rx.recv() => {
                info!("heartbeat loop shutting down");
                break;
            }
        }
    }
}

async fn tick(state: &AgentState, sys: &mut System) -> crate::error::Result<()> {
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let cpu_percent = sys.global_cpu_usage();
    let memory_used_bytes = sys.used_memory();
    let memory_percent = if sys.total_memory() > 0 {
        (memory_used_bytes as f32 / sys.total_memory() as f32) * 100.0
    } else {
        0.0
    };

    let killed_tasks = std::mem::take(&mut *state.pending_killed.lock().await);

    let req = HeartbeatRequest {
        hostname: state.config.hostname.clone(),
        running_tasks: state.inflight.task_ids(),
        killed_tasks,
        cpu_percent,
        memory_used_bytes,
        memory_percent,
        gpu_metrics: Vec::new(),
        vm_capable: state.config.vm_capable,
        runner_version: env!("CARGO_PKG_VERSION").to_string(),
    };

    let response = state.host.heartbeat(&req).await?;
    for command in response.corrective_commands {
        match command.action {
            CorrectiveAction::Kill => {
                if let Err(e) = executor::kill(state, command.task_id).await {
                    warn!(
                        task_id = command.task_id,
                        error = %e,
                        "failed to act on host's corrective kill command"
                    );
                }
            }
        }
    }
    Ok(())
}
