//! Periodic sweep that detects stale heartbeats, marks nodes offline, and
//! flags tasks as lost or reassignable (§4.5).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::error::Result;
use crate::metrics;
use crate::status::StatusAuthority;
use crate::store::{NodeRegistry, TaskQuery, TaskStore};
use crate::types::{Liveness, TaskStatus};

pub struct LivenessMonitor {
    nodes: Arc<NodeRegistry>,
    tasks: Arc<TaskStore>,
    status: Arc<StatusAuthority>,
    heartbeat_timeout: Duration,
    cleanup_interval: Duration,
}

impl LivenessMonitor {
    pub fn new(
        nodes: Arc<NodeRegistry>,
        tasks: Arc<TaskStore>,
        status: Arc<StatusAuthority>,
        heartbeat_timeout: Duration,
        cleanup_interval: Duration,
    ) -> Self {
        Self {
            nodes,
            tasks,
            status,
            heartbeat_timeout,
            cleanup_interval,
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.cleanup_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.sweep().await {
                        debug!(error = %e, "liveness sweep encountered an error; continuing");
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("liveness monitor shutting down");
                    break;
                }
            }
        }
    }

    pub async fn sweep(&self) -> Result<()> {
        metrics::LIVENESS_SWEEPS_TOTAL.inc();
        let now = Utc::now();

        for node in self.nodes.snapshot().await {
            if node.liveness != Liveness::Online {
                continue;
            }
            let elapsed = now.signed_duration_since(node.last_heartbeat);
            if elapsed.num_milliseconds() as u64 <= self.heartbeat_timeout.as_millis() as u64 {
                continue;
            }

            info!(node = %node.hostname, "heartbeat timeout; marking node OFFLINE");
            self.nodes
                .update(&node.hostname, |n| {
                    n.liveness = Liveness::Offline;
                    Ok(())
                })
                .await?;
            metrics::NODES_MARKED_OFFLINE_TOTAL.inc();

            let live_tasks = self
                .tasks
                .query(&TaskQuery {
                    assigned_node: Some(node.hostname.clone()),
                    ..Default::default()
                })
                .await;

            for task in live_tasks {
                if task.status.is_terminal() || task.status == TaskStatus::Lost {
                    continue;
                }
                let result = self
                    .status
                    .transition(task.id, TaskStatus::Lost, move |t| {
                        t.completed_at = Some(now);
                    })
                    .await;
                match result {
                    Ok(_) => {
                        metrics::TASKS_MARKED_LOST_TOTAL.inc();
                    }
                    Err(e) => debug!(task_id = task.id, error = %e, "could not mark task LOST"),
                }
            }
        }

        let online_count = self
            .nodes
            .snapshot()
            .await
            .iter()
            .filter(|n| n.liveness == Liveness::Online)
            .count();
        metrics::NODES_ONLINE.set(online_count as f64);

        Ok(())
    }
}
