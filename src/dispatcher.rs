//! Issues dispatch and control RPCs to runners, and runs the suspicion
//! protocol that reverts a stuck ASSIGNING task back to PENDING (§4.4).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::metrics;
use crate::status::StatusAuthority;
use crate::store::{NodeRegistry, TaskQuery, TaskStore};
use crate::transport::{ExecuteRequest, RunnerClient};
use crate::types::{Task, TaskId, TaskKind, TaskStatus};

pub struct DispatcherConfig {
    pub command_timeout: Duration,
    pub vps_timeout: Duration,
    pub suspicion_threshold: u32,
}

/// Tracks, per task, when the dispatcher last attempted to deliver its
/// create/execute call, so a tick doesn't redeliver before the kind's
/// health-check period has elapsed.
type LastAttempt = Arc<DashMap<TaskId, Instant>>;

pub struct Dispatcher {
    tasks: Arc<TaskStore>,
    nodes: Arc<NodeRegistry>,
    status: Arc<StatusAuthority>,
    client: RunnerClient,
    config: DispatcherConfig,
    last_attempt: LastAttempt,
}

impl Dispatcher {
    pub fn new(
        tasks: Arc<TaskStore>,
        nodes: Arc<NodeRegistry>,
        status: Arc<StatusAuthority>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            tasks,
            nodes,
            status,
            client: RunnerClient::new(),
            config,
            last_attempt: Arc::new(DashMap::new()),
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(Duration::from_secs(2));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                _ = shutdown_rx.recv() => {
                    info!("dispatcher shutting down");
                    break;
                }
            }
        }
    }

    fn health_check_period(&self, kind: TaskKind) -> Duration {
        match kind {
            TaskKind::Command => self.config.command_timeout,
            TaskKind::Vps => self.config.vps_timeout,
        }
    }

    /// One sweep over every ASSIGNING task: deliver (or redeliver) the
    /// create call, and apply the suspicion counter.
    pub async fn tick(&self) {
        let assigning = self
            .tasks
            .query(&TaskQuery {
                statuses: Some([TaskStatus::Assigning].into_iter().collect()),
                ..Default::default()
            })
            .await;

        let mut node_addresses: HashMap<String, String> = HashMap::new();
        for task in assigning {
            let Some(hostname) = task.assigned_node.clone() else {
                continue;
            };
            let base_url = match node_addresses.get(&hostname) {
                Some(u) => u.clone(),
                None => {
                    let Some(node) = self.nodes.get(&hostname).await else {
                        continue;
                    };
                    let url = format!("http://{}", node.address);
                    node_addresses.insert(hostname.clone(), url.clone());
                    url
                }
            };

            let due = match self.last_attempt.get(&task.id) {
                Some(t) => t.elapsed() >= self.health_check_period(task.kind),
                None => true,
            };
            if !due {
                continue;
            }

            self.last_attempt.insert(task.id, Instant::now());
            let timeout = self.health_check_period(task.kind);
            let req = build_execute_request(&task);

            match self.client.execute(&base_url, &req, timeout).await {
                Ok(()) => {
                    debug!(task_id = task.id, node = %hostname, "dispatch delivered");
                }
                Err(e) => {
                    metrics::DISPATCH_FAILURES_TOTAL.with_label_values(&["execute"]).inc();
                    warn!(task_id = task.id, node = %hostname, error = %e, "dispatch failed");
                    self.raise_suspicion(task.id).await;
                    continue;
                }
            }

            self.raise_suspicion_if_still_assigning(task.id).await;
        }
    }

    /// Increments the suspicion counter after a failed dispatch attempt,
    /// reverting to PENDING once the threshold is crossed.
    async fn raise_suspicion(&self, task_id: TaskId) {
        self.bump_suspicion(task_id).await;
    }

    /// Increments the suspicion counter when a dispatch succeeded but no
    /// RUNNING callback has landed by the time the health-check period next
    /// elapses; called unconditionally here since the next tick only
    /// re-enters this path once `due` is true again.
    async fn raise_suspicion_if_still_assigning(&self, task_id: TaskId) {
        self.bump_suspicion(task_id).await;
    }

    async fn bump_suspicion(&self, task_id: TaskId) {
        let threshold = self.config.suspicion_threshold;
        let result = self
            .tasks
            .update(task_id, move |t| {
                t.assignment_suspicion_count += 1;
                Ok(())
            })
            .await;
        let Ok(task) = result else {
            return;
        };
        if task.assignment_suspicion_count < threshold {
            return;
        }

        let reverted = self
            .status
            .transition(task_id, TaskStatus::Pending, |t| {
                t.assignment_suspicion_count = 0;
                t.assigned_node = None;
                t.required_gpus.clear();
            })
            .await;
        match reverted {
            Ok(_) => {
                metrics::SUSPICION_REQUEUES_TOTAL.inc();
                self.last_attempt.remove(&task_id);
                info!(task_id, "suspicion threshold crossed; requeued to PENDING");
            }
            Err(e) => debug!(task_id, error = %e, "could not requeue suspicious task"),
        }
    }

    /// Resets the suspicion counter; called by the runner-callback handler
    /// whenever a status update is received from the assigned runner (§4.4:
    /// "any successful status update from the target runner resets the
    /// counter to 0").
    pub async fn note_runner_contact(&self, task_id: TaskId) -> Result<()> {
        self.tasks
            .update(task_id, |t| {
                t.assignment_suspicion_count = 0;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn control(&self, task: &Task, action: ControlAction) -> Result<()> {
        let hostname = task
            .assigned_node
            .clone()
            .ok_or_else(|| crate::error::FleetError::Precondition(format!(
                "task {} has no assigned node",
                task.id
            )))?;
        let node = self
            .nodes
            .get(&hostname)
            .await
            .ok_or_else(|| crate::error::FleetError::NotFound(format!("node {hostname} not found")))?;
        let base_url = format!("http://{}", node.address);
        let timeout = self.health_check_period(task.kind);

        match action {
            ControlAction::Kill => {
                self.client.unmark_inflight(&base_url, task.id, timeout).await?;
                self.client.kill(&base_url, task.id, timeout).await
            }
            ControlAction::Pause => self.client.pause(&base_url, task.id, timeout).await,
            ControlAction::Resume => self.client.resume(&base_url, task.id, timeout).await,
            ControlAction::VpsStop => self.client.vps_stop(&base_url, task.id, timeout).await,
            ControlAction::VpsRestart => self.client.vps_restart(&base_url, task.id, timeout).await,
        }
    }

    pub async fn kill(&self, task: &Task) -> Result<()> {
        self.control(task, ControlAction::Kill).await
    }

    pub async fn pause(&self, task: &Task) -> Result<()> {
        self.control(task, ControlAction::Pause).await
    }

    pub async fn resume(&self, task: &Task) -> Result<()> {
        self.control(task, ControlAction::Resume).await
    }

    pub async fn vps_stop(&self, task: &Task) -> Result<()> {
        self.control(task, ControlAction::VpsStop).await
    }

    pub async fn vps_restart(&self, task: &Task) -> Result<()> {
        self.control(task, ControlAction::VpsRestart).await
    }
}

enum ControlAction {
    Kill,
    Pause,
    Resume,
    VpsStop,
    VpsRestart,
}

fn build_execute_request(task: &Task) -> ExecuteRequest {
    ExecuteRequest {
        task_id: task.id,
        command: task.command.clone(),
        args: task.args.clone(),
        env: task.env.clone(),
        cores: task.resources.cores,
        memory_bytes: task.resources.memory_bytes,
        gpu_indices: task.required_gpus.clone(),
        numa_node: task.resources.numa_node,
        reserved_ip: task.reserved_ip,
        privileged: task.privileged,
        image_ref: task.image_ref.clone(),
        environment_name: task.environment_name.clone(),
        mounts: task.mounts.clone(),
        is_vps: task.kind == TaskKind::Vps,
        vps_backend_is_vm: matches!(task.vps_backend, Some(crate::types::VpsBackend::Vm)),
        ssh_port: task.ssh_port,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store;
    use crate::types::{PrincipalTier, ResourceRequest};
    use chrono::Utc;

    fn sample_task(id: TaskId, status: TaskStatus) -> Task {
        Task {
            id,
            batch_id: None,
            kind: TaskKind::Command,
            name: None,
            owner_id: "u".into(),
            created_by_tier: PrincipalTier::Operator,
            approval_state: None,
            approver_id: None,
            approved_at: None,
            rejection_reason: None,
            command: "echo".into(),
            args: vec![],
            env: Default::default(),
            resources: ResourceRequest::default(),
            environment_name: None,
            image_ref: None,
            mounts: vec![],
            privileged: false,
            vps_backend: None,
            ssh_port: None,
            vm_base_image: None,
            vm_disk_size_bytes: None,
            vm_ip: None,
            requested_node: None,
            status,
            assigned_node: Some("r1".into()),
            assignment_suspicion_count: 0,
            required_gpus: Default::default(),
            reserved_ip: None,
            exit_code: None,
            error_message: None,
            stdout_path: None,
            stderr_path: None,
            submitted_at: Utc::now(),
            started_at: None,
            completed_at: None,
            labels: Default::default(),
        }
    }

    #[tokio::test]
    async fn r2_suspicion_crosses_threshold_and_requeues() {
        let conn = store::open_in_memory().unwrap();
        let tasks = Arc::new(TaskStore::load(conn.clone()).unwrap());
        let nodes = Arc::new(NodeRegistry::load(conn).unwrap());
        let status = Arc::new(StatusAuthority::new(tasks.clone()));
        let dispatcher = Dispatcher::new(
            tasks.clone(),
            nodes,
            status,
            DispatcherConfig {
                command_timeout: Duration::from_secs(30),
                vps_timeout: Duration::from_secs(60),
                suspicion_threshold: 3,
            },
        );

        let task = sample_task(1, TaskStatus::Assigning);
        tasks.create(task).await.unwrap();

        dispatcher.bump_suspicion(1).await;
        dispatcher.bump_suspicion(1).await;
        let after_two = tasks.get(1).await.unwrap();
        assert_eq!(after_two.status, TaskStatus::Assigning);
        assert_eq!(after_two.assignment_suspicion_count, 2);

        dispatcher.bump_suspicion(1).await;
        let after_three = tasks.get(1).await.unwrap();
        assert_eq!(after_three.status, TaskStatus::Pending);
        assert_eq!(after_three.assignment_suspicion_count, 0);
        assert!(after_three.assigned_node.is_none());
    }
}
