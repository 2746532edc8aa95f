//! Wire types and a thin HTTP client for Host <-> Runner Agent RPCs (§4.4,
//! §4.9, §4.10). Both processes link this module; the Host dials out with
//! `RunnerClient`, the Runner dials out with `HostClient`.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FleetError, Result};
use crate::types::{BindMount, NumaNode, TaskId, TaskStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub task_id: TaskId,
    pub command: String,
    pub args: Vec<String>,
    pub env: std::collections::BTreeMap<String, String>,
    pub cores: u32,
    pub memory_bytes: Option<u64>,
    pub gpu_indices: BTreeSet<u32>,
    pub numa_node: Option<u32>,
    pub reserved_ip: Option<Ipv4Addr>,
    pub privileged: bool,
    pub image_ref: Option<String>,
    pub environment_name: Option<String>,
    pub mounts: Vec<BindMount>,
    pub is_vps: bool,
    pub vps_backend_is_vm: bool,
    pub ssh_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlRequest {
    pub task_id: TaskId,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ControlResponse {
    pub accepted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub hostname: String,
    pub address: String,
    pub cores: u32,
    pub memory_bytes: u64,
    pub gpu_indices: Vec<u32>,
    pub vfio_eligible_gpu_indices: Vec<u32>,
    pub numa: Vec<NumaNode>,
    pub vm_capable: bool,
    pub runner_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub host_physical_address: String,
    /// `None` when `overlay_enabled = false` (§6.6) — registration still
    /// succeeds, the runner just runs without overlay networking, falling
    /// back to the default isolated bridge (§4.9 step 2).
    pub overlay: Option<OverlayRegistration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayRegistration {
    pub runner_id: u32,
    pub subnet: String,
    pub gateway_ip: Ipv4Addr,
    pub host_overlay_ip: Ipv4Addr,
    pub host_subnet_ip: Ipv4Addr,
    pub vni: u32,
    /// UDP destination port for the overlay tunnel, so the runner's own
    /// spoke endpoint dials the Host on the port it actually configured
    /// rather than assuming the VXLAN default.
    pub overlay_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KilledTaskReport {
    pub task_id: TaskId,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuMetric {
    pub index: u32,
    pub utilization_pct: f32,
    pub memory_used_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub hostname: String,
    pub running_tasks: BTreeSet<TaskId>,
    pub killed_tasks: Vec<KilledTaskReport>,
    pub cpu_percent: f32,
    pub memory_used_bytes: u64,
    pub memory_percent: f32,
    pub gpu_metrics: Vec<GpuMetric>,
    pub vm_capable: bool,
    pub runner_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HeartbeatResponse {
    pub acknowledged: bool,
    /// Advisory corrections the Host wants the runner to act on locally
    /// (§4.10, §6.2) — e.g. a zombie task it wants killed. The Host never
    /// kills zombies itself; it only ever asks the runner to.
    #[serde(default)]
    pub corrective_commands: Vec<CorrectiveCommand>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrectiveCommand {
    pub task_id: TaskId,
    pub action: CorrectiveAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectiveAction {
    Kill,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusUpdate {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
    /// Shared-storage paths the runner wrote stdout/stderr to (§3
    /// "Outcome"); set on the RUNNING callback, carried unchanged on every
    /// later update for the same task.
    pub stdout_path: Option<String>,
    pub stderr_path: Option<String>,
}

/// Client the Host uses to reach a Runner Agent (§4.4, §4.9).
#[derive(Clone)]
pub struct RunnerClient {
    http: reqwest::Client,
}

impl RunnerClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    pub async fn execute(
        &self,
        base_url: &str,
        req: &ExecuteRequest,
        timeout: Duration,
    ) -> Result<()> {
        self.post(base_url, "/rpc/execute", req, timeout).await
    }

    pub async fn kill(&self, base_url: &str, task_id: TaskId, timeout: Duration) -> Result<()> {
        self.post(base_url, "/rpc/kill", &ControlRequest { task_id }, timeout)
            .await
    }

    /// Clears `task_id` from the runner's local in-flight set so its
    /// workload-exit handler recognises the subsequent exit as externally
    /// commanded (§4.4). Always called before `kill`.
    pub async fn unmark_inflight(
        &self,
        base_url: &str,
        task_id: TaskId,
        timeout: Duration,
    ) -> Result<()> {
        self.post(
            base_url,
            "/rpc/unmark_inflight",
            &ControlRequest { task_id },
            timeout,
        )
        .await
    }

    pub async fn pause(&self, base_url: &str, task_id: TaskId, timeout: Duration) -> Result<()> {
        self.post(base_url, "/rpc/pause", &ControlRequest { task_id }, timeout)
            .await
    }

    pub async fn resume(&self, base_url: &str, task_id: TaskId, timeout: Duration) -> Result<()> {
        self.post(base_url, "/rpc/resume", &ControlRequest { task_id }, timeout)
            .await
    }

    pub async fn vps_stop(&self, base_url: &str, task_id: TaskId, timeout: Duration) -> Result<()> {
        self.post(base_url, "/rpc/vps_stop", &ControlRequest { task_id }, timeout)
            .await
    }

    pub async fn vps_restart(
        &self,
        base_url: &str,
        task_id: TaskId,
        timeout: Duration,
    ) -> Result<()> {
        self.post(
            base_url,
            "/rpc/vps_restart",
            &ControlRequest { task_id },
            timeout,
        )
        .await
    }

    async fn post<B: Serialize>(
        &self,
        base_url: &str,
        path: &str,
        body: &B,
        timeout: Duration,
    ) -> Result<()> {
        let resp = self
            .http
            .post(format!("{base_url}{path}"))
            .json(body)
            .timeout(timeout)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(FleetError::Transient(format!(
                "runner at {base_url} returned {} for {path}",
                resp.status()
            )));
        }
        Ok(())
    }
}

impl Default for RunnerClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Client the Runner Agent uses to call back into the Host (§4.9, §4.10).
#[derive(Clone)]
pub struct HostClient {
    http: reqwest::Client,
    base_url: String,
}

impl HostClient {
    pub fn new(base_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
        }
    }

    pub async fn register(&self, req: &RegisterRequest) -> Result<RegisterResponse> {
        let resp = self
            .http
            .post(format!("{}/runner/register", self.base_url))
            .json(req)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(FleetError::Transient(format!(
                "host registration failed: {}",
                resp.status()
            )));
        }
        Ok(resp.json().await?)
    }

    pub async fn heartbeat(&self, req: &HeartbeatRequest) -> Result<HeartbeatResponse> {
        let resp = self
            .http
            .post(format!("{}/runner/heartbeat", self.base_url))
            .json(req)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(FleetError::Transient(format!(
                "heartbeat failed: {}",
                resp.status()
            )));
        }
        Ok(resp.json().await?)
    }

    pub async fn task_status_update(&self, update: &TaskStatusUpdate) -> Result<()> {
        let resp = self
            .http
            .post(format!("{}/runner/task_status", self.base_url))
            .json(update)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(FleetError::Transient(format!(
                "status update failed: {}",
                resp.status()
            )));
        }
        Ok(())
    }
}
