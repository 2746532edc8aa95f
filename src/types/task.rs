use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type TaskId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, strum_macros::Display, strum_macros::EnumString)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum PrincipalTier {
    User,
    Operator,
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display, strum_macros::EnumString)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum TaskKind {
    Command,
    Vps,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum VpsBackend {
    Container,
    Vm,
}

/// `None` at the Task level means "auto-approved" (spec.md §3); this enum
/// only represents the explicit states an approval can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum ApprovalState {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display, strum_macros::EnumString)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum TaskStatus {
    PendingApproval,
    Pending,
    Assigning,
    Running,
    Paused,
    Completed,
    Failed,
    Killed,
    KilledOom,
    Stopped,
    Rejected,
    Lost,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed
                | TaskStatus::Failed
                | TaskStatus::Killed
                | TaskStatus::KilledOom
                | TaskStatus::Stopped
                | TaskStatus::Rejected
        )
    }

    pub fn is_live_reservation(self) -> bool {
        matches!(
            self,
            TaskStatus::Assigning | TaskStatus::Running | TaskStatus::Paused
        )
    }
}

/// The GPU portion of a resource request: either an open count or an
/// explicit set of indices that must match exactly (§4.3).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum GpuRequest {
    #[default]
    None,
    Count(u32),
    Indices(BTreeSet<u32>),
}

impl GpuRequest {
    pub fn requested_count(&self) -> u32 {
        match self {
            GpuRequest::None => 0,
            GpuRequest::Count(n) => *n,
            GpuRequest::Indices(set) => set.len() as u32,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceRequest {
    /// 0 means "no limit" (B1).
    pub cores: u32,
    pub memory_bytes: Option<u64>,
    pub gpu: GpuRequest,
    pub numa_node: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindMount {
    pub host_path: String,
    pub container_path: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    // --- Identity ---
    pub id: TaskId,
    pub batch_id: Option<TaskId>,
    pub kind: TaskKind,
    pub name: Option<String>,

    // --- Ownership / approval ---
    pub owner_id: String,
    pub created_by_tier: PrincipalTier,
    pub approval_state: Option<ApprovalState>,
    pub approver_id: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,

    // --- Request ---
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub resources: ResourceRequest,
    pub environment_name: Option<String>,
    pub image_ref: Option<String>,
    pub mounts: Vec<BindMount>,
    pub privileged: bool,

    // --- VPS-specific ---
    pub vps_backend: Option<VpsBackend>,
    pub ssh_port: Option<u16>,
    pub vm_base_image: Option<String>,
    pub vm_disk_size_bytes: Option<u64>,
    pub vm_ip: Option<std::net::Ipv4Addr>,

    // --- Assignment ---
    /// The node pinned by the submitter's target spec (`node[:numa]...`),
    /// if any; `None` means auto-select. Distinct from `assigned_node`,
    /// which is only set once the scheduler has committed a placement.
    pub requested_node: Option<String>,
    pub status: TaskStatus,
    pub assigned_node: Option<String>,
    pub assignment_suspicion_count: u32,
    pub required_gpus: BTreeSet<u32>,
    pub reserved_ip: Option<std::net::Ipv4Addr>,

    // --- Outcome ---
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
    pub stdout_path: Option<String>,
    pub stderr_path: Option<String>,

    // --- Timestamps ---
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    // --- Supplemental (SPEC_FULL §3) ---
    pub labels: BTreeMap<String, String>,
}

impl Task {
    pub fn is_pending_approval(&self) -> bool {
        self.status == TaskStatus::PendingApproval
    }
}
