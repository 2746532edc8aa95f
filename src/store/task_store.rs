//! Durable record of every submitted task and its lifecycle fields (§4.1).
//!
//! Hot-path reads/writes are served from an in-memory
//! `DashMap<TaskId, Arc<tokio::sync::Mutex<Task>>>`; SQLite is the durable
//! mirror, written inside the same per-task critical section. Writes are
//! serialized per task id; reads are lock-free snapshots via `DashMap`
//! cloning, matching the "per-row lock, shared reads" policy of §5.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rusqlite::{Connection, params};
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{FleetError, Result};
use crate::types::{
    ApprovalState, PrincipalTier, Task, TaskId, TaskKind, TaskStatus, VpsBackend, decode_or_default,
    encode,
};

#[derive(Debug, Clone, Default)]
pub struct TaskQuery {
    pub statuses: Option<BTreeSet<TaskStatus>>,
    pub assigned_node: Option<String>,
    pub owner_id: Option<String>,
    pub approval_state: Option<Option<ApprovalState>>,
    pub submitted_after: Option<DateTime<Utc>>,
    pub submitted_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

pub struct TaskStore {
    hot: DashMap<TaskId, Arc<AsyncMutex<Task>>>,
    conn: Arc<std::sync::Mutex<Connection>>,
}

impl TaskStore {
    pub fn load(conn: Arc<std::sync::Mutex<Connection>>) -> Result<Self> {
        let store = Self {
            hot: DashMap::new(),
            conn,
        };
        store.rehydrate()?;
        Ok(store)
    }

    fn rehydrate(&self) -> Result<()> {
        let guard = self.conn.lock().unwrap();
        let mut stmt = guard.prepare("SELECT * FROM tasks")?;
        let rows = stmt.query_map([], row_to_task)?;
        drop(stmt);
        for row in rows {
            let task = row?;
            self.hot.insert(task.id, Arc::new(AsyncMutex::new(task)));
        }
        Ok(())
    }

    /// Inserts a brand-new task, assigning no id management here: the
    /// caller (the Approval Gate / submit handler) supplies a pre-minted
    /// monotonic id via `ids::IdGenerator`.
    pub async fn create(&self, task: Task) -> Result<TaskId> {
        let id = task.id;
        persist(&self.conn, &task)?;
        self.hot.insert(id, Arc::new(AsyncMutex::new(task)));
        Ok(id)
    }

    /// Applies `patch` to the task under its per-task lock, then persists
    /// the result, all before releasing the lock.
    pub async fn update<F>(&self, id: TaskId, patch: F) -> Result<Task>
    where
        F: FnOnce(&mut Task) -> Result<()>,
    {
        let entry = self
            .hot
            .get(&id)
            .ok_or_else(|| FleetError::NotFound(format!("task {id} not found")))?
            .clone();
        let mut guard = entry.lock().await;
        if guard.status.is_terminal() {
            return Err(FleetError::Precondition(format!(
                "task {id} is terminal ({:?}) and cannot be mutated",
                guard.status
            )));
        }
        patch(&mut guard)?;
        persist(&self.conn, &guard)?;
        Ok(guard.clone())
    }

    /// Variant of `update` used by the deletion path and tests, which does
    /// not refuse terminal tasks.
    pub async fn force_update<F>(&self, id: TaskId, patch: F) -> Result<Task>
    where
        F: FnOnce(&mut Task) -> Result<()>,
    {
        let entry = self
            .hot
            .get(&id)
            .ok_or_else(|| FleetError::NotFound(format!("task {id} not found")))?
            .clone();
        let mut guard = entry.lock().await;
        patch(&mut guard)?;
        persist(&self.conn, &guard)?;
        Ok(guard.clone())
    }

    pub async fn get(&self, id: TaskId) -> Option<Task> {
        match self.hot.get(&id) {
            Some(entry) => Some(entry.value().lock().await.clone()),
            None => None,
        }
    }

    /// A snapshot view used by the Resource Accountant and Scheduler; since
    /// each entry is independently locked, this is a point-in-time
    /// approximation rather than a single consistent transaction, which is
    /// sufficient because scheduling decisions are re-validated on commit.
    pub async fn snapshot(&self) -> Vec<Task> {
        let mut out = Vec::with_capacity(self.hot.len());
        for entry in self.hot.iter() {
            out.push(entry.value().lock().await.clone());
        }
        out
    }

    pub async fn query(&self, q: &TaskQuery) -> Vec<Task> {
        let mut tasks = self.snapshot().await;
        tasks.retain(|t| {
            if let Some(statuses) = &q.statuses
                && !statuses.contains(&t.status)
            {
                return false;
            }
            if let Some(node) = &q.assigned_node
                && t.assigned_node.as_deref() != Some(node.as_str())
            {
                return false;
            }
            if let Some(owner) = &q.owner_id
                && &t.owner_id != owner
            {
                return false;
            }
            if let Some(approval) = &q.approval_state
                && &t.approval_state != approval
            {
                return false;
            }
            if let Some(after) = q.submitted_after
                && t.submitted_at < after
            {
                return false;
            }
            if let Some(before) = q.submitted_before
                && t.submitted_at > before
            {
                return false;
            }
            true
        });
        tasks.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
        let offset = q.offset.unwrap_or(0);
        let tasks = if offset < tasks.len() {
            tasks.split_off(offset)
        } else {
            Vec::new()
        };
        match q.limit {
            Some(limit) => tasks.into_iter().take(limit).collect(),
            None => tasks,
        }
    }

    /// Deletion is only permitted in terminal states (§4.1).
    pub async fn delete(&self, id: TaskId) -> Result<()> {
        let Some((_, entry)) = self.hot.remove(&id) else {
            return Err(FleetError::NotFound(format!("task {id} not found")));
        };
        let guard = entry.lock().await;
        if !guard.status.is_terminal() {
            let status = guard.status;
            drop(guard);
            self.hot.insert(id, entry);
            return Err(FleetError::Precondition(format!(
                "task {id} is not terminal ({status:?}); cannot delete"
            )));
        }
        drop(guard);
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
        Ok(())
    }
}

fn persist(conn: &Arc<std::sync::Mutex<Connection>>, task: &Task) -> Result<()> {
    let guard = conn.lock().unwrap();
    guard.execute(
        r#"
        INSERT INTO tasks (
            id, batch_id, kind, name, owner_id, created_by_tier, approval_state, approver_id,
            approved_at, rejection_reason, command, args_json, env_json, resources_json,
            environment_name, image_ref, mounts_json, privileged, vps_backend, ssh_port,
            vm_base_image, vm_disk_size_bytes, vm_ip, requested_node, status, assigned_node,
            assignment_suspicion_count, required_gpus_json, reserved_ip, exit_code,
            error_message, stdout_path, stderr_path, submitted_at, started_at, completed_at,
            labels_json
        ) VALUES (
            ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19,
            ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30, ?31, ?32, ?33, ?34, ?35, ?36, ?37
        )
        ON CONFLICT(id) DO UPDATE SET
            batch_id = excluded.batch_id,
            name = excluded.name,
            approval_state = excluded.approval_state,
            approver_id = excluded.approver_id,
            approved_at = excluded.approved_at,
            rejection_reason = excluded.rejection_reason,
            status = excluded.status,
            assigned_node = excluded.assigned_node,
            assignment_suspicion_count = excluded.assignment_suspicion_count,
            required_gpus_json = excluded.required_gpus_json,
            reserved_ip = excluded.reserved_ip,
            exit_code = excluded.exit_code,
            error_message = excluded.error_message,
            stdout_path = excluded.stdout_path,
            stderr_path = excluded.stderr_path,
            started_at = excluded.started_at,
            completed_at = excluded.completed_at,
            ssh_port = excluded.ssh_port,
            vm_ip = excluded.vm_ip,
            labels_json = excluded.labels_json
        "#,
        params![
            task.id,
            task.batch_id,
            task.kind.to_string(),
            task.name,
            task.owner_id,
            task.created_by_tier.to_string(),
            task.approval_state.map(|s| s.to_string()),
            task.approver_id,
            task.approved_at.map(|t| t.to_rfc3339()),
            task.rejection_reason,
            task.command,
            encode(&task.args),
            encode(&task.env),
            encode(&task.resources),
            task.environment_name,
            task.image_ref,
            encode(&task.mounts),
            task.privileged,
            task.vps_backend.map(|b| b.to_string()),
            task.ssh_port,
            task.vm_base_image,
            task.vm_disk_size_bytes.map(|v| v as i64),
            task.vm_ip.map(|ip| ip.to_string()),
            task.requested_node,
            task.status.to_string(),
            task.assigned_node,
            task.assignment_suspicion_count,
            encode(&task.required_gpus),
            task.reserved_ip.map(|ip| ip.to_string()),
            task.exit_code,
            task.error_message,
            task.stdout_path,
            task.stderr_path,
            task.submitted_at.to_rfc3339(),
            task.started_at.map(|t| t.to_rfc3339()),
            task.completed_at.map(|t| t.to_rfc3339()),
            encode(&task.labels),
        ],
    )?;
    Ok(())
}

fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<Task> {
    use std::str::FromStr;

    let kind: String = row.get("kind")?;
    let status: String = row.get("status")?;
    let created_by_tier: String = row.get("created_by_tier")?;
    let approval_state: Option<String> = row.get("approval_state")?;
    let vps_backend: Option<String> = row.get("vps_backend")?;

    let args_json: String = row.get("args_json")?;
    let env_json: String = row.get("env_json")?;
    let resources_json: String = row.get("resources_json")?;
    let mounts_json: String = row.get("mounts_json")?;
    let required_gpus_json: String = row.get("required_gpus_json")?;
    let labels_json: String = row.get("labels_json")?;

    let vm_ip: Option<String> = row.get("vm_ip")?;
    let reserved_ip: Option<String> = row.get("reserved_ip")?;
    let submitted_at: String = row.get("submitted_at")?;
    let started_at: Option<String> = row.get("started_at")?;
    let completed_at: Option<String> = row.get("completed_at")?;
    let approved_at: Option<String> = row.get("approved_at")?;

    Ok(Task {
        id: row.get("id")?,
        batch_id: row.get("batch_id")?,
        kind: parse_or(&kind, TaskKind::Command),
        name: row.get("name")?,
        owner_id: row.get("owner_id")?,
        created_by_tier: parse_or(&created_by_tier, PrincipalTier::User),
        approval_state: approval_state.and_then(|s| ApprovalState::from_str_lenient(&s)),
        approver_id: row.get("approver_id")?,
        approved_at: approved_at.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|d| d.with_timezone(&Utc)),
        rejection_reason: row.get("rejection_reason")?,
        command: row.get("command")?,
        args: decode_or_default(&args_json),
        env: decode_or_default(&env_json),
        resources: decode_or_default(&resources_json),
        environment_name: row.get("environment_name")?,
        image_ref: row.get("image_ref")?,
        mounts: decode_or_default(&mounts_json),
        privileged: row.get("privileged")?,
        vps_backend: vps_backend.and_then(|s| VpsBackend::from_str_lenient(&s)),
        ssh_port: row.get::<_, Option<i64>>("ssh_port")?.map(|v| v as u16),
        vm_base_image: row.get("vm_base_image")?,
        vm_disk_size_bytes: row
            .get::<_, Option<i64>>("vm_disk_size_bytes")?
            .map(|v| v as u64),
        vm_ip: vm_ip.and_then(|s| s.parse().ok()),
        requested_node: row.get("requested_node")?,
        status: parse_or(&status, TaskStatus::Lost),
        assigned_node: row.get("assigned_node")?,
        assignment_suspicion_count: row.get::<_, i64>("assignment_suspicion_count")? as u32,
        required_gpus: decode_or_default(&required_gpus_json),
        reserved_ip: reserved_ip.and_then(|s| s.parse().ok()),
        exit_code: row.get("exit_code")?,
        error_message: row.get("error_message")?,
        stdout_path: row.get("stdout_path")?,
        stderr_path: row.get("stderr_path")?,
        submitted_at: DateTime::parse_from_rfc3339(&submitted_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        started_at: started_at
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|d| d.with_timezone(&Utc)),
        completed_at: completed_at
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|d| d.with_timezone(&Utc)),
        labels: decode_or_default(&labels_json),
    })
}

fn parse_or<T: std::str::FromStr>(s: &str, default: T) -> T {
    s.parse().unwrap_or(default)
}

/// Small helper trait so enum columns that may be malformed degrade to
/// `None` instead of panicking, matching the "tolerate malformed input"
/// rule for JSON-ish columns extended to enum columns.
trait FromStrLenient: Sized {
    fn from_str_lenient(s: &str) -> Option<Self>;
}

impl FromStrLenient for ApprovalState {
    fn from_str_lenient(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(ApprovalState::Pending),
            "APPROVED" => Some(ApprovalState::Approved),
            "REJECTED" => Some(ApprovalState::Rejected),
            _ => None,
        }
    }
}

impl FromStrLenient for VpsBackend {
    fn from_str_lenient(s: &str) -> Option<Self> {
        match s {
            "CONTAINER" => Some(VpsBackend::Container),
            "VM" => Some(VpsBackend::Vm),
            _ => None,
        }
    }
}
