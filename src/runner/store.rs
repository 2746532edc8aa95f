//! Durable record of which tasks this runner believes are in flight, and
//! which container backs each one. Mirrors the Host's hot-cache-plus-SQLite
//! shape (`store::task_store`) at a much smaller scale: one row per task
//! actually executing on this node.
//!
//! The set doubles as the suppression mechanism for the kill/stop race
//! described in `transport::RunnerClient::unmark_inflight`: the dispatcher
//! clears a task's entry here (or a VPS-stop/restart handler clears it
//! locally) before acting on the container, so the exit watcher that
//! notices the container leaving can tell an externally commanded exit
//! apart from one it must report as a failure.

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;
use rusqlite::{Connection, params};

use crate::error::Result;
use crate::types::TaskId;

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS inflight (
            task_id      INTEGER PRIMARY KEY,
            container_id TEXT NOT NULL
        );
        "#,
    )?;
    Ok(())
}

pub struct InFlightStore {
    hot: DashMap<TaskId, String>,
    conn: Arc<std::sync::Mutex<Connection>>,
}

impl InFlightStore {
    pub fn load(conn: Arc<std::sync::Mutex<Connection>>) -> Result<Self> {
        init_schema(&conn.lock().unwrap())?;
        let hot = DashMap::new();
        {
            let guard = conn.lock().unwrap();
            let mut stmt = guard.prepare("SELECT task_id, container_id FROM inflight")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, TaskId>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                let (task_id, container_id) = row?;
                hot.insert(task_id, container_id);
            }
        }
        Ok(Self { hot, conn })
    }

    pub fn mark(&self, task_id: TaskId, container_id: &str) -> Result<()> {
        self.conn.lock().unwrap().execute(
            "INSERT INTO inflight (task_id, container_id) VALUES (?1, ?2)
             ON CONFLICT(task_id) DO UPDATE SET container_id = excluded.container_id",
            params![task_id, container_id],
        )?;
        self.hot.insert(task_id, container_id.to_string());
        Ok(())
    }

    /// Removes `task_id`, returning whether it was present. Idempotent: a
    /// second call (e.g. once from the explicit `unmark_inflight` RPC, once
    /// from the exit watcher's own cleanup) is a harmless no-op.
    pub fn unmark(&self, task_id: TaskId) -> Result<bool> {
        self.conn
            .lock()
            .unwrap()
            .execute("DELETE FROM inflight WHERE task_id = ?1", params![task_id])?;
        Ok(self.hot.remove(&task_id).is_some())
    }

    pub fn is_marked(&self, task_id: TaskId) -> bool {
        self.hot.contains_key(&task_id)
    }

    pub fn container_id(&self, task_id: TaskId) -> Option<String> {
        self.hot.get(&task_id).map(|e| e.value().clone())
    }

    pub fn task_ids(&self) -> BTreeSet<TaskId> {
        self.hot.iter().map(|e| *e.key()).collect()
    }
}
