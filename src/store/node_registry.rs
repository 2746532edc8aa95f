//! Durable record of registered runners, their capacity, and last-heartbeat
//! metrics (§4.1's sibling for nodes; spec.md §3 "Node").

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rusqlite::{Connection, params};
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{FleetError, Result};
use crate::types::{Liveness, Node, NodeCapacity, OverlayAllocation, decode_or_default, encode};

pub struct NodeRegistry {
    hot: DashMap<String, Arc<AsyncMutex<Node>>>,
    conn: Arc<std::sync::Mutex<Connection>>,
}

impl NodeRegistry {
    pub fn load(conn: Arc<std::sync::Mutex<Connection>>) -> Result<Self> {
        let registry = Self {
            hot: DashMap::new(),
            conn,
        };
        registry.rehydrate()?;
        Ok(registry)
    }

    fn rehydrate(&self) -> Result<()> {
        let guard = self.conn.lock().unwrap();
        let mut stmt = guard.prepare("SELECT * FROM nodes")?;
        let rows = stmt.query_map([], row_to_node)?;
        drop(stmt);
        for row in rows {
            let node = row?;
            self.hot
                .insert(node.hostname.clone(), Arc::new(AsyncMutex::new(node)));
        }
        Ok(())
    }

    /// Registers a node for the first time, or returns the existing entry
    /// if `hostname` is already known (registration is idempotent; the
    /// Overlay Allocator separately decides whether to reuse an
    /// allocation).
    pub async fn upsert(&self, node: Node) -> Result<()> {
        persist(&self.conn, &node)?;
        match self.hot.get(&node.hostname) {
            Some(entry) => {
                *entry.value().lock().await = node;
            }
            None => {
                self.hot
                    .insert(node.hostname.clone(), Arc::new(AsyncMutex::new(node)));
            }
        }
        Ok(())
    }

    pub async fn get(&self, hostname: &str) -> Option<Node> {
        match self.hot.get(hostname) {
            Some(entry) => Some(entry.value().lock().await.clone()),
            None => None,
        }
    }

    pub async fn snapshot(&self) -> Vec<Node> {
        let mut out = Vec::with_capacity(self.hot.len());
        for entry in self.hot.iter() {
            out.push(entry.value().lock().await.clone());
        }
        out
    }

    pub async fn update<F>(&self, hostname: &str, patch: F) -> Result<Node>
    where
        F: FnOnce(&mut Node) -> Result<()>,
    {
        let entry = self
            .hot
            .get(hostname)
            .ok_or_else(|| FleetError::NotFound(format!("node {hostname} not found")))?
            .clone();
        let mut guard = entry.lock().await;
        patch(&mut guard)?;
        persist(&self.conn, &guard)?;
        Ok(guard.clone())
    }

    /// Finds a previously-registered node by its reachable address, used by
    /// the Overlay Allocator to reclaim an allocation across a hostname
    /// change (§3 "Overlay Allocation" lifecycle).
    pub async fn find_by_address(&self, address: &str) -> Option<Node> {
        for entry in self.hot.iter() {
            let node = entry.value().lock().await;
            if node.address == address {
                return Some(node.clone());
            }
        }
        None
    }

    /// Finds the node currently holding a given overlay runner_id, used to
    /// resolve an IP reservation token back to the hostname the submitter
    /// pinned the task to.
    pub async fn find_by_runner_id(&self, runner_id: u32) -> Option<Node> {
        for entry in self.hot.iter() {
            let node = entry.value().lock().await;
            if node.overlay.as_ref().map(|o| o.runner_id) == Some(runner_id) {
                return Some(node.clone());
            }
        }
        None
    }
}

fn persist(conn: &Arc<std::sync::Mutex<Connection>>, node: &Node) -> Result<()> {
    let guard = conn.lock().unwrap();
    guard.execute(
        r#"
        INSERT INTO nodes (
            hostname, address, capacity_json, last_heartbeat, liveness, vm_capable,
            runner_version, overlay_json, labels_json
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        ON CONFLICT(hostname) DO UPDATE SET
            address = excluded.address,
            capacity_json = excluded.capacity_json,
            last_heartbeat = excluded.last_heartbeat,
            liveness = excluded.liveness,
            vm_capable = excluded.vm_capable,
            runner_version = excluded.runner_version,
            overlay_json = excluded.overlay_json,
            labels_json = excluded.labels_json
        "#,
        params![
            node.hostname,
            node.address,
            encode(&node.capacity),
            node.last_heartbeat.to_rfc3339(),
            node.liveness.to_string(),
            node.vm_capable,
            node.runner_version,
            node.overlay.as_ref().map(encode::<OverlayAllocation>),
            encode(&node.labels),
        ],
    )?;
    Ok(())
}

fn row_to_node(row: &rusqlite::Row) -> rusqlite::Result<Node> {
    let capacity_json: String = row.get("capacity_json")?;
    let liveness: String = row.get("liveness")?;
    let last_heartbeat: String = row.get("last_heartbeat")?;
    let overlay_json: Option<String> = row.get("overlay_json")?;
    let labels_json: String = row.get("labels_json")?;

    let capacity: NodeCapacity = decode_or_default(&capacity_json);
    let labels: BTreeMap<String, String> = decode_or_default(&labels_json);

    Ok(Node {
        hostname: row.get("hostname")?,
        address: row.get("address")?,
        capacity,
        last_heartbeat: DateTime::parse_from_rfc3339(&last_heartbeat)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        liveness: liveness.parse().unwrap_or(Liveness::Offline),
        vm_capable: row.get("vm_capable")?,
        runner_version: row.get("runner_version")?,
        overlay: overlay_json.and_then(|s| serde_json::from_str(&s).ok()),
        labels,
    })
}
