//! Embedded SQLite-backed durable storage for the Host (§4.1, §6.4).

pub mod node_registry;
pub mod schema;
pub mod task_store;

use std::sync::Arc;

use rusqlite::Connection;

use crate::error::Result;

pub use node_registry::NodeRegistry;
pub use task_store::{TaskQuery, TaskStore};

/// Opens (creating if necessary) the Host's embedded database and applies
/// the schema. Wrapped in a blocking `std::sync::Mutex` because `rusqlite`
/// connections are not `Sync`; callers funnel access through
/// `tokio::task::spawn_blocking` where the call might otherwise stall the
/// executor (large `query`/batch operations), and call directly for the
/// small, fast per-row reads/writes that make up the common path.
pub fn open(path: &str) -> Result<Arc<std::sync::Mutex<Connection>>> {
    let conn = Connection::open(path)?;
    schema::init(&conn)?;
    Ok(Arc::new(std::sync::Mutex::new(conn)))
}

pub fn open_in_memory() -> Result<Arc<std::sync::Mutex<Connection>>> {
    let conn = Connection::open_in_memory()?;
    schema::init(&conn)?;
    Ok(Arc::new(std::sync::Mutex::new(conn)))
}
