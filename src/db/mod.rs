//! Node persistence: the result cache and the peer directory.
//!
//! Both are single SQLite files, opened through `open_connection` so
//! they share the node's pragma choices. Concurrent access is
//! serialized by the node-level lock, not here.

pub mod peers;
pub mod results;

use std::time::Duration;

use anyhow::{anyhow, Result};
use rusqlite::Connection;

pub use peers::PeerDirectory;
pub use results::ResultStore;

/// Open one of the node's databases. `purpose` names the store in
/// error messages ("result cache", "peer directory").
///
/// File-backed databases get WAL journaling so the sync worker's batch
/// inserts do not block the query path's readers; in-memory databases
/// (tests) skip it. The busy timeout covers the brief window where the
/// checkpointer holds the file.
pub(crate) fn open_connection(path: Option<&str>, purpose: &str) -> Result<Connection> {
    let conn = match path {
        Some(p) => Connection::open(p)
            .map_err(|e| anyhow!("Failed to open {} at '{}': {}", purpose, p, e))?,
        None => Connection::open_in_memory()
            .map_err(|e| anyhow!("Failed to open in-memory {}: {}", purpose, e))?,
    };

    if path.is_some() {
        let _: String = conn
            .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
            .map_err(|e| anyhow!("Failed to set journal mode on {}: {}", purpose, e))?;
    }
    conn.pragma_update(None, "synchronous", "NORMAL")
        .map_err(|e| anyhow!("Failed to set synchronous mode on {}: {}", purpose, e))?;
    conn.busy_timeout(Duration::from_secs(5))
        .map_err(|e| anyhow!("Failed to set busy timeout on {}: {}", purpose, e))?;

    Ok(conn)
}
