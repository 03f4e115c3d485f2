//! Local SQLite store of one stork device.
//!
//! - `transfers`: the transfer-history log, one row per transfer id and
//!   direction. Rows in a terminal status only change when a resumed
//!   attempt reopens them.
//! - `trusted_peers`: peers trusted by the user, with the pinned public key.
//! - `trust_metrics`: success and failure counts behind each peer's trust score.
//!
//! Device identity and resume markers are plain files, not rows here.

pub mod migrations;
pub mod queries;

use anyhow::Result;
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::info;

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (creating parent directories) and migrate the store at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;

        // History writes from the receiver and sender interleave with API reads
        conn.pragma_update(None, "journal_mode", "WAL")?;

        migrations::run(&conn)?;

        info!("Transfer store opened at {}", path.display());
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Throwaway store for tests and in-memory engines.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        migrations::run(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // A panicked query leaves no partial statement behind.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        f(&self.lock())
    }

    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        f(&mut self.lock())
    }
}
