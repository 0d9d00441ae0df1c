//! Sqlite-backed persistence for the control plane
//!
//! The store owns the schema and hands out connections; every typed
//! read/write goes through the `NodeManager`, which is the only writer.
//! A connection is opened per call with a busy timeout, so concurrent
//! readers (HTTP handlers) and the single-writer components contend on
//! sqlite's own locking rather than an in-process mutex.

use std::path::{Path, PathBuf};

use rusqlite::Connection;
use thiserror::Error;

/// Errors from the persistence layer.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Schema owner and connection factory.
#[derive(Debug, Clone)]
pub struct Store {
    path: PathBuf,
}

impl Store {
    /// Open (and create if missing) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
        };
        let conn = store.conn()?;
        Self::create_tables(&conn)?;
        Ok(store)
    }

    /// Open a connection with the store's pragmas applied.
    pub fn conn(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open(&self.path)?;
        conn.execute_batch("PRAGMA busy_timeout=10000; PRAGMA synchronous=NORMAL;")?;
        Ok(conn)
    }

    fn create_tables(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS nodes (
                node_id TEXT PRIMARY KEY,
                ip_address TEXT,
                resources TEXT,
                healthy INTEGER,
                last_heartbeat REAL,
                endpoint TEXT
            );

            CREATE TABLE IF NOT EXISTS jobs (
                job_id TEXT PRIMARY KEY,
                task_groups TEXT,
                constraints TEXT,
                status TEXT
            );

            CREATE TABLE IF NOT EXISTS allocations (
                allocation_id TEXT PRIMARY KEY,
                job_id TEXT,
                node_id TEXT,
                task_group TEXT,
                status TEXT,
                start_time REAL,
                end_time REAL,
                last_update REAL,
                FOREIGN KEY(job_id) REFERENCES jobs(job_id),
                FOREIGN KEY(node_id) REFERENCES nodes(node_id)
            );

            CREATE TABLE IF NOT EXISTS task_status (
                allocation_id TEXT,
                task_name TEXT,
                resources TEXT,
                config TEXT,
                status TEXT,
                start_time REAL,
                end_time REAL,
                error TEXT,
                exit_code INTEGER,
                last_update REAL,
                message TEXT,
                PRIMARY KEY (allocation_id, task_name),
                FOREIGN KEY(allocation_id) REFERENCES allocations(allocation_id)
            );

            CREATE TABLE IF NOT EXISTS job_templates (
                template_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT,
                task_groups TEXT NOT NULL,
                constraints TEXT,
                created_at REAL,
                updated_at REAL
            );
            COMMIT;",
        )?;
        Ok(())
    }

    /// Test-only reset: drop everything except templates, then recreate.
    pub fn clear_all(&self) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute_batch(
            "BEGIN;
            DROP TABLE IF EXISTS task_status;
            DROP TABLE IF EXISTS allocations;
            DROP TABLE IF EXISTS jobs;
            DROP TABLE IF EXISTS nodes;
            COMMIT;",
        )?;
        Self::create_tables(&conn)?;
        Ok(())
    }
}
