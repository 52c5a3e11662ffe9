//! SQLite persistence for users, thread bindings and the request log.

use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use shared::{ConversationKey, Mode};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::thread_store::ThreadStore;

/// One guarded backend request, as recorded for later analysis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub user_id: i64,
    /// e.g. "forecast", "action_check"
    pub request_type: String,
    pub request_text: Option<String>,
    pub success: bool,
    pub response_time_ms: Option<u64>,
    pub mode: Mode,
}

pub struct Database {
    conn: Arc<Mutex<Connection>>,
    db_path: Option<PathBuf>,
}

impl Database {
    /// Open (or create) the database file at `db_path`
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;
        Self::init_schema(&conn)?;
        tracing::info!(path = %db_path.display(), "database initialized");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: Some(db_path.to_path_buf()),
        })
    }

    /// Private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS users (
                user_id INTEGER PRIMARY KEY,
                mode TEXT NOT NULL DEFAULT 'free',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        // One row per (user, mode:context); the primary key makes binding atomic
        conn.execute(
            "CREATE TABLE IF NOT EXISTS thread_bindings (
                user_id INTEGER NOT NULL,
                scope TEXT NOT NULL,
                thread_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                last_delivered_run TEXT,
                PRIMARY KEY (user_id, scope)
            )",
            [],
        )?;
        // Databases created before delivery tracking; fails harmlessly once the column exists
        let _ = conn.execute(
            "ALTER TABLE thread_bindings ADD COLUMN last_delivered_run TEXT",
            [],
        );

        conn.execute(
            "CREATE TABLE IF NOT EXISTS request_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                request_type TEXT NOT NULL,
                request_text TEXT,
                success INTEGER NOT NULL,
                response_time_ms INTEGER,
                mode TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_request_log_user ON request_log(user_id)",
            [],
        )?;

        Ok(())
    }

    // ── Users ─────────────────────────────────────────────────────────

    /// Current mode of the user; unknown users are FREE.
    pub fn user_mode(&self, user_id: i64) -> Result<Mode> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT mode FROM users WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw.as_deref().and_then(Mode::parse).unwrap_or_default())
    }

    pub fn set_user_mode(&self, user_id: i64, mode: Mode) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO users (user_id, mode, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(user_id) DO UPDATE SET
                 mode = excluded.mode,
                 updated_at = excluded.updated_at",
            params![user_id, mode.as_str(), now],
        )?;
        tracing::info!(user_id, mode = mode.as_str(), "user mode updated");
        Ok(())
    }

    // ── Request log ───────────────────────────────────────────────────

    pub fn log_request(&self, record: &RequestRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO request_log
                (user_id, request_type, request_text, success, response_time_ms, mode, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.user_id,
                record.request_type,
                record.request_text,
                record.success,
                record.response_time_ms.map(|ms| ms as i64),
                record.mode.as_str(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Most recent requests of a user, newest first
    pub fn recent_requests(&self, user_id: i64, limit: usize) -> Result<Vec<RequestRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT user_id, request_type, request_text, success, response_time_ms, mode
             FROM request_log WHERE user_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![user_id, limit as i64], |row| {
            let mode: String = row.get(5)?;
            let response_time_ms: Option<i64> = row.get(4)?;
            Ok(RequestRecord {
                user_id: row.get(0)?,
                request_type: row.get(1)?,
                request_text: row.get(2)?,
                success: row.get(3)?,
                response_time_ms: response_time_ms.map(|ms| ms.max(0) as u64),
                mode: Mode::parse(&mode).unwrap_or_default(),
            })
        })?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }
}

impl ThreadStore for Database {
    fn thread_for(&self, key: &ConversationKey) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let thread_id = conn
            .query_row(
                "SELECT thread_id FROM thread_bindings WHERE user_id = ?1 AND scope = ?2",
                params![key.user_id, key.scope()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(thread_id)
    }

    fn bind_if_absent(&self, key: &ConversationKey, thread_id: &str) -> Result<String> {
        let conn = self.conn.lock();
        let scope = key.scope();
        let inserted = conn.execute(
            "INSERT INTO thread_bindings (user_id, scope, thread_id, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id, scope) DO NOTHING",
            params![key.user_id, scope, thread_id, Utc::now().to_rfc3339()],
        )?;
        if inserted == 1 {
            return Ok(thread_id.to_string());
        }
        let bound: String = conn.query_row(
            "SELECT thread_id FROM thread_bindings WHERE user_id = ?1 AND scope = ?2",
            params![key.user_id, scope],
            |row| row.get(0),
        )?;
        Ok(bound)
    }

    fn delivered_run(&self, key: &ConversationKey) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let run_id: Option<Option<String>> = conn
            .query_row(
                "SELECT last_delivered_run FROM thread_bindings WHERE user_id = ?1 AND scope = ?2",
                params![key.user_id, key.scope()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(run_id.flatten())
    }

    fn mark_delivered(&self, key: &ConversationKey, run_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE thread_bindings SET last_delivered_run = ?3 WHERE user_id = ?1 AND scope = ?2",
            params![key.user_id, key.scope(), run_id],
        )?;
        Ok(())
    }
}
