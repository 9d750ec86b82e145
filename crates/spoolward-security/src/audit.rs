// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Audit trail: append-only SQLite log of every print status transition.
//
// Schema:
//   audit_log(
//     id          INTEGER PRIMARY KEY AUTOINCREMENT,
//     timestamp   TEXT NOT NULL,   -- RFC 3339, UTC, microseconds
//     action      TEXT NOT NULL,   -- see `actions`
//     job_id      TEXT,
//     token       TEXT,            -- idempotency token of the attempt
//     from_status TEXT,
//     to_status   TEXT,
//     reason      TEXT,
//     metadata    TEXT NOT NULL    -- JSON object
//   )
//
// Rows are never updated or deleted (enforced by triggers). The log doubles
// as the second source for the idempotency check: a `complete` row for a
// token survives even if the live job record is later overwritten.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use spoolward_core::error::SpoolwardError;
use spoolward_core::types::{JobId, PrintStatus};
use tracing::{debug, instrument};

/// Action names written to the `action` column.
pub mod actions {
    pub const CLAIM: &str = "claim";
    pub const COMPLETE: &str = "complete";
    pub const FAIL: &str = "fail";
    pub const EXHAUSTED: &str = "exhausted";
    pub const STALE_RECOVERED: &str = "stale_recovered";
    pub const CRASH_RECOVERY: &str = "crash_recovery";
    pub const SERVER_SHUTDOWN: &str = "server_shutdown";
    pub const SEGMENT_COMPLETED: &str = "segment_completed";
    pub const SEGMENT_FAILED: &str = "segment_failed";
    pub const ADMIN_REPRINT: &str = "admin_reprint";
    pub const ADMIN_FORCE_COMPLETE: &str = "admin_force_complete";
    pub const ADMIN_RESET_ATTEMPTS: &str = "admin_reset_attempts";
}

const CREATE_TABLE_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS audit_log (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp   TEXT NOT NULL,
        action      TEXT NOT NULL,
        job_id      TEXT,
        token       TEXT,
        from_status TEXT,
        to_status   TEXT,
        reason      TEXT,
        metadata    TEXT NOT NULL DEFAULT '{}'
    );
    CREATE INDEX IF NOT EXISTS idx_audit_token ON audit_log(token);
    CREATE INDEX IF NOT EXISTS idx_audit_job ON audit_log(job_id);
    CREATE TRIGGER IF NOT EXISTS audit_log_no_update BEFORE UPDATE ON audit_log
    BEGIN
        SELECT RAISE(ABORT, 'audit log is append-only');
    END;
    CREATE TRIGGER IF NOT EXISTS audit_log_no_delete BEFORE DELETE ON audit_log
    BEGIN
        SELECT RAISE(ABORT, 'audit log is append-only');
    END;
"#;

/// Convert a `rusqlite::Error` into a `SpoolwardError::Database`.
fn db_err(e: rusqlite::Error) -> SpoolwardError {
    SpoolwardError::Database(e.to_string())
}

/// A transition about to be written to the log.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub action: &'static str,
    pub job_id: Option<JobId>,
    pub token: Option<String>,
    pub from_status: Option<PrintStatus>,
    pub to_status: Option<PrintStatus>,
    pub reason: Option<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl AuditRecord {
    pub fn new(action: &'static str, job_id: JobId) -> Self {
        Self {
            action,
            job_id: Some(job_id),
            token: None,
            from_status: None,
            to_status: None,
            reason: None,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn token(mut self, token: Option<impl Into<String>>) -> Self {
        self.token = token.map(Into::into);
        self
    }

    pub fn transition(mut self, from: PrintStatus, to: PrintStatus) -> Self {
        self.from_status = Some(from);
        self.to_status = Some(to);
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn meta(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// A single entry read back from the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub timestamp: String,
    pub action: String,
    pub job_id: Option<String>,
    pub token: Option<String>,
    pub from_status: Option<String>,
    pub to_status: Option<String>,
    pub reason: Option<String>,
    pub metadata: serde_json::Value,
}

/// Append-only audit log backed by a SQLite database.
///
/// Cheap to clone; clones share one connection. Calls run on the blocking
/// pool so async callers are never stalled by SQLite.
#[derive(Clone)]
pub struct AuditLog {
    conn: Arc<Mutex<Connection>>,
}

impl AuditLog {
    /// Open (or create) the audit database at `path`.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SpoolwardError> {
        let conn = Connection::open(path).map_err(db_err)?;

        // Several workers append to the same file.
        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .map_err(db_err)?;
        conn.busy_timeout(Duration::from_secs(5)).map_err(db_err)?;
        conn.execute_batch(CREATE_TABLE_SQL).map_err(db_err)?;

        debug!("audit log opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory audit database (useful for tests).
    pub fn open_in_memory() -> Result<Self, SpoolwardError> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(CREATE_TABLE_SQL).map_err(db_err)?;

        debug!("in-memory audit log opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn call<T, F>(&self, op: F) -> Result<T, SpoolwardError>
    where
        F: FnOnce(&Connection) -> Result<T, SpoolwardError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| SpoolwardError::Database("audit connection poisoned".into()))?;
            op(&guard)
        })
        .await
        .map_err(|e| SpoolwardError::Database(format!("audit task: {e}")))?
    }

    /// Append a record.
    #[instrument(skip(self, record), fields(action = record.action, job_id = ?record.job_id))]
    pub async fn record(&self, record: AuditRecord) -> Result<(), SpoolwardError> {
        let metadata = serde_json::Value::Object(record.metadata).to_string();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO audit_log
                    (timestamp, action, job_id, token, from_status, to_status, reason, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
                    record.action,
                    record.job_id.map(|id| id.to_string()),
                    record.token,
                    record.from_status.map(|s| s.as_str()),
                    record.to_status.map(|s| s.as_str()),
                    record.reason,
                    metadata,
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
        .await?;

        debug!("audit entry recorded");
        Ok(())
    }

    /// Whether a completion was ever logged for `token`.
    pub async fn has_completion(&self, token: &str) -> Result<bool, SpoolwardError> {
        let token = token.to_string();
        self.call(move |conn| {
            conn.query_row(
                "SELECT 1 FROM audit_log WHERE token = ?1 AND action = ?2 LIMIT 1",
                params![token, actions::COMPLETE],
                |_| Ok(()),
            )
            .optional()
            .map(|found| found.is_some())
            .map_err(db_err)
        })
        .await
    }

    /// All entries for a job, oldest first.
    pub async fn entries_for_job(&self, job_id: JobId) -> Result<Vec<AuditEntry>, SpoolwardError> {
        self.call(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, timestamp, action, job_id, token, from_status, to_status,
                            reason, metadata
                     FROM audit_log
                     WHERE job_id = ?1
                     ORDER BY id ASC",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![job_id.to_string()], row_to_entry)
                .map_err(db_err)?;

            let mut entries = Vec::new();
            for row in rows {
                entries.push(row.map_err(db_err)?);
            }
            Ok(entries)
        })
        .await
    }

    /// Return the total number of entries in the audit log.
    pub async fn count(&self) -> Result<u64, SpoolwardError> {
        self.call(|conn| {
            conn.query_row("SELECT COUNT(*) FROM audit_log", [], |row| row.get(0))
                .map_err(db_err)
        })
        .await
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditEntry> {
    let metadata: String = row.get(8)?;
    Ok(AuditEntry {
        id: row.get(0)?,
        timestamp: row.get(1)?,
        action: row.get(2)?,
        job_id: row.get(3)?,
        token: row.get(4)?,
        from_status: row.get(5)?,
        to_status: row.get(6)?,
        reason: row.get(7)?,
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
    })
}
