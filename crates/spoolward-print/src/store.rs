// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Shared job store backed by SQLite.
//
// Every worker process opens the same database. The only cross-worker
// exclusion is the predicate on each UPDATE: a write that finds its
// precondition no longer true touches zero rows, and the caller treats
// that as having lost the race. Nothing here takes a lock beyond the
// connection mutex, which only serialises calls within one process.
//
// Statuses are stored as lowercase keywords. Timestamps are RFC 3339 UTC
// with fixed microsecond precision so string comparison in SQL matches
// chronological order.

use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use spoolward_core::error::{Result, SpoolwardError};
use spoolward_core::types::{JobId, PrintJob, Printer, Segment, WorkerId};

use crate::transport::PrinterFleet;

/// Prefix of the terminal error written when a job runs out of attempts.
/// Jobs carrying it are skipped by polling until an operator resets them.
pub const EXHAUSTED_PREFIX: &str = "exceeded max attempts";

const CREATE_TABLES_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id                 TEXT PRIMARY KEY,
        order_number       TEXT NOT NULL,
        payment_status     TEXT NOT NULL,
        print_status       TEXT NOT NULL,
        print_error        TEXT,
        printer_id         TEXT,
        printer_name       TEXT,
        started_at         TEXT,
        completed_at       TEXT,
        idempotency_token  TEXT,
        print_attempt      INTEGER NOT NULL DEFAULT 0,
        max_print_attempts INTEGER NOT NULL DEFAULT 3,
        owner_worker_id    TEXT,
        heartbeat_at       TEXT,
        segments           TEXT NOT NULL DEFAULT '[]',
        requirements       TEXT NOT NULL,
        files              TEXT NOT NULL DEFAULT '[]',
        created_at         TEXT NOT NULL,
        updated_at         TEXT NOT NULL
    );
    CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_token
        ON jobs(idempotency_token) WHERE idempotency_token IS NOT NULL;
    CREATE INDEX IF NOT EXISTS idx_jobs_poll ON jobs(print_status, created_at);
    CREATE INDEX IF NOT EXISTS idx_jobs_owner ON jobs(owner_worker_id, print_status);

    CREATE TABLE IF NOT EXISTS printers (
        id           TEXT PRIMARY KEY,
        name         TEXT NOT NULL,
        uri          TEXT NOT NULL,
        active       INTEGER NOT NULL DEFAULT 1,
        auto_print   INTEGER NOT NULL DEFAULT 1,
        status       TEXT NOT NULL,
        queue_length INTEGER NOT NULL DEFAULT 0,
        capabilities TEXT
    );

    CREATE TABLE IF NOT EXISTS workers (
        worker_id    TEXT PRIMARY KEY,
        boot_id      TEXT NOT NULL,
        started_at   TEXT NOT NULL,
        heartbeat_at TEXT NOT NULL
    );
"#;

const JOB_COLUMNS: &str = "id, order_number, payment_status, print_status, print_error,
    printer_id, printer_name, started_at, completed_at, idempotency_token,
    print_attempt, max_print_attempts, owner_worker_id, heartbeat_at,
    segments, requirements, files, created_at, updated_at";

/// Fields cleared whenever a job leaves `printing` for `pending`.
const RELEASE_FIELDS: &str = "print_status = 'pending', started_at = NULL, printer_id = NULL,
    printer_name = NULL, owner_worker_id = NULL, idempotency_token = NULL, heartbeat_at = NULL";

fn db_err(e: rusqlite::Error) -> SpoolwardError {
    SpoolwardError::Database(e.to_string())
}

/// Canonical timestamp encoding for every column in this store.
pub(crate) fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Persistent job and printer tables shared by all workers.
///
/// Clones share one connection; calls run on the blocking pool.
#[derive(Clone)]
pub struct JobStore {
    conn: Arc<Mutex<Connection>>,
}

impl JobStore {
    /// Open (or create) the store at `path` in WAL mode.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| SpoolwardError::Database(format!("open: {e}")))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| SpoolwardError::Database(format!("WAL pragma: {e}")))?;
        conn.busy_timeout(Duration::from_secs(5)).map_err(db_err)?;
        conn.execute_batch(CREATE_TABLES_SQL)
            .map_err(|e| SpoolwardError::Database(format!("create tables: {e}")))?;

        info!("job store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory store (useful for tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| SpoolwardError::Database(format!("open in-memory: {e}")))?;
        conn.execute_batch(CREATE_TABLES_SQL)
            .map_err(|e| SpoolwardError::Database(format!("create tables: {e}")))?;

        debug!("in-memory job store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) async fn call<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| SpoolwardError::Database("store connection poisoned".into()))?;
            op(&guard)
        })
        .await
        .map_err(|e| SpoolwardError::Database(format!("store task: {e}")))?
    }

    // -- Intake and reads ---------------------------------------------------

    /// Insert a job as order intake would.
    #[instrument(skip(self, job), fields(job_id = %job.id))]
    pub async fn insert_job(&self, job: &PrintJob) -> Result<()> {
        let job = job.clone();
        self.call(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO jobs ({JOB_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                             ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)"
                ),
                params![
                    job.id.to_string(),
                    job.order_number,
                    job.payment_status.as_str(),
                    job.print_status.as_str(),
                    job.print_error,
                    job.printer_id,
                    job.printer_name,
                    job.started_at.map(ts),
                    job.completed_at.map(ts),
                    job.idempotency_token,
                    job.print_attempt,
                    job.max_print_attempts,
                    job.owner_worker_id.as_ref().map(|w| w.as_str().to_string()),
                    job.heartbeat_at.map(ts),
                    serde_json::to_string(&job.segments)?,
                    serde_json::to_string(&job.requirements)?,
                    serde_json::to_string(&job.files)?,
                    ts(job.created_at),
                    ts(job.updated_at),
                ],
            )
            .map_err(|e| SpoolwardError::Database(format!("insert job: {e}")))?;
            Ok(())
        })
        .await?;

        info!("job inserted");
        Ok(())
    }

    /// Fetch one job. `None` if it does not exist.
    pub async fn get_job(&self, job_id: JobId) -> Result<Option<PrintJob>> {
        self.call(move |conn| {
            conn.query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![job_id.to_string()],
                row_to_print_job,
            )
            .optional()
            .map_err(db_err)
        })
        .await
    }

    /// Paid, pending jobs oldest first, at most `limit`.
    ///
    /// Includes jobs that have used up their attempts but have not yet been
    /// frozen, so a claim attempt can record the terminal error once.
    #[instrument(skip(self))]
    pub async fn claimable_jobs(&self, limit: u32) -> Result<Vec<PrintJob>> {
        let jobs = self
            .call(move |conn| {
                let sql = format!(
                    "SELECT {JOB_COLUMNS} FROM jobs
                     WHERE print_status = 'pending' AND payment_status = 'completed'
                       AND (print_attempt < max_print_attempts
                            OR print_error IS NULL
                            OR print_error NOT LIKE '{EXHAUSTED_PREFIX}%')
                     ORDER BY created_at ASC
                     LIMIT ?1"
                );
                query_jobs(conn, &sql, params![limit])
            })
            .await?;

        debug!(count = jobs.len(), "claimable jobs fetched");
        Ok(jobs)
    }

    /// Number of paid jobs waiting to be claimed (frozen jobs excluded).
    pub async fn count_backlog(&self) -> Result<u64> {
        self.call(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM jobs
                 WHERE print_status = 'pending' AND payment_status = 'completed'
                   AND print_attempt < max_print_attempts",
                [],
                |row| row.get(0),
            )
            .map_err(db_err)
        })
        .await
    }

    /// Jobs currently printing on behalf of `worker`.
    pub async fn owned_printing_jobs(&self, worker: &WorkerId) -> Result<Vec<JobId>> {
        let worker = worker.as_str().to_string();
        self.call(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id FROM jobs
                     WHERE print_status = 'printing' AND owner_worker_id = ?1
                     ORDER BY started_at ASC",
                )
                .map_err(db_err)?;
            let ids = stmt
                .query_map(params![worker], |row| {
                    let raw: String = row.get(0)?;
                    JobId::from_str(&raw).map_err(|e| conversion_err(0, e))
                })
                .map_err(db_err)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err)?;
            Ok(ids)
        })
        .await
    }

    /// Whether the live record shows `token` as a finished print.
    pub async fn printed_with_token(&self, token: &str) -> Result<bool> {
        let token = token.to_string();
        self.call(move |conn| {
            conn.query_row(
                "SELECT 1 FROM jobs
                 WHERE idempotency_token = ?1 AND print_status = 'printed'
                 LIMIT 1",
                params![token],
                |_| Ok(()),
            )
            .optional()
            .map(|found| found.is_some())
            .map_err(db_err)
        })
        .await
    }

    // -- Worker leases --------------------------------------------------------

    /// Take the lease on `worker` for run `boot_id`. Succeeds when the id is
    /// free, held by the same run, or held by a run whose last renewal is
    /// older than `cutoff`. Returns false when another live run holds it.
    #[instrument(skip(self), fields(worker_id = %worker))]
    pub async fn register_worker(
        &self,
        worker: &WorkerId,
        boot_id: Uuid,
        now: DateTime<Utc>,
        cutoff: DateTime<Utc>,
    ) -> Result<bool> {
        let worker = worker.as_str().to_string();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO workers (worker_id, boot_id, started_at, heartbeat_at)
                 VALUES (?1, ?2, ?3, ?3)
                 ON CONFLICT(worker_id) DO UPDATE SET
                    boot_id = excluded.boot_id, started_at = excluded.started_at,
                    heartbeat_at = excluded.heartbeat_at
                 WHERE workers.heartbeat_at < ?4 OR workers.boot_id = excluded.boot_id",
                params![worker, boot_id.to_string(), ts(now), ts(cutoff)],
            )
            .map(|rows| rows == 1)
            .map_err(db_err)
        })
        .await
    }

    /// Refresh the lease held by run `boot_id`. Returns rows changed.
    pub async fn renew_worker(&self, worker: &WorkerId, boot_id: Uuid, now: DateTime<Utc>) -> Result<usize> {
        let worker = worker.as_str().to_string();
        self.call(move |conn| {
            conn.execute(
                "UPDATE workers SET heartbeat_at = ?3 WHERE worker_id = ?1 AND boot_id = ?2",
                params![worker, boot_id.to_string(), ts(now)],
            )
            .map_err(db_err)
        })
        .await
    }

    /// Drop the lease held by run `boot_id`, freeing the id immediately.
    pub async fn unregister_worker(&self, worker: &WorkerId, boot_id: Uuid) -> Result<usize> {
        let worker = worker.as_str().to_string();
        self.call(move |conn| {
            conn.execute(
                "DELETE FROM workers WHERE worker_id = ?1 AND boot_id = ?2",
                params![worker, boot_id.to_string()],
            )
            .map_err(db_err)
        })
        .await
    }

    // -- Atomic transitions --------------------------------------------------

    /// pending → printing, gated on the job still being pending, paid and
    /// under its attempt budget. Returns rows changed (0 or 1).
    ///
    /// `budget` replaces `max_print_attempts` on a job's first claim only;
    /// a job already tried keeps the budget it started with.
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip(self, token), fields(job_id = %job_id, worker_id = %worker))]
    pub async fn try_claim(
        &self,
        job_id: JobId,
        printer_id: &str,
        printer_name: &str,
        token: &str,
        worker: &WorkerId,
        budget: Option<u32>,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let printer_id = printer_id.to_string();
        let printer_name = printer_name.to_string();
        let token = token.to_string();
        let worker = worker.as_str().to_string();
        self.call(move |conn| {
            let now = ts(now);
            conn.execute(
                "UPDATE jobs SET
                    print_status = 'printing', started_at = ?1, printer_id = ?2,
                    printer_name = ?3, idempotency_token = ?4, owner_worker_id = ?5,
                    print_attempt = print_attempt + 1, heartbeat_at = ?1, updated_at = ?1,
                    max_print_attempts = CASE WHEN print_attempt = 0
                        THEN COALESCE(?7, max_print_attempts) ELSE max_print_attempts END
                 WHERE id = ?6 AND print_status = 'pending'
                   AND payment_status = 'completed'
                   AND print_attempt < max_print_attempts",
                params![now, printer_id, printer_name, token, worker, job_id.to_string(), budget],
            )
            .map_err(db_err)
        })
        .await
    }

    /// printing → printed for a job `worker` still owns. Returns the job's
    /// idempotency token on success, `None` when nothing matched.
    #[instrument(skip(self), fields(job_id = %job_id, worker_id = %worker))]
    pub async fn try_complete(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<Option<String>>> {
        let worker = worker.as_str().to_string();
        self.call(move |conn| {
            let now = ts(now);
            conn.query_row(
                "UPDATE jobs SET
                    print_status = 'printed', completed_at = ?1, owner_worker_id = NULL,
                    heartbeat_at = NULL, print_error = NULL, updated_at = ?1
                 WHERE id = ?2 AND owner_worker_id = ?3 AND print_status = 'printing'
                 RETURNING idempotency_token",
                params![now, job_id.to_string(), worker],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)
        })
        .await
    }

    /// printing → pending for a job `worker` still owns, recording `message`
    /// and counting the attempt.
    #[instrument(skip(self, message), fields(job_id = %job_id, worker_id = %worker))]
    pub async fn try_fail(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let worker = worker.as_str().to_string();
        let message = message.to_string();
        self.call(move |conn| {
            conn.execute(
                &format!(
                    "UPDATE jobs SET {RELEASE_FIELDS}, print_error = ?1,
                        print_attempt = print_attempt + 1, updated_at = ?2
                     WHERE id = ?3 AND owner_worker_id = ?4 AND print_status = 'printing'"
                ),
                params![message, ts(now), job_id.to_string(), worker],
            )
            .map_err(db_err)
        })
        .await
    }

    /// Freeze an exhausted job with a terminal error. Status is untouched.
    pub async fn set_terminal_error(&self, job_id: JobId, message: &str, now: DateTime<Utc>) -> Result<usize> {
        let message = message.to_string();
        self.call(move |conn| {
            conn.execute(
                "UPDATE jobs SET print_error = ?1, updated_at = ?2
                 WHERE id = ?3 AND print_status = 'pending'
                   AND print_attempt >= max_print_attempts",
                params![message, ts(now), job_id.to_string()],
            )
            .map_err(db_err)
        })
        .await
    }

    /// Refresh the heartbeat of every job `worker` is printing.
    pub async fn touch_heartbeats(&self, worker: &WorkerId, now: DateTime<Utc>) -> Result<usize> {
        let worker = worker.as_str().to_string();
        self.call(move |conn| {
            conn.execute(
                "UPDATE jobs SET heartbeat_at = ?1
                 WHERE owner_worker_id = ?2 AND print_status = 'printing'",
                params![ts(now), worker],
            )
            .map_err(db_err)
        })
        .await
    }

    /// Refresh the heartbeat of one job `worker` is printing.
    pub async fn touch_heartbeat(&self, job_id: JobId, worker: &WorkerId, now: DateTime<Utc>) -> Result<usize> {
        let worker = worker.as_str().to_string();
        self.call(move |conn| {
            conn.execute(
                "UPDATE jobs SET heartbeat_at = ?1
                 WHERE id = ?2 AND owner_worker_id = ?3 AND print_status = 'printing'",
                params![ts(now), job_id.to_string(), worker],
            )
            .map_err(db_err)
        })
        .await
    }

    /// Persist segment progress for a job `worker` still owns.
    pub async fn save_segments(&self, job_id: JobId, worker: &WorkerId, segments: &[Segment]) -> Result<usize> {
        let worker = worker.as_str().to_string();
        let json = serde_json::to_string(segments)?;
        self.call(move |conn| {
            conn.execute(
                "UPDATE jobs SET segments = ?1, updated_at = ?2
                 WHERE id = ?3 AND owner_worker_id = ?4 AND print_status = 'printing'",
                params![json, ts(Utc::now()), job_id.to_string(), worker],
            )
            .map_err(db_err)
        })
        .await
    }

    // -- Recovery ------------------------------------------------------------

    /// Printing jobs whose heartbeat is older than `cutoff` or missing.
    pub async fn stale_jobs(&self, cutoff: DateTime<Utc>) -> Result<Vec<PrintJob>> {
        self.call(move |conn| {
            let sql = format!(
                "SELECT {JOB_COLUMNS} FROM jobs
                 WHERE print_status = 'printing'
                   AND (heartbeat_at IS NULL OR heartbeat_at < ?1)
                 ORDER BY heartbeat_at ASC"
            );
            query_jobs(conn, &sql, params![ts(cutoff)])
        })
        .await
    }

    /// Read-only count for health reporting.
    pub async fn count_stale(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.call(move |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM jobs
                 WHERE print_status = 'printing'
                   AND (heartbeat_at IS NULL OR heartbeat_at < ?1)",
                params![ts(cutoff)],
                |row| row.get(0),
            )
            .map_err(db_err)
        })
        .await
    }

    /// Privileged reset of a stale job regardless of owner. Still gated on
    /// the job being stale, so a heartbeat that lands first wins.
    #[instrument(skip(self, message), fields(job_id = %job_id))]
    pub async fn force_reset_stale(
        &self,
        job_id: JobId,
        cutoff: DateTime<Utc>,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let message = message.to_string();
        self.call(move |conn| {
            conn.execute(
                &format!(
                    "UPDATE jobs SET {RELEASE_FIELDS}, print_error = ?1,
                        print_attempt = print_attempt + 1, updated_at = ?2
                     WHERE id = ?3 AND print_status = 'printing'
                       AND (heartbeat_at IS NULL OR heartbeat_at < ?4)"
                ),
                params![message, ts(now), job_id.to_string(), ts(cutoff)],
            )
            .map_err(db_err)
        })
        .await
    }

    /// Reset printing jobs owned by `worker` or by nobody. Returns each
    /// job as it was before the reset.
    #[instrument(skip(self, message), fields(worker_id = %worker))]
    pub async fn recover_crashed(
        &self,
        worker: &WorkerId,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<PrintJob>> {
        let worker = worker.as_str().to_string();
        let message = message.to_string();
        self.call(move |conn| {
            let sql = format!(
                "SELECT {JOB_COLUMNS} FROM jobs
                 WHERE print_status = 'printing'
                   AND (owner_worker_id = ?1 OR owner_worker_id IS NULL)"
            );
            let candidates = query_jobs(conn, &sql, params![worker])?;

            let mut recovered = Vec::with_capacity(candidates.len());
            for job in candidates {
                let rows = conn
                    .execute(
                        &format!(
                            "UPDATE jobs SET {RELEASE_FIELDS}, print_error = ?1,
                                print_attempt = print_attempt + 1, updated_at = ?2
                             WHERE id = ?3 AND print_status = 'printing'
                               AND (owner_worker_id = ?4 OR owner_worker_id IS NULL)"
                        ),
                        params![message, ts(now), job.id.to_string(), worker],
                    )
                    .map_err(db_err)?;
                if rows == 1 {
                    recovered.push(job);
                }
            }
            Ok(recovered)
        })
        .await
    }

    /// Hand a job back to the queue without counting an attempt.
    #[instrument(skip(self), fields(job_id = %job_id, worker_id = %worker))]
    pub async fn release_owned(&self, job_id: JobId, worker: &WorkerId, now: DateTime<Utc>) -> Result<usize> {
        let worker = worker.as_str().to_string();
        self.call(move |conn| {
            conn.execute(
                &format!(
                    "UPDATE jobs SET {RELEASE_FIELDS}, updated_at = ?1
                     WHERE id = ?2 AND owner_worker_id = ?3 AND print_status = 'printing'"
                ),
                params![ts(now), job_id.to_string(), worker],
            )
            .map_err(db_err)
        })
        .await
    }

    // -- Operator overrides --------------------------------------------------

    /// printed → pending with a fresh attempt budget and no segment progress.
    pub async fn admin_reprint(&self, job_id: JobId, now: DateTime<Utc>) -> Result<usize> {
        self.call(move |conn| {
            conn.execute(
                &format!(
                    "UPDATE jobs SET {RELEASE_FIELDS}, completed_at = NULL, print_error = NULL,
                        print_attempt = 0, segments = '[]', updated_at = ?1
                     WHERE id = ?2 AND print_status = 'printed'"
                ),
                params![ts(now), job_id.to_string()],
            )
            .map_err(db_err)
        })
        .await
    }

    /// printing → printed whoever owns the job. Returns the token like
    /// [`JobStore::try_complete`].
    pub async fn admin_force_complete(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Option<Option<String>>> {
        self.call(move |conn| {
            let now = ts(now);
            conn.query_row(
                "UPDATE jobs SET
                    print_status = 'printed', completed_at = ?1, owner_worker_id = NULL,
                    heartbeat_at = NULL, print_error = NULL, updated_at = ?1
                 WHERE id = ?2 AND print_status = 'printing'
                 RETURNING idempotency_token",
                params![now, job_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)
        })
        .await
    }

    /// Unfreeze a pending job: attempts back to zero, error cleared.
    pub async fn admin_reset_attempts(&self, job_id: JobId, now: DateTime<Utc>) -> Result<usize> {
        self.call(move |conn| {
            conn.execute(
                "UPDATE jobs SET print_attempt = 0, print_error = NULL, updated_at = ?1
                 WHERE id = ?2 AND print_status = 'pending'",
                params![ts(now), job_id.to_string()],
            )
            .map_err(db_err)
        })
        .await
    }

    // -- Printers ------------------------------------------------------------

    /// Insert or replace a printer record.
    #[instrument(skip(self, printer), fields(printer = %printer.id))]
    pub async fn upsert_printer(&self, printer: &Printer) -> Result<()> {
        let printer = printer.clone();
        let capabilities = printer
            .capabilities
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO printers (id, name, uri, active, auto_print, status, queue_length, capabilities)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name, uri = excluded.uri, active = excluded.active,
                    auto_print = excluded.auto_print, status = excluded.status,
                    queue_length = excluded.queue_length, capabilities = excluded.capabilities",
                params![
                    printer.id,
                    printer.name,
                    printer.uri,
                    printer.active,
                    printer.auto_print,
                    printer.status.as_str(),
                    printer.queue_length,
                    capabilities,
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
        .await
    }

    /// Printers eligible for automatic dispatch, shortest queue first.
    pub async fn list_available_printers(&self) -> Result<Vec<Printer>> {
        self.call(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, name, uri, active, auto_print, status, queue_length, capabilities
                     FROM printers
                     WHERE active = 1 AND auto_print = 1 AND status IN ('online', 'busy')
                     ORDER BY queue_length ASC, name ASC",
                )
                .map_err(db_err)?;
            let printers = stmt
                .query_map([], row_to_printer)
                .map_err(db_err)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err)?;
            Ok(printers)
        })
        .await
    }
}

#[async_trait]
impl PrinterFleet for JobStore {
    async fn available_printers(&self) -> Result<Vec<Printer>> {
        self.list_available_printers().await
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn query_jobs(conn: &Connection, sql: &str, args: impl rusqlite::Params) -> Result<Vec<PrintJob>> {
    let mut stmt = conn.prepare(sql).map_err(db_err)?;
    let mut jobs = Vec::new();
    for row in stmt.query_map(args, row_to_print_job).map_err(db_err)? {
        match row {
            Ok(job) => jobs.push(job),
            // One bad row must not hide the rest of the batch.
            Err(e @ rusqlite::Error::FromSqlConversionFailure(..))
            | Err(e @ rusqlite::Error::InvalidColumnType(..)) => {
                warn!(error = %e, "skipping undecodable job row");
            }
            Err(e) => return Err(db_err(e)),
        }
    }
    Ok(jobs)
}

fn conversion_err<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e))
}

fn parse_opt_ts(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_ts(idx, &s)).transpose()
}

fn parse_keyword<T>(idx: usize, raw: &str) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.parse().map_err(|e| conversion_err(idx, e))
}

fn parse_json<T: DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|e| conversion_err(idx, e))
}

/// Column indices follow `JOB_COLUMNS`.
fn row_to_print_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<PrintJob> {
    let id: String = row.get(0)?;
    let payment: String = row.get(2)?;
    let status: String = row.get(3)?;
    let owner: Option<String> = row.get(12)?;
    let segments: String = row.get(14)?;
    let requirements: String = row.get(15)?;
    let files: String = row.get(16)?;
    let created_at: String = row.get(17)?;
    let updated_at: String = row.get(18)?;

    Ok(PrintJob {
        id: parse_keyword(0, &id)?,
        order_number: row.get(1)?,
        payment_status: parse_keyword(2, &payment)?,
        print_status: parse_keyword(3, &status)?,
        print_error: row.get(4)?,
        printer_id: row.get(5)?,
        printer_name: row.get(6)?,
        started_at: parse_opt_ts(7, row.get(7)?)?,
        completed_at: parse_opt_ts(8, row.get(8)?)?,
        idempotency_token: row.get(9)?,
        print_attempt: row.get(10)?,
        max_print_attempts: row.get(11)?,
        owner_worker_id: owner.map(WorkerId),
        heartbeat_at: parse_opt_ts(13, row.get(13)?)?,
        segments: parse_json(14, &segments)?,
        requirements: parse_json(15, &requirements)?,
        files: parse_json(16, &files)?,
        created_at: parse_ts(17, &created_at)?,
        updated_at: parse_ts(18, &updated_at)?,
    })
}

fn row_to_printer(row: &rusqlite::Row<'_>) -> rusqlite::Result<Printer> {
    let status: String = row.get(5)?;
    let capabilities: Option<String> = row.get(7)?;
    Ok(Printer {
        id: row.get(0)?,
        name: row.get(1)?,
        uri: row.get(2)?,
        active: row.get(3)?,
        auto_print: row.get(4)?,
        status: parse_keyword(5, &status)?,
        queue_length: row.get(6)?,
        capabilities: capabilities.map(|raw| parse_json(7, &raw)).transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{paid_job, printer, set_raw_page_colors};
    use spoolward_core::types::{ColorMode, PaymentStatus, PrintStatus, PrinterStatus};

    fn worker(name: &str) -> WorkerId {
        WorkerId(name.to_string())
    }

    #[tokio::test]
    async fn insert_and_read_back() {
        let store = JobStore::open_in_memory().unwrap();
        let job = paid_job(3, ColorMode::Mixed);
        store.insert_job(&job).await.unwrap();

        let loaded = store.get_job(job.id).await.unwrap().expect("job exists");
        assert_eq!(loaded.id, job.id);
        assert_eq!(loaded.order_number, job.order_number);
        assert_eq!(loaded.payment_status, PaymentStatus::Completed);
        assert_eq!(loaded.print_status, PrintStatus::Pending);
        assert_eq!(loaded.requirements.color_mode, ColorMode::Mixed);
        assert_eq!(loaded.files, job.files);
        assert!(loaded.owner_worker_id.is_none());
        assert!(store.get_job(JobId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claimable_jobs_are_paid_pending_and_oldest_first() {
        let store = JobStore::open_in_memory().unwrap();
        let older = paid_job(1, ColorMode::Bw);
        let mut newer = paid_job(1, ColorMode::Bw);
        newer.created_at = older.created_at + chrono::Duration::seconds(5);
        let mut unpaid = paid_job(1, ColorMode::Bw);
        unpaid.payment_status = PaymentStatus::Pending;

        store.insert_job(&newer).await.unwrap();
        store.insert_job(&unpaid).await.unwrap();
        store.insert_job(&older).await.unwrap();

        let jobs = store.claimable_jobs(10).await.unwrap();
        let ids: Vec<JobId> = jobs.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![older.id, newer.id]);
        assert_eq!(store.claimable_jobs(1).await.unwrap().len(), 1);
        assert_eq!(store.count_backlog().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn claim_is_gated_on_pending() {
        let store = JobStore::open_in_memory().unwrap();
        let job = paid_job(1, ColorMode::Bw);
        store.insert_job(&job).await.unwrap();
        let now = Utc::now();

        let first = store
            .try_claim(job.id, "p1", "Front", "tok-1", &worker("a"), None, now)
            .await
            .unwrap();
        let second = store
            .try_claim(job.id, "p1", "Front", "tok-2", &worker("b"), None, now)
            .await
            .unwrap();
        assert_eq!((first, second), (1, 0));

        let loaded = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.print_status, PrintStatus::Printing);
        assert_eq!(loaded.owner_worker_id, Some(worker("a")));
        assert_eq!(loaded.idempotency_token.as_deref(), Some("tok-1"));
        assert_eq!(loaded.print_attempt, 1);
        assert!(loaded.heartbeat_at.is_some());
    }

    #[tokio::test]
    async fn claim_budget_applies_to_the_first_claim_only() {
        let store = JobStore::open_in_memory().unwrap();
        let fresh = paid_job(1, ColorMode::Bw);
        let mut retried = paid_job(1, ColorMode::Bw);
        retried.print_attempt = 1;
        store.insert_job(&fresh).await.unwrap();
        store.insert_job(&retried).await.unwrap();

        for (job, token) in [(&fresh, "tok-fresh"), (&retried, "tok-retried")] {
            let rows = store
                .try_claim(job.id, "p1", "Front", token, &worker("a"), Some(5), Utc::now())
                .await
                .unwrap();
            assert_eq!(rows, 1);
        }

        let fresh = store.get_job(fresh.id).await.unwrap().unwrap();
        assert_eq!((fresh.print_attempt, fresh.max_print_attempts), (1, 5));
        let retried = store.get_job(retried.id).await.unwrap().unwrap();
        assert_eq!((retried.print_attempt, retried.max_print_attempts), (2, 3));
    }

    #[tokio::test]
    async fn undecodable_row_does_not_hide_the_batch() {
        let store = JobStore::open_in_memory().unwrap();
        let broken = paid_job(2, ColorMode::Mixed);
        let mut healthy = paid_job(1, ColorMode::Bw);
        healthy.created_at = broken.created_at + chrono::Duration::seconds(1);
        store.insert_job(&broken).await.unwrap();
        store.insert_job(&healthy).await.unwrap();
        set_raw_page_colors(&store, broken.id, r#"{"x": "color"}"#).await;

        let ids: Vec<JobId> = store
            .claimable_jobs(10)
            .await
            .unwrap()
            .iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(ids, vec![healthy.id]);

        // Reading the broken row on its own still reports the problem.
        assert!(store.get_job(broken.id).await.is_err());
    }

    #[tokio::test]
    async fn page_colors_in_object_shape_are_read_back_as_a_list() {
        let store = JobStore::open_in_memory().unwrap();
        let job = paid_job(3, ColorMode::Mixed);
        store.insert_job(&job).await.unwrap();
        set_raw_page_colors(&store, job.id, r#"{"3": "color", "1": "bw"}"#).await;

        let loaded = store.claimable_jobs(10).await.unwrap().pop().unwrap();
        let pages: Vec<u32> = loaded
            .requirements
            .page_colors
            .iter()
            .map(|pc| pc.page_number)
            .collect();
        assert_eq!(pages, vec![1, 3]);
    }

    #[tokio::test]
    async fn a_live_worker_lease_blocks_a_second_run() {
        let store = JobStore::open_in_memory().unwrap();
        let id = worker("till");
        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());
        let now = Utc::now();
        let cutoff = now - chrono::Duration::seconds(60);

        assert!(store.register_worker(&id, first, now, cutoff).await.unwrap());
        // Same run re-registering is fine.
        assert!(store.register_worker(&id, first, now, cutoff).await.unwrap());
        assert!(!store.register_worker(&id, second, now, cutoff).await.unwrap());
        assert_eq!(store.renew_worker(&id, second, now).await.unwrap(), 0);
        assert_eq!(store.renew_worker(&id, first, now).await.unwrap(), 1);

        // A lease nobody renewed past the cutoff can be taken over.
        let later = now + chrono::Duration::seconds(120);
        let later_cutoff = later - chrono::Duration::seconds(60);
        assert!(store.register_worker(&id, second, later, later_cutoff).await.unwrap());
        assert_eq!(store.renew_worker(&id, first, later).await.unwrap(), 0);

        assert_eq!(store.unregister_worker(&id, first).await.unwrap(), 0);
        assert_eq!(store.unregister_worker(&id, second).await.unwrap(), 1);
        assert!(store.register_worker(&id, first, later, later_cutoff).await.unwrap());
    }

    #[tokio::test]
    async fn complete_requires_ownership_and_returns_token() {
        let store = JobStore::open_in_memory().unwrap();
        let job = paid_job(1, ColorMode::Bw);
        store.insert_job(&job).await.unwrap();
        store
            .try_claim(job.id, "p1", "Front", "tok", &worker("a"), None, Utc::now())
            .await
            .unwrap();

        let stolen = store.try_complete(job.id, &worker("b"), Utc::now()).await.unwrap();
        assert!(stolen.is_none());

        let done = store.try_complete(job.id, &worker("a"), Utc::now()).await.unwrap();
        assert_eq!(done, Some(Some("tok".to_string())));

        let loaded = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.print_status, PrintStatus::Printed);
        assert!(loaded.owner_worker_id.is_none());
        assert!(loaded.heartbeat_at.is_none());
        assert!(loaded.completed_at.is_some());
        assert!(store.printed_with_token("tok").await.unwrap());
    }

    #[tokio::test]
    async fn duplicate_tokens_are_rejected() {
        let store = JobStore::open_in_memory().unwrap();
        let a = paid_job(1, ColorMode::Bw);
        let b = paid_job(1, ColorMode::Bw);
        store.insert_job(&a).await.unwrap();
        store.insert_job(&b).await.unwrap();
        store
            .try_claim(a.id, "p1", "Front", "same", &worker("w"), None, Utc::now())
            .await
            .unwrap();

        let clash = store
            .try_claim(b.id, "p1", "Front", "same", &worker("w"), None, Utc::now())
            .await;
        assert!(clash.is_err());
    }

    #[tokio::test]
    async fn stale_reset_loses_to_fresh_heartbeat() {
        let store = JobStore::open_in_memory().unwrap();
        let job = paid_job(1, ColorMode::Bw);
        store.insert_job(&job).await.unwrap();
        let claimed_at = Utc::now() - chrono::Duration::minutes(10);
        store
            .try_claim(job.id, "p1", "Front", "tok", &worker("a"), None, claimed_at)
            .await
            .unwrap();

        let cutoff = Utc::now() - chrono::Duration::minutes(5);
        assert_eq!(store.count_stale(cutoff).await.unwrap(), 1);

        store.touch_heartbeats(&worker("a"), Utc::now()).await.unwrap();
        assert_eq!(store.count_stale(cutoff).await.unwrap(), 0);
        let rows = store
            .force_reset_stale(job.id, cutoff, "stale", Utc::now())
            .await
            .unwrap();
        assert_eq!(rows, 0);
    }

    #[tokio::test]
    async fn release_does_not_count_an_attempt() {
        let store = JobStore::open_in_memory().unwrap();
        let job = paid_job(1, ColorMode::Bw);
        store.insert_job(&job).await.unwrap();
        store
            .try_claim(job.id, "p1", "Front", "tok", &worker("a"), None, Utc::now())
            .await
            .unwrap();

        assert_eq!(store.release_owned(job.id, &worker("b"), Utc::now()).await.unwrap(), 0);
        assert_eq!(store.release_owned(job.id, &worker("a"), Utc::now()).await.unwrap(), 1);

        let loaded = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.print_status, PrintStatus::Pending);
        assert_eq!(loaded.print_attempt, 1);
        assert!(loaded.idempotency_token.is_none());
        assert!(loaded.printer_id.is_none());
    }

    #[tokio::test]
    async fn available_printers_filter_and_sort() {
        let store = JobStore::open_in_memory().unwrap();

        let mut busy = printer("busy");
        busy.status = PrinterStatus::Busy;
        busy.queue_length = 4;
        let mut idle = printer("idle");
        idle.queue_length = 0;
        let mut offline = printer("offline");
        offline.status = PrinterStatus::Offline;
        let mut manual = printer("manual");
        manual.auto_print = false;
        let mut retired = printer("retired");
        retired.active = false;

        for p in [&busy, &idle, &offline, &manual, &retired] {
            store.upsert_printer(p).await.unwrap();
        }
        // Upsert replaces rather than duplicating.
        idle.queue_length = 1;
        store.upsert_printer(&idle).await.unwrap();

        let available = store.available_printers().await.unwrap();
        let ids: Vec<&str> = available.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["idle", "busy"]);
        assert_eq!(available[0].queue_length, 1);
        assert!(available[0].capabilities.is_some());
    }
}
