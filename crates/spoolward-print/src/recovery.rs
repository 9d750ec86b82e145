// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Startup and shutdown recovery.
//
// On startup, anything still marked printing under this worker's id is the
// signature of a crash of this very worker, and is put back in the queue as
// a failed attempt. Rows with no owner at all are legacy orphans and are
// treated the same way. Jobs owned by other workers are theirs to finish.
//
// On shutdown the worker hands its jobs back without counting an attempt:
// stopping is voluntary, not a print failure.

use chrono::Utc;
use tracing::{info, instrument, warn};

use spoolward_core::error::Result;
use spoolward_core::types::{JobId, PrintStatus};
use spoolward_security::AuditRecord;
use spoolward_security::audit::actions;

use crate::operations::JobOperations;

const CRASH_MESSAGE: &str = "crash_recovery: worker restarted while printing";

/// Reset this worker's (and ownerless) printing jobs. Must run before the
/// first poll.
#[instrument(skip(ops), fields(worker_id = %ops.worker_id()))]
pub async fn recover_on_startup(ops: &JobOperations) -> Result<Vec<JobId>> {
    let recovered = ops
        .store()
        .recover_crashed(ops.worker_id(), CRASH_MESSAGE, Utc::now())
        .await?;

    for job in &recovered {
        let previous_owner = job.owner_worker_id.as_ref().map(|w| w.as_str().to_string());
        warn!(job_id = %job.id, previous_owner = previous_owner.as_deref().unwrap_or("none"), "crash_recovery");
        ops.audit(
            AuditRecord::new(actions::CRASH_RECOVERY, job.id)
                .token(job.idempotency_token.clone())
                .transition(PrintStatus::Printing, PrintStatus::Pending)
                .reason(CRASH_MESSAGE)
                .meta("previous_owner", previous_owner),
        )
        .await;
    }

    info!(recovered = recovered.len(), "startup recovery finished");
    Ok(recovered.into_iter().map(|job| job.id).collect())
}

/// Outcome of handing jobs back at shutdown.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub released: Vec<JobId>,
    pub errors: usize,
}

/// Release every job this worker owns. Never fails as a whole: each job is
/// attempted and individual errors are counted.
#[instrument(skip(ops), fields(worker_id = %ops.worker_id()))]
pub async fn release_on_shutdown(ops: &JobOperations) -> ShutdownReport {
    let mut report = ShutdownReport::default();

    let owned = match ops.store().owned_printing_jobs(ops.worker_id()).await {
        Ok(owned) => owned,
        Err(e) => {
            warn!(error = %e, "could not list owned jobs at shutdown");
            report.errors += 1;
            return report;
        }
    };

    for job_id in owned {
        let token = match ops.store().get_job(job_id).await {
            Ok(job) => job.and_then(|j| j.idempotency_token),
            Err(_) => None,
        };
        match ops.store().release_owned(job_id, ops.worker_id(), Utc::now()).await {
            Ok(0) => {}
            Ok(_) => {
                info!(job_id = %job_id, "server_shutdown: job released");
                ops.audit(
                    AuditRecord::new(actions::SERVER_SHUTDOWN, job_id)
                        .token(token)
                        .transition(PrintStatus::Printing, PrintStatus::Pending)
                        .reason("worker shutting down"),
                )
                .await;
                report.released.push(job_id);
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "could not release job at shutdown");
                report.errors += 1;
            }
        }
    }

    info!(released = report.released.len(), errors = report.errors, "server_shutdown");
    report
}
