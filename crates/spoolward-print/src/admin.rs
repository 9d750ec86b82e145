// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Operator overrides.
//
// These go through the same transition table as the worker paths, using the
// admin entry point, and are never called by the worker loops themselves.
// Every override is audited and raises an admin-override alert.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument, warn};

use spoolward_core::error::{Result, SpoolwardError};
use spoolward_core::state_machine;
use spoolward_core::types::{JobId, PrintStatus};
use spoolward_security::AuditRecord;
use spoolward_security::audit::actions;

use crate::alerts::{Alert, AlertKind, AlertSink};
use crate::operations::JobOperations;

pub struct AdminOperations {
    ops: Arc<JobOperations>,
    alerts: Arc<dyn AlertSink>,
}

impl AdminOperations {
    pub fn new(ops: Arc<JobOperations>, alerts: Arc<dyn AlertSink>) -> Self {
        Self { ops, alerts }
    }

    /// Send a printed job back to the queue with a fresh attempt budget.
    #[instrument(skip(self))]
    pub async fn reprint(&self, job_id: JobId, reason: &str) -> Result<bool> {
        let current = self.current_status(job_id).await?;
        allow(current, PrintStatus::Pending)?;

        let rows = self.ops.store().admin_reprint(job_id, Utc::now()).await?;
        if rows == 0 {
            warn!(job_id = %job_id, "reprint skipped: job is no longer printed");
            return Ok(false);
        }

        info!(job_id = %job_id, "job queued for reprint");
        self.record(
            AuditRecord::new(actions::ADMIN_REPRINT, job_id)
                .transition(PrintStatus::Printed, PrintStatus::Pending)
                .reason(reason),
            format!("job {job_id} queued for reprint: {reason}"),
            job_id,
        )
        .await;
        Ok(true)
    }

    /// Mark a printing job printed whoever owns it, e.g. after confirming
    /// the output by hand.
    #[instrument(skip(self))]
    pub async fn force_complete(&self, job_id: JobId, reason: &str) -> Result<bool> {
        let job = self
            .ops
            .store()
            .get_job(job_id)
            .await?
            .ok_or(SpoolwardError::JobNotFound(job_id))?;
        allow(job.print_status, PrintStatus::Printed)?;

        let Some(token) = self.ops.store().admin_force_complete(job_id, Utc::now()).await? else {
            warn!(job_id = %job_id, "force-complete skipped: job is no longer printing");
            return Ok(false);
        };

        info!(job_id = %job_id, "job force-completed");
        let previous_owner = job.owner_worker_id.map(|w| w.as_str().to_string());
        self.record(
            AuditRecord::new(actions::ADMIN_FORCE_COMPLETE, job_id)
                .token(token)
                .transition(PrintStatus::Printing, PrintStatus::Printed)
                .reason(reason)
                .meta("previous_owner", previous_owner),
            format!("job {job_id} force-completed: {reason}"),
            job_id,
        )
        .await;
        Ok(true)
    }

    /// Unfreeze a pending job that ran out of attempts.
    #[instrument(skip(self))]
    pub async fn reset_attempts(&self, job_id: JobId, reason: &str) -> Result<bool> {
        let current = self.current_status(job_id).await?;
        if current != PrintStatus::Pending {
            return Err(SpoolwardError::InvalidTransition(format!(
                "attempts can only be reset on pending jobs, job is {current}"
            )));
        }

        let rows = self.ops.store().admin_reset_attempts(job_id, Utc::now()).await?;
        if rows == 0 {
            return Ok(false);
        }

        info!(job_id = %job_id, "attempts reset");
        self.record(
            AuditRecord::new(actions::ADMIN_RESET_ATTEMPTS, job_id).reason(reason),
            format!("job {job_id} attempts reset: {reason}"),
            job_id,
        )
        .await;
        Ok(true)
    }

    async fn current_status(&self, job_id: JobId) -> Result<PrintStatus> {
        self.ops
            .store()
            .get_job(job_id)
            .await?
            .map(|job| job.print_status)
            .ok_or(SpoolwardError::JobNotFound(job_id))
    }

    async fn record(&self, record: AuditRecord, message: String, job_id: JobId) {
        self.ops.audit(record.meta("admin", true)).await;
        self.alerts
            .raise(Alert::new(AlertKind::AdminOverride, message).job(job_id));
    }
}

fn allow(from: PrintStatus, to: PrintStatus) -> Result<()> {
    let check = state_machine::validate_admin(Some(from), to);
    if check.allowed {
        Ok(())
    } else {
        Err(SpoolwardError::InvalidTransition(
            check.reason.unwrap_or_default(),
        ))
    }
}
