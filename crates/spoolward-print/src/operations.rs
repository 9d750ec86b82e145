// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Atomic job operations.
//
// `claim`, `complete` and `fail` are the only worker paths that change a
// job's print status. Each validates the edge against the transition table,
// then issues exactly one predicate-gated UPDATE. A zero-row result means
// another worker (or the stale detector) got there first; that is reported
// as a plain outcome, never as an error.
//
// Audit writes are best effort: a failing audit log is logged and does not
// change the result of the operation it describes.

use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use spoolward_core::error::{Result, SpoolwardError};
use spoolward_core::state_machine;
use spoolward_core::types::{JobId, PaymentStatus, PrintStatus, Segment, WorkerId};
use spoolward_security::audit::actions;
use spoolward_security::{AuditLog, AuditRecord};

use crate::identity::WorkerIdentity;
use crate::store::{EXHAUSTED_PREFIX, JobStore};

/// Result of a claim attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This worker now owns the job under `token`.
    Claimed { token: String },
    /// The conditional update matched nothing: another worker won, or the
    /// job changed since it was read.
    Contended,
    /// The job has used its attempts and is now frozen.
    Exhausted,
    /// The job is not in a claimable state.
    Rejected(String),
}

/// Owner-scoped job operations for one worker process.
pub struct JobOperations {
    store: JobStore,
    audit: AuditLog,
    identity: WorkerIdentity,
    attempt_budget: Option<u32>,
}

impl JobOperations {
    pub fn new(store: JobStore, audit: AuditLog, identity: WorkerIdentity) -> Self {
        Self {
            store,
            audit,
            identity,
            attempt_budget: None,
        }
    }

    /// Give jobs claimed for the first time `budget` attempts instead of
    /// the budget they were inserted with.
    pub fn with_attempt_budget(mut self, budget: u32) -> Self {
        self.attempt_budget = Some(budget.max(1));
        self
    }

    pub fn worker_id(&self) -> &WorkerId {
        self.identity.id()
    }

    pub fn identity(&self) -> &WorkerIdentity {
        &self.identity
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    /// Append to the audit log, logging instead of failing.
    pub(crate) async fn audit(&self, record: AuditRecord) {
        let action = record.action;
        let record = record.meta("worker_id", self.worker_id().as_str());
        if let Err(e) = self.audit.record(record).await {
            warn!(action, error = %e, "audit write failed");
        }
    }

    /// Try to take ownership of a pending job.
    #[instrument(skip(self), fields(worker_id = %self.worker_id()))]
    pub async fn claim(&self, job_id: JobId, printer_id: &str, printer_name: &str) -> Result<ClaimOutcome> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or(SpoolwardError::JobNotFound(job_id))?;

        let check = state_machine::validate(Some(job.print_status), PrintStatus::Printing);
        if !check.allowed {
            let reason = check.reason.unwrap_or_default();
            debug!(%reason, "claim rejected");
            return Ok(ClaimOutcome::Rejected(reason));
        }

        if job.payment_status != PaymentStatus::Completed {
            let reason = format!("payment is {}", job.payment_status);
            debug!(%reason, "claim rejected");
            return Ok(ClaimOutcome::Rejected(reason));
        }

        if job.attempts_exhausted() {
            let mut message = format!(
                "{EXHAUSTED_PREFIX} ({}/{})",
                job.print_attempt, job.max_print_attempts
            );
            if let Some(last) = job.print_error.as_deref() {
                message.push_str(": last error: ");
                message.push_str(last);
            }
            self.store.set_terminal_error(job_id, &message, Utc::now()).await?;
            warn!(attempts = job.print_attempt, "job exhausted its print attempts");
            self.audit(
                AuditRecord::new(actions::EXHAUSTED, job_id)
                    .reason(message)
                    .meta("attempts", job.print_attempt),
            )
            .await;
            return Ok(ClaimOutcome::Exhausted);
        }

        let token = Uuid::new_v4().to_string();
        let rows = self
            .store
            .try_claim(
                job_id,
                printer_id,
                printer_name,
                &token,
                self.worker_id(),
                self.attempt_budget,
                Utc::now(),
            )
            .await?;
        if rows == 0 {
            debug!("claim lost the race");
            return Ok(ClaimOutcome::Contended);
        }

        info!(printer = printer_name, attempt = job.print_attempt + 1, "job claimed");
        self.audit(
            AuditRecord::new(actions::CLAIM, job_id)
                .token(Some(token.as_str()))
                .transition(PrintStatus::Pending, PrintStatus::Printing)
                .meta("printer_id", printer_id)
                .meta("printer_name", printer_name)
                .meta("attempt", job.print_attempt + 1),
        )
        .await;
        Ok(ClaimOutcome::Claimed { token })
    }

    /// Mark an owned job printed. `false` when this worker no longer owns it.
    pub async fn complete(&self, job_id: JobId) -> Result<bool> {
        self.complete_with_metadata(job_id, Map::new()).await
    }

    /// [`JobOperations::complete`] with extra fields for the audit entry.
    #[instrument(skip(self, metadata), fields(worker_id = %self.worker_id()))]
    pub async fn complete_with_metadata(&self, job_id: JobId, metadata: Map<String, Value>) -> Result<bool> {
        let check = state_machine::validate(Some(PrintStatus::Printing), PrintStatus::Printed);
        if !check.allowed {
            return Err(SpoolwardError::InvalidTransition(check.reason.unwrap_or_default()));
        }

        let token = match self.store.try_complete(job_id, self.worker_id(), Utc::now()).await? {
            Some(token) => token,
            None => {
                warn!("completion ignored: job is no longer owned by this worker");
                return Ok(false);
            }
        };

        info!("job printed");
        let mut record = AuditRecord::new(actions::COMPLETE, job_id)
            .token(token)
            .transition(PrintStatus::Printing, PrintStatus::Printed);
        record.metadata.extend(metadata);
        self.audit(record).await;
        Ok(true)
    }

    /// Return an owned job to the queue with `message`, counting the attempt.
    #[instrument(skip(self), fields(worker_id = %self.worker_id()))]
    pub async fn fail(&self, job_id: JobId, message: &str) -> Result<bool> {
        let check = state_machine::validate(Some(PrintStatus::Printing), PrintStatus::Pending);
        if !check.allowed {
            return Err(SpoolwardError::InvalidTransition(check.reason.unwrap_or_default()));
        }

        // Read first: the token is cleared by the update but belongs in the audit entry.
        let token = self
            .store
            .get_job(job_id)
            .await?
            .and_then(|job| job.idempotency_token);

        let rows = self
            .store
            .try_fail(job_id, self.worker_id(), message, Utc::now())
            .await?;
        if rows == 0 {
            debug!("fail ignored: job is no longer owned by this worker");
            return Ok(false);
        }

        warn!(error = message, "print attempt failed");
        self.audit(
            AuditRecord::new(actions::FAIL, job_id)
                .token(token)
                .transition(PrintStatus::Printing, PrintStatus::Pending)
                .reason(message),
        )
        .await;
        Ok(true)
    }

    /// Whether a print attempt identified by `token` already completed,
    /// according to either the live record or the audit log.
    ///
    /// Lookup errors count as "not printed".
    pub async fn is_already_printed(&self, token: &str) -> bool {
        match self.store.printed_with_token(token).await {
            Ok(true) => return true,
            Ok(false) => {}
            Err(e) => warn!(error = %e, "live idempotency lookup failed"),
        }
        match self.audit.has_completion(token).await {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, "audit idempotency lookup failed");
                false
            }
        }
    }

    /// Refresh the heartbeat of one owned job.
    pub async fn heartbeat(&self, job_id: JobId) -> Result<bool> {
        let rows = self
            .store
            .touch_heartbeat(job_id, self.worker_id(), Utc::now())
            .await?;
        Ok(rows == 1)
    }

    /// Refresh the heartbeat of every owned job. Returns how many.
    pub async fn heartbeat_all(&self) -> Result<usize> {
        self.store.touch_heartbeats(self.worker_id(), Utc::now()).await
    }

    /// Take the lease on this worker's id. Fails when another live process
    /// is running under the same id; a lease unrenewed for `expiry` is
    /// considered abandoned.
    pub async fn acquire_lease(&self, expiry: Duration) -> Result<()> {
        let now = Utc::now();
        let cutoff = now - chrono::Duration::from_std(expiry).unwrap_or(chrono::Duration::zero());
        let acquired = self
            .store
            .register_worker(self.worker_id(), self.identity.boot_id(), now, cutoff)
            .await?;
        if !acquired {
            return Err(SpoolwardError::Config(format!(
                "worker id '{}' is already held by a running worker; set worker_name to a unique value",
                self.worker_id()
            )));
        }
        debug!("worker lease acquired");
        Ok(())
    }

    /// Refresh this run's lease. `false` when the lease was taken over.
    pub async fn renew_lease(&self) -> Result<bool> {
        let rows = self
            .store
            .renew_worker(self.worker_id(), self.identity.boot_id(), Utc::now())
            .await?;
        Ok(rows == 1)
    }

    /// Give up this run's lease.
    pub async fn release_lease(&self) -> Result<()> {
        self.store
            .unregister_worker(self.worker_id(), self.identity.boot_id())
            .await?;
        Ok(())
    }

    /// Persist segment progress for an owned job.
    pub async fn save_segments(&self, job_id: JobId, segments: &[Segment]) -> Result<bool> {
        let rows = self
            .store
            .save_segments(job_id, self.worker_id(), segments)
            .await?;
        Ok(rows == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ops_for, paid_job, shared_ops};
    use spoolward_core::types::ColorMode;
    use std::sync::Arc;

    async fn claimed(ops: &JobOperations, job_id: JobId) -> String {
        match ops.claim(job_id, "p1", "Front").await.unwrap() {
            ClaimOutcome::Claimed { token } => token,
            other => panic!("expected claim, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn claim_then_fail_scenario() {
        let ops = shared_ops("w1");
        let job = paid_job(1, ColorMode::Bw);
        ops.store().insert_job(&job).await.unwrap();

        let token = claimed(&ops, job.id).await;
        let printing = ops.store().get_job(job.id).await.unwrap().unwrap();
        assert_eq!(printing.print_status, PrintStatus::Printing);
        assert_eq!(printing.print_attempt, 1);
        assert_eq!(printing.idempotency_token.as_deref(), Some(token.as_str()));
        assert_eq!(printing.owner_worker_id.as_ref(), Some(ops.worker_id()));

        assert!(ops.fail(job.id, "timeout").await.unwrap());
        let pending = ops.store().get_job(job.id).await.unwrap().unwrap();
        assert_eq!(pending.print_status, PrintStatus::Pending);
        assert_eq!(pending.print_attempt, 2);
        assert!(pending.idempotency_token.is_none());
        assert!(pending.owner_worker_id.is_none());
        assert!(pending.started_at.is_none());
        assert_eq!(pending.print_error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn printing_always_has_owner_and_token() {
        let ops = shared_ops("w1");
        for _ in 0..3 {
            let job = paid_job(1, ColorMode::Bw);
            ops.store().insert_job(&job).await.unwrap();
            claimed(&ops, job.id).await;
        }
        let now = Utc::now() + chrono::Duration::hours(1);
        for job in ops.store().stale_jobs(now).await.unwrap() {
            assert_eq!(job.print_status, PrintStatus::Printing);
            assert!(job.owner_worker_id.is_some());
            assert!(job.idempotency_token.is_some());
        }
    }

    #[tokio::test]
    async fn exhausted_job_is_frozen_with_terminal_error() {
        let ops = shared_ops("w1");
        let job = paid_job(1, ColorMode::Bw);
        ops.store().insert_job(&job).await.unwrap();

        let mut refused = None;
        for cycle in 1..=3 {
            match ops.claim(job.id, "p1", "Front").await.unwrap() {
                ClaimOutcome::Claimed { .. } => {
                    assert!(ops.fail(job.id, "paper jam").await.unwrap());
                }
                ClaimOutcome::Exhausted => {
                    refused = Some(cycle);
                    break;
                }
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        // Claim and fail each count one attempt, so the budget of 3 is
        // spent after the second failure.
        assert_eq!(refused, Some(3));

        let frozen = ops.store().get_job(job.id).await.unwrap().unwrap();
        assert_eq!(frozen.print_status, PrintStatus::Pending);
        assert!(frozen.print_attempt >= frozen.max_print_attempts);
        let error = frozen.print_error.unwrap();
        assert!(error.starts_with(EXHAUSTED_PREFIX), "{error}");
        assert!(error.contains("paper jam"));

        // Frozen jobs are no longer offered, and further claims keep refusing.
        assert!(ops.store().claimable_jobs(10).await.unwrap().is_empty());
        assert_eq!(
            ops.claim(job.id, "p1", "Front").await.unwrap(),
            ClaimOutcome::Exhausted
        );

        let actions: Vec<String> = ops
            .audit_log()
            .entries_for_job(job.id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert!(actions.iter().any(|a| a == "exhausted"));
    }

    #[tokio::test]
    async fn racing_claims_have_exactly_one_winner() {
        let (store, audit) = crate::test_support::backing();
        let job = paid_job(1, ColorMode::Bw);
        store.insert_job(&job).await.unwrap();

        let mut handles = Vec::new();
        for n in 0..8 {
            let ops = Arc::new(ops_for(&store, &audit, &format!("racer-{n}")));
            handles.push(tokio::spawn(async move {
                ops.claim(job.id, "p1", "Front").await.unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                ClaimOutcome::Claimed { .. } => winners += 1,
                ClaimOutcome::Contended | ClaimOutcome::Rejected(_) => {}
                ClaimOutcome::Exhausted => panic!("fresh job cannot be exhausted"),
            }
        }
        assert_eq!(winners, 1);

        let loaded = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.print_attempt, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_claims_across_connections_have_exactly_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        let audit = AuditLog::open_in_memory().unwrap();
        let seed = JobStore::open(&path).unwrap();
        let job = paid_job(1, ColorMode::Bw);
        seed.insert_job(&job).await.unwrap();

        // One connection per worker, as separate processes would have.
        let mut handles = Vec::new();
        for n in 0..4 {
            let store = JobStore::open(&path).unwrap();
            let ops = ops_for(&store, &audit, &format!("host-{n}"));
            handles.push(tokio::spawn(async move {
                ops.claim(job.id, "p1", "Front").await.unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if let ClaimOutcome::Claimed { .. } = handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);

        let loaded = seed.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.print_status, PrintStatus::Printing);
        assert_eq!(loaded.print_attempt, 1);
    }

    #[tokio::test]
    async fn attempt_budget_is_stamped_on_first_claim() {
        let (store, audit) = crate::test_support::backing();
        let ops = ops_for(&store, &audit, "w1").with_attempt_budget(5);
        let job = paid_job(1, ColorMode::Bw);
        store.insert_job(&job).await.unwrap();

        claimed(&ops, job.id).await;
        assert!(ops.fail(job.id, "jam").await.unwrap());
        claimed(&ops, job.id).await;

        let loaded = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!((loaded.print_attempt, loaded.max_print_attempts), (2, 5));
    }

    #[tokio::test]
    async fn second_run_under_a_live_id_is_refused() {
        let (store, audit) = crate::test_support::backing();
        let first = ops_for(&store, &audit, "till");
        let second = ops_for(&store, &audit, "till");
        let expiry = Duration::from_secs(60);

        first.acquire_lease(expiry).await.unwrap();
        let err = second.acquire_lease(expiry).await.unwrap_err();
        assert!(matches!(err, SpoolwardError::Config(_)));
        assert!(first.renew_lease().await.unwrap());
        assert!(!second.renew_lease().await.unwrap());

        first.release_lease().await.unwrap();
        second.acquire_lease(expiry).await.unwrap();
    }

    #[tokio::test]
    async fn unpaid_and_printed_jobs_are_rejected() {
        let ops = shared_ops("w1");
        let mut unpaid = paid_job(1, ColorMode::Bw);
        unpaid.payment_status = PaymentStatus::Pending;
        ops.store().insert_job(&unpaid).await.unwrap();
        assert!(matches!(
            ops.claim(unpaid.id, "p1", "Front").await.unwrap(),
            ClaimOutcome::Rejected(_)
        ));

        let job = paid_job(1, ColorMode::Bw);
        ops.store().insert_job(&job).await.unwrap();
        claimed(&ops, job.id).await;
        assert!(ops.complete(job.id).await.unwrap());
        assert!(matches!(
            ops.claim(job.id, "p1", "Front").await.unwrap(),
            ClaimOutcome::Rejected(_)
        ));

        let missing = ops.claim(JobId::new(), "p1", "Front").await;
        assert!(matches!(missing, Err(SpoolwardError::JobNotFound(_))));
    }

    #[tokio::test]
    async fn only_the_owner_can_complete_or_fail() {
        let (store, audit) = crate::test_support::backing();
        let owner = ops_for(&store, &audit, "owner");
        let other = ops_for(&store, &audit, "other");
        let job = paid_job(1, ColorMode::Bw);
        store.insert_job(&job).await.unwrap();
        claimed(&owner, job.id).await;

        assert!(!other.complete(job.id).await.unwrap());
        assert!(!other.fail(job.id, "nope").await.unwrap());
        assert!(!other.heartbeat(job.id).await.unwrap());
        assert!(owner.heartbeat(job.id).await.unwrap());
        assert!(owner.complete(job.id).await.unwrap());
        // A second completion finds nothing to update.
        assert!(!owner.complete(job.id).await.unwrap());
    }

    #[tokio::test]
    async fn already_printed_survives_live_record_overwrite() {
        let ops = shared_ops("w1");
        let job = paid_job(1, ColorMode::Bw);
        ops.store().insert_job(&job).await.unwrap();

        let token = claimed(&ops, job.id).await;
        assert!(!ops.is_already_printed(&token).await);
        assert!(ops.complete(job.id).await.unwrap());
        assert!(ops.is_already_printed(&token).await);

        // Reprint clears the live token; the audit log still remembers it.
        ops.store().admin_reprint(job.id, Utc::now()).await.unwrap();
        assert!(!ops.store().printed_with_token(&token).await.unwrap());
        assert!(ops.is_already_printed(&token).await);
        assert!(!ops.is_already_printed("never-issued").await);
    }

    #[tokio::test]
    async fn audit_trail_records_claim_and_completion_tokens() {
        let ops = shared_ops("w1");
        let job = paid_job(1, ColorMode::Bw);
        ops.store().insert_job(&job).await.unwrap();
        let token = claimed(&ops, job.id).await;
        ops.complete(job.id).await.unwrap();

        let entries = ops.audit_log().entries_for_job(job.id).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action, "claim");
        assert_eq!(entries[1].action, "complete");
        assert!(entries.iter().all(|e| e.token.as_deref() == Some(token.as_str())));
        assert_eq!(entries[0].metadata["worker_id"], "w1");
    }
}
