// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Stale job detection.
//
// A printing job whose heartbeat is older than the threshold (or missing)
// belongs to a worker that hung or died. The detector first tries the
// ordinary owner-scoped `fail`, which succeeds when the stale job is this
// worker's own. Otherwise it falls back to a privileged reset that ignores
// the owner but is still gated on the job being stale at the moment of the
// write.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use spoolward_core::error::Result;
use spoolward_core::types::{PrintJob, PrintStatus};
use spoolward_security::AuditRecord;
use spoolward_security::audit::actions;

use crate::alerts::{Alert, AlertKind, AlertSink};
use crate::operations::JobOperations;
use crate::ticker::run_every;

/// What one scan did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StaleScanReport {
    /// This worker's own jobs, failed through the normal path.
    pub self_healed: usize,
    /// Jobs with no owner recorded.
    pub orphaned: usize,
    /// Jobs owned by another worker that stopped heartbeating.
    pub foreign: usize,
    /// Jobs that recovered or moved on before the reset landed.
    pub skipped: usize,
}

impl StaleScanReport {
    pub fn recovered(&self) -> usize {
        self.self_healed + self.orphaned + self.foreign
    }
}

pub struct StaleJobDetector {
    ops: Arc<JobOperations>,
    alerts: Arc<dyn AlertSink>,
    threshold: Duration,
}

impl StaleJobDetector {
    pub fn new(ops: Arc<JobOperations>, alerts: Arc<dyn AlertSink>, threshold: Duration) -> Self {
        Self {
            ops,
            alerts,
            threshold,
        }
    }

    fn cutoff(&self) -> DateTime<Utc> {
        stale_cutoff(self.threshold)
    }

    /// Number of stale printing jobs, without touching them.
    pub async fn count_stale(&self) -> Result<u64> {
        self.ops.store().count_stale(self.cutoff()).await
    }

    /// Find and reset every stale job.
    #[instrument(skip(self), fields(worker_id = %self.ops.worker_id()))]
    pub async fn scan(&self) -> Result<StaleScanReport> {
        let cutoff = self.cutoff();
        let stale = self.ops.store().stale_jobs(cutoff).await?;
        let mut report = StaleScanReport::default();

        for job in stale {
            match self.recover(&job, cutoff).await {
                Ok(Recovery::SelfHealed) => report.self_healed += 1,
                Ok(Recovery::Orphaned) => report.orphaned += 1,
                Ok(Recovery::Foreign) => report.foreign += 1,
                Ok(Recovery::Skipped) => report.skipped += 1,
                Err(e) => error!(job_id = %job.id, error = %e, "stale recovery failed"),
            }
        }

        if report.recovered() > 0 {
            info!(
                self_healed = report.self_healed,
                orphaned = report.orphaned,
                foreign = report.foreign,
                "stale jobs returned to the queue"
            );
        }
        Ok(report)
    }

    async fn recover(&self, job: &PrintJob, cutoff: DateTime<Utc>) -> Result<Recovery> {
        let message = format!(
            "stale: no heartbeat for over {}s",
            self.threshold.as_secs()
        );

        if self.ops.fail(job.id, &message).await? {
            warn!(job_id = %job.id, "own job went stale, failed it");
            self.record(job, &message, "self").await;
            return Ok(Recovery::SelfHealed);
        }

        let rows = self
            .ops
            .store()
            .force_reset_stale(job.id, cutoff, &message, Utc::now())
            .await?;
        if rows == 0 {
            return Ok(Recovery::Skipped);
        }

        let recovery = match &job.owner_worker_id {
            None => {
                warn!(job_id = %job.id, "orphaned printing job reset");
                Recovery::Orphaned
            }
            Some(owner) => {
                warn!(job_id = %job.id, owner = %owner, "job owned by an unresponsive worker reset");
                Recovery::Foreign
            }
        };
        let owner = job
            .owner_worker_id
            .as_ref()
            .map(|w| w.as_str())
            .unwrap_or("none");
        self.record(job, &message, owner).await;
        Ok(recovery)
    }

    async fn record(&self, job: &PrintJob, message: &str, previous_owner: &str) {
        self.ops
            .audit(
                AuditRecord::new(actions::STALE_RECOVERED, job.id)
                    .token(job.idempotency_token.clone())
                    .transition(PrintStatus::Printing, PrintStatus::Pending)
                    .reason(message)
                    .meta("previous_owner", previous_owner)
                    .meta("printer_id", job.printer_id.clone()),
            )
            .await;

        let mut alert = Alert::new(AlertKind::StaleJob, format!("order {}: {message}", job.order_number))
            .job(job.id);
        if let Some(printer) = &job.printer_id {
            alert = alert.printer(printer.clone());
        }
        self.alerts.raise(alert);
    }

    pub async fn run(self, interval: Duration, shutdown: watch::Receiver<bool>) {
        run_every("stale-detector", interval, shutdown, || async {
            if let Err(e) = self.scan().await {
                warn!(error = %e, "stale scan failed");
            }
        })
        .await;
    }
}

enum Recovery {
    SelfHealed,
    Orphaned,
    Foreign,
    Skipped,
}

/// The instant before which a heartbeat counts as stale.
pub(crate) fn stale_cutoff(threshold: Duration) -> DateTime<Utc> {
    let threshold = TimeDelta::from_std(threshold).unwrap_or(TimeDelta::MAX);
    Utc::now()
        .checked_sub_signed(threshold)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operations::ClaimOutcome;
    use crate::test_support::{RecordingAlerts, backing, ops_for, paid_job, set_heartbeat};
    use spoolward_core::types::ColorMode;

    const FIVE_MINUTES: Duration = Duration::from_secs(300);

    async fn claim(ops: &JobOperations, job: &PrintJob) {
        ops.store().insert_job(job).await.unwrap();
        let outcome = ops.claim(job.id, "p1", "Front").await.unwrap();
        assert!(matches!(outcome, ClaimOutcome::Claimed { .. }));
    }

    #[tokio::test]
    async fn resets_job_silent_for_ten_minutes() {
        let (store, audit) = backing();
        let crashed = ops_for(&store, &audit, "crashed");
        let detector_ops = Arc::new(ops_for(&store, &audit, "detector"));
        let alerts = Arc::new(RecordingAlerts::default());
        let detector = StaleJobDetector::new(detector_ops, alerts.clone(), FIVE_MINUTES);

        let job = paid_job(1, ColorMode::Bw);
        claim(&crashed, &job).await;
        set_heartbeat(&store, job.id, Some(Utc::now() - chrono::Duration::minutes(10))).await;

        assert_eq!(detector.count_stale().await.unwrap(), 1);
        let report = detector.scan().await.unwrap();
        assert_eq!(report.foreign, 1);
        assert_eq!(report.recovered(), 1);

        let reset = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(reset.print_status, PrintStatus::Pending);
        assert_eq!(reset.print_attempt, 2);
        assert!(reset.owner_worker_id.is_none());
        assert!(reset.heartbeat_at.is_none());
        assert!(reset.idempotency_token.is_none());
        assert!(reset.printer_id.is_none());

        let entries = audit.entries_for_job(job.id).await.unwrap();
        let stale = entries.iter().find(|e| e.action == "stale_recovered").unwrap();
        assert_eq!(stale.metadata["previous_owner"], "crashed");
        assert_eq!(alerts.kinds(), vec![AlertKind::StaleJob]);
        assert_eq!(detector.count_stale().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn fresh_heartbeat_is_left_alone() {
        let (store, audit) = backing();
        let worker = ops_for(&store, &audit, "busy");
        let detector = StaleJobDetector::new(
            Arc::new(ops_for(&store, &audit, "detector")),
            Arc::new(RecordingAlerts::default()),
            FIVE_MINUTES,
        );

        let job = paid_job(1, ColorMode::Bw);
        claim(&worker, &job).await;
        set_heartbeat(&store, job.id, Some(Utc::now() - chrono::Duration::minutes(2))).await;

        assert_eq!(detector.scan().await.unwrap(), StaleScanReport::default());
        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.print_status, PrintStatus::Printing);
    }

    #[tokio::test]
    async fn own_stale_job_takes_the_normal_fail_path() {
        let (store, audit) = backing();
        let ops = Arc::new(ops_for(&store, &audit, "me"));
        let detector = StaleJobDetector::new(
            Arc::clone(&ops),
            Arc::new(RecordingAlerts::default()),
            FIVE_MINUTES,
        );

        let job = paid_job(1, ColorMode::Bw);
        claim(&ops, &job).await;
        set_heartbeat(&store, job.id, Some(Utc::now() - chrono::Duration::minutes(6))).await;

        let report = detector.scan().await.unwrap();
        assert_eq!(report.self_healed, 1);

        let actions: Vec<String> = audit
            .entries_for_job(job.id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(actions, vec!["claim", "fail", "stale_recovered"]);
    }

    #[tokio::test]
    async fn missing_heartbeat_counts_as_stale_orphan() {
        let (store, audit) = backing();
        let detector = StaleJobDetector::new(
            Arc::new(ops_for(&store, &audit, "detector")),
            Arc::new(RecordingAlerts::default()),
            FIVE_MINUTES,
        );

        // A legacy row: printing with neither owner nor heartbeat.
        let mut job = paid_job(1, ColorMode::Bw);
        job.print_status = PrintStatus::Printing;
        job.idempotency_token = Some("legacy".into());
        store.insert_job(&job).await.unwrap();

        let report = detector.scan().await.unwrap();
        assert_eq!(report.orphaned, 1);
        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.print_status, PrintStatus::Pending);
        assert_eq!(job.print_attempt, 1);
    }
}
