// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Order processor: the poll loop.
//
// Each tick fetches a batch of claimable jobs, oldest first, and handles
// them one at a time: pick a capable printer, claim, execute, then complete
// or fail. Only one batch runs per worker at a time; a tick that finds the
// previous one still running is skipped. Per-job errors end at the job
// boundary and never stop the loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use spoolward_core::error::SpoolwardError;
use spoolward_core::types::{PrintJob, Printer};

use crate::alerts::{Alert, AlertKind, AlertSink};
use crate::capabilities::validate_capabilities;
use crate::health::HealthTracker;
use crate::operations::{ClaimOutcome, JobOperations};
use crate::scheduler::PrintExecutor;
use crate::ticker::run_every;
use crate::transport::PrinterFleet;

/// What happened to one job in a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Printed,
    /// Execution failed and the job went back to the queue.
    Failed(String),
    /// Another worker claimed it first.
    Contended,
    /// Out of attempts; frozen for an operator.
    Exhausted,
    Rejected(String),
    /// No available printer can satisfy the job right now.
    NoCapablePrinter,
    /// The job was taken away mid-print (stale reset or operator).
    OwnershipLost,
}

/// Tally of one poll tick.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollSummary {
    pub printed: usize,
    pub failed: usize,
    pub contended: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// The previous tick is still running.
    Busy,
    /// No printer is available.
    NoPrinters,
    Processed(PollSummary),
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct OrderProcessor {
    ops: Arc<JobOperations>,
    fleet: Arc<dyn PrinterFleet>,
    executor: PrintExecutor,
    alerts: Arc<dyn AlertSink>,
    breakers: Arc<Mutex<HealthTracker>>,
    busy: AtomicBool,
    stopping: AtomicBool,
    printers_missing: AtomicBool,
    batch_size: u32,
}

impl OrderProcessor {
    pub fn new(
        ops: Arc<JobOperations>,
        fleet: Arc<dyn PrinterFleet>,
        executor: PrintExecutor,
        alerts: Arc<dyn AlertSink>,
        breakers: Arc<Mutex<HealthTracker>>,
        batch_size: u32,
    ) -> Self {
        Self {
            ops,
            fleet,
            executor,
            alerts,
            breakers,
            busy: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            printers_missing: AtomicBool::new(false),
            batch_size: batch_size.max(1),
        }
    }

    /// Stop picking up new jobs. The job in flight is allowed to finish.
    pub fn request_stop(&self) {
        self.stopping.store(true, Ordering::Release);
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// One poll tick.
    #[instrument(skip(self), fields(worker_id = %self.ops.worker_id()))]
    pub async fn poll_once(&self) -> PollOutcome {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("previous poll still running");
            return PollOutcome::Busy;
        }
        let _guard = BusyGuard(&self.busy);

        let printers = match self.fleet.available_printers().await {
            Ok(printers) => printers,
            Err(e) => {
                warn!(error = %e, "could not load printers");
                Vec::new()
            }
        };
        if printers.is_empty() {
            if !self.printers_missing.swap(true, Ordering::AcqRel) {
                self.alerts.raise(Alert::new(
                    AlertKind::PrinterOffline,
                    "no printer is online with auto-print enabled",
                ));
            }
            return PollOutcome::NoPrinters;
        }
        self.printers_missing.store(false, Ordering::Release);

        let jobs = match self.ops.store().claimable_jobs(self.batch_size).await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(error = %e, "could not load pending jobs");
                return PollOutcome::Processed(PollSummary::default());
            }
        };

        let mut summary = PollSummary::default();
        for job in jobs {
            if self.stopping.load(Ordering::Acquire) {
                debug!("stop requested, leaving remaining jobs");
                break;
            }
            match self.process_job(job, &printers).await {
                JobOutcome::Printed => summary.printed += 1,
                JobOutcome::Failed(_) | JobOutcome::OwnershipLost => summary.failed += 1,
                JobOutcome::Contended => summary.contended += 1,
                JobOutcome::Exhausted | JobOutcome::Rejected(_) | JobOutcome::NoCapablePrinter => {
                    summary.skipped += 1
                }
            }
        }

        if summary != PollSummary::default() {
            info!(
                printed = summary.printed,
                failed = summary.failed,
                contended = summary.contended,
                skipped = summary.skipped,
                "poll finished"
            );
        }
        PollOutcome::Processed(summary)
    }

    /// First printer, in queue order, whose circuit is closed and whose
    /// capabilities cover the job.
    fn select_printer<'a>(&self, job: &PrintJob, printers: &'a [Printer]) -> Option<&'a Printer> {
        let mut breakers = self.lock_breakers();
        for printer in printers {
            let violations = validate_capabilities(&job.requirements, printer.capabilities.as_ref());
            if !violations.is_empty() {
                debug!(job_id = %job.id, printer = %printer.id, ?violations, "printer cannot take job");
                continue;
            }
            if breakers.allow_request(&printer.id) {
                return Some(printer);
            }
        }
        None
    }

    /// Handle one job end to end. Never returns an error: every failure is
    /// recorded on the job and reported as an outcome.
    #[instrument(skip(self, job, printers), fields(job_id = %job.id, order = %job.order_number))]
    pub async fn process_job(&self, job: PrintJob, printers: &[Printer]) -> JobOutcome {
        let Some(printer) = self.select_printer(&job, printers) else {
            debug!("no capable printer available");
            return JobOutcome::NoCapablePrinter;
        };

        let outcome = self.print_on(job, printer).await;
        // Outcomes that never reached the printer leave a half-open circuit
        // holding its trial slot; give it back.
        self.lock_breakers().release_trial(&printer.id);
        outcome
    }

    async fn print_on(&self, job: PrintJob, printer: &Printer) -> JobOutcome {
        let token = match self.ops.claim(job.id, &printer.id, &printer.name).await {
            Ok(ClaimOutcome::Claimed { token }) => token,
            Ok(ClaimOutcome::Contended) => return JobOutcome::Contended,
            Ok(ClaimOutcome::Rejected(reason)) => return JobOutcome::Rejected(reason),
            Ok(ClaimOutcome::Exhausted) => {
                self.alerts.raise(
                    Alert::new(
                        AlertKind::RepeatedFailure,
                        format!("order {} exhausted its print attempts", job.order_number),
                    )
                    .job(job.id),
                );
                return JobOutcome::Exhausted;
            }
            Err(e) => {
                warn!(error = %e, "claim failed");
                return JobOutcome::Rejected(e.to_string());
            }
        };

        // Re-read so segment progress and the attempt number are current.
        let claimed = match self.ops.store().get_job(job.id).await {
            Ok(Some(claimed)) => claimed,
            Ok(None) => return JobOutcome::OwnershipLost,
            Err(e) => return self.fail_job(&job, printer, &e.to_string()).await,
        };

        match self.executor.execute(&claimed, printer).await {
            Ok(report) => {
                self.record_printer_success(&printer.id);
                let mut metadata = Map::new();
                metadata.insert("document_hash".into(), Value::from(report.document_hash));
                metadata.insert("pages".into(), Value::from(report.pages));
                metadata.insert("dispatches".into(), Value::from(report.dispatches));
                metadata.insert("printer_id".into(), Value::from(printer.id.clone()));

                match self.ops.complete_with_metadata(job.id, metadata).await {
                    Ok(true) => JobOutcome::Printed,
                    Ok(false) if self.ops.is_already_printed(&token).await => {
                        debug!("completion already recorded for this attempt");
                        JobOutcome::Printed
                    }
                    Ok(false) => {
                        warn!("printed, but the job was taken away before completion");
                        JobOutcome::OwnershipLost
                    }
                    Err(e) => {
                        error!(error = %e, "could not record completion");
                        JobOutcome::Failed(e.to_string())
                    }
                }
            }
            Err(SpoolwardError::OwnershipLost(_)) => {
                warn!("job was taken away during execution");
                JobOutcome::OwnershipLost
            }
            Err(e) => self.fail_job(&claimed, printer, &e.to_string()).await,
        }
    }

    async fn fail_job(&self, job: &PrintJob, printer: &Printer, message: &str) -> JobOutcome {
        if self.record_printer_failure(&printer.id, message) {
            self.alerts.raise(
                Alert::new(
                    AlertKind::PrinterOffline,
                    format!("printer {} keeps failing: {message}", printer.name),
                )
                .printer(printer.id.clone()),
            );
        }

        match self.ops.fail(job.id, message).await {
            Ok(true) => {
                // fail() counts one more attempt on top of the claim's.
                if job.print_attempt + 1 >= job.max_print_attempts {
                    self.alerts.raise(
                        Alert::new(
                            AlertKind::RepeatedFailure,
                            format!("order {} failed on its last attempt: {message}", job.order_number),
                        )
                        .job(job.id)
                        .printer(printer.id.clone()),
                    );
                }
                JobOutcome::Failed(message.to_string())
            }
            Ok(false) => JobOutcome::OwnershipLost,
            Err(e) => {
                error!(error = %e, "could not record failure");
                JobOutcome::Failed(message.to_string())
            }
        }
    }

    fn lock_breakers(&self) -> MutexGuard<'_, HealthTracker> {
        match self.breakers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn record_printer_success(&self, printer_id: &str) {
        self.lock_breakers().record_success(printer_id);
    }

    fn record_printer_failure(&self, printer_id: &str, message: &str) -> bool {
        self.lock_breakers().record_failure(printer_id, message)
    }

    pub async fn run(self: Arc<Self>, interval: Duration, shutdown: watch::Receiver<bool>) {
        run_every("order-processor", interval, shutdown, || async {
            self.poll_once().await;
        })
        .await;
    }
}
