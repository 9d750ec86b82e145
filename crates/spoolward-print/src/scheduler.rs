// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Print execution for a claimed job.
//
// The finished pile should read summary sheet on top, then pages 1..n.
// Printers stack face up, so for a segmented job the last segment goes
// first and the one-page order summary goes last. An unsegmented job is a
// single submission with the summary merged in as its final page.
//
// Segment progress is written to the job row before and after every
// dispatch. A retry trusts segments already marked completed and redoes
// everything else, so a failure halfway through a long job does not print
// the finished part twice.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use spoolward_core::error::{Result, SpoolwardError};
use spoolward_core::types::{
    ColorMode, JobId, PrintJob, PrintMode, Printer, Segment, SegmentStatus,
};
use spoolward_document::{PdfReader, PdfWriter};
use spoolward_security::audit::actions;
use spoolward_security::{AuditRecord, hash_parts};

use crate::operations::JobOperations;
use crate::segments::{analyze, execution_order};
use crate::transport::{DocumentSource, PrintOptions, PrintTransport};

/// What an execution sent to the printer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReport {
    /// SHA-256 over the job's source documents, in file order.
    pub document_hash: String,
    pub pages: u32,
    /// Transport calls made, summary included.
    pub dispatches: u32,
    /// Segments already completed by an earlier attempt.
    pub segments_skipped: u32,
}

pub struct PrintExecutor {
    ops: Arc<JobOperations>,
    documents: Arc<dyn DocumentSource>,
    transport: Arc<dyn PrintTransport>,
}

impl PrintExecutor {
    pub fn new(
        ops: Arc<JobOperations>,
        documents: Arc<dyn DocumentSource>,
        transport: Arc<dyn PrintTransport>,
    ) -> Self {
        Self {
            ops,
            documents,
            transport,
        }
    }

    /// Print `job` on `printer`. The job must be claimed by this worker.
    #[instrument(skip_all, fields(job_id = %job.id, printer = %printer.id))]
    pub async fn execute(&self, job: &PrintJob, printer: &Printer) -> Result<ExecutionReport> {
        if job.files.is_empty() {
            return Err(SpoolwardError::Document("job has no documents".into()));
        }

        let mut parts = Vec::with_capacity(job.files.len());
        for reference in &job.files {
            parts.push(self.documents.fetch(reference).await?);
        }
        let document_hash = hash_parts(&parts);
        let reader = PdfReader::concatenate(&parts)?;
        let pages = reader.page_count();
        if pages == 0 {
            return Err(SpoolwardError::Pdf("document has no pages".into()));
        }
        if pages != job.requirements.page_count {
            debug!(declared = job.requirements.page_count, actual = pages, "page count differs from intake");
        }
        self.beat(job.id).await?;

        let mut report = ExecutionReport {
            document_hash,
            pages,
            dispatches: 0,
            segments_skipped: 0,
        };
        if job.is_segmented() {
            self.run_segments(job, printer, &reader, &mut report).await?;
        } else {
            self.run_single(job, printer, &reader, &mut report).await?;
        }

        info!(pages, dispatches = report.dispatches, skipped = report.segments_skipped, "job dispatched");
        Ok(report)
    }

    async fn run_segments(
        &self,
        job: &PrintJob,
        printer: &Printer,
        reader: &PdfReader,
        report: &mut ExecutionReport,
    ) -> Result<()> {
        let mut segments = if job.segments.is_empty() {
            let fresh = analyze(&job.requirements, report.pages);
            self.persist(job.id, &fresh).await?;
            fresh
        } else {
            job.segments.clone()
        };

        for idx in execution_order(&segments) {
            if segments[idx].status == SegmentStatus::Completed {
                debug!(pages = %segments[idx].page_range, "segment already printed, skipping");
                report.segments_skipped += 1;
                continue;
            }

            {
                let seg = &mut segments[idx];
                seg.status = SegmentStatus::Printing;
                seg.segment_token = Some(Uuid::new_v4().to_string());
                seg.started_at = Some(Utc::now());
                seg.completed_at = None;
                seg.error = None;
            }
            self.persist(job.id, &segments).await?;

            let seg = segments[idx].clone();
            match self.print_segment(reader, &seg, printer).await {
                Ok(()) => {
                    segments[idx].status = SegmentStatus::Completed;
                    segments[idx].completed_at = Some(Utc::now());
                    self.persist(job.id, &segments).await?;
                    report.dispatches += 1;
                    self.ops
                        .audit(
                            AuditRecord::new(actions::SEGMENT_COMPLETED, job.id)
                                .token(seg.segment_token.clone())
                                .meta("segment_id", seg.segment_id.clone())
                                .meta("pages", seg.page_range.to_string())
                                .meta("mode", seg.print_mode.as_str()),
                        )
                        .await;
                    self.beat(job.id).await?;
                }
                Err(e) => {
                    let reason = e.to_string();
                    segments[idx].status = SegmentStatus::Failed;
                    segments[idx].error = Some(reason.clone());
                    if let Err(persist_err) = self.persist(job.id, &segments).await {
                        warn!(error = %persist_err, "could not record segment failure");
                    }
                    self.ops
                        .audit(
                            AuditRecord::new(actions::SEGMENT_FAILED, job.id)
                                .token(seg.segment_token.clone())
                                .reason(reason.clone())
                                .meta("segment_id", seg.segment_id.clone())
                                .meta("pages", seg.page_range.to_string()),
                        )
                        .await;
                    return Err(SpoolwardError::SegmentFailed {
                        segment: seg.page_range.to_string(),
                        reason,
                    });
                }
            }
        }

        let summary = render_summary(job, report.pages, &segments, printer, self.ops.worker_id().as_str())?;
        let options = PrintOptions {
            printer_name: printer.name.clone(),
            printer_uri: printer.uri.clone(),
            copies: 1,
            page_selector: None,
            mode: PrintMode::Bw,
            duplex: job.requirements.duplex,
            paper_size: job.requirements.paper_size,
        };
        self.dispatch(&summary, &options).await?;
        report.dispatches += 1;
        Ok(())
    }

    async fn print_segment(&self, reader: &PdfReader, seg: &Segment, printer: &Printer) -> Result<()> {
        let bytes = reader.extract_range(seg.page_range.start, seg.page_range.end)?;
        let options = PrintOptions {
            printer_name: printer.name.clone(),
            printer_uri: printer.uri.clone(),
            copies: seg.copies,
            page_selector: Some(seg.page_range.to_string()),
            mode: seg.print_mode,
            duplex: seg.duplex,
            paper_size: seg.paper_size,
        };
        debug!(pages = %seg.page_range, mode = seg.print_mode.as_str(), "dispatching segment");
        self.dispatch(&bytes, &options).await
    }

    async fn run_single(
        &self,
        job: &PrintJob,
        printer: &Printer,
        reader: &PdfReader,
        report: &mut ExecutionReport,
    ) -> Result<()> {
        let summary = render_summary(job, report.pages, &[], printer, self.ops.worker_id().as_str())?;
        let merged = reader.with_appended(&summary)?;
        let mode = match job.requirements.color_mode {
            ColorMode::Color => PrintMode::Color,
            ColorMode::Bw | ColorMode::Mixed => PrintMode::Bw,
        };
        let options = PrintOptions {
            printer_name: printer.name.clone(),
            printer_uri: printer.uri.clone(),
            copies: job.requirements.copies,
            page_selector: Some(format!("1-{}", report.pages + 1)),
            mode,
            duplex: job.requirements.duplex,
            paper_size: job.requirements.paper_size,
        };
        self.dispatch(&merged, &options).await?;
        report.dispatches += 1;
        Ok(())
    }

    /// Write `bytes` to a temporary file and hand it to the transport. The
    /// file is removed when this returns, whatever the outcome.
    async fn dispatch(&self, bytes: &[u8], options: &PrintOptions) -> Result<()> {
        let file = tempfile::Builder::new()
            .prefix("spoolward-")
            .suffix(".pdf")
            .tempfile()?;
        tokio::fs::write(file.path(), bytes).await?;
        self.transport.print(file.path(), options).await
    }

    async fn persist(&self, job_id: JobId, segments: &[Segment]) -> Result<()> {
        if self.ops.save_segments(job_id, segments).await? {
            Ok(())
        } else {
            Err(SpoolwardError::OwnershipLost(job_id))
        }
    }

    /// Heartbeat between long steps. Losing the job aborts; a store hiccup
    /// does not.
    async fn beat(&self, job_id: JobId) -> Result<()> {
        match self.ops.heartbeat(job_id).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(SpoolwardError::OwnershipLost(job_id)),
            Err(e) => {
                warn!(error = %e, "heartbeat failed");
                Ok(())
            }
        }
    }
}

/// One-page order summary, printed last so it lands on top of the pile.
fn render_summary(
    job: &PrintJob,
    pages: u32,
    segments: &[Segment],
    printer: &Printer,
    worker: &str,
) -> Result<Vec<u8>> {
    let req = &job.requirements;
    let mut text = format!(
        "Order {}\nJob {}\n\nPages: {}\nCopies: {}\nPaper: {:?}\nDuplex: {:?}\nColour: {:?}\n",
        job.order_number, job.id, pages, req.copies, req.paper_size, req.duplex, req.color_mode
    );
    if !segments.is_empty() {
        text.push_str("\nSegments:\n");
        let mut ordered: Vec<&Segment> = segments.iter().collect();
        ordered.sort_by_key(|s| s.page_range.start);
        for seg in ordered {
            text.push_str(&format!("  pages {}  {}\n", seg.page_range, seg.print_mode));
        }
    }
    text.push_str(&format!(
        "\nAttempt {} of {}\nPrinted on {} by {}\n{}\n",
        job.print_attempt,
        job.max_print_attempts,
        printer.name,
        worker,
        Utc::now().format("%Y-%m-%d %H:%M UTC")
    ));

    let mut writer = PdfWriter::new(req.paper_size);
    writer.set_title(format!("Order {}", job.order_number));
    writer.create_pages(&[text])
}
