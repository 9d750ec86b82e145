// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Fixtures and collaborator doubles shared by this crate's tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::params;

use spoolward_core::error::{Result, SpoolwardError};
use spoolward_core::types::{
    ColorMode, JobId, PaperSize, PaymentStatus, PrintJob, PrintMode, PrintRequirements, Printer,
    PrinterCapabilities, PrinterStatus,
};
use spoolward_document::{PdfReader, PdfWriter};
use spoolward_security::AuditLog;

use crate::alerts::{Alert, AlertKind, AlertSink};
use crate::identity::WorkerIdentity;
use crate::operations::JobOperations;
use crate::store::{JobStore, ts};
use crate::transport::{DocumentSource, PrintOptions, PrintTransport};

pub(crate) fn backing() -> (JobStore, AuditLog) {
    (
        JobStore::open_in_memory().expect("in-memory store"),
        AuditLog::open_in_memory().expect("in-memory audit log"),
    )
}

/// Operations for worker `name` over an existing store and audit log.
pub(crate) fn ops_for(store: &JobStore, audit: &AuditLog, name: &str) -> JobOperations {
    JobOperations::new(store.clone(), audit.clone(), WorkerIdentity::named(name))
}

/// Operations for worker `name` over fresh in-memory backing.
pub(crate) fn shared_ops(name: &str) -> Arc<JobOperations> {
    let (store, audit) = backing();
    Arc::new(ops_for(&store, &audit, name))
}

/// A paid, pending job referencing `doc.pdf`.
pub(crate) fn paid_job(pages: u32, color_mode: ColorMode) -> PrintJob {
    let requirements = PrintRequirements {
        color_mode,
        page_count: pages,
        ..Default::default()
    };
    let mut job = PrintJob::new("ORD-1001", vec!["doc.pdf".to_string()], requirements);
    job.payment_status = PaymentStatus::Completed;
    job
}

/// An online, auto-printing printer that can print anything.
pub(crate) fn printer(id: &str) -> Printer {
    Printer {
        id: id.to_string(),
        name: format!("Printer {id}"),
        uri: "127.0.0.1:9100".to_string(),
        active: true,
        auto_print: true,
        status: PrinterStatus::Online,
        queue_length: 0,
        capabilities: Some(PrinterCapabilities {
            max_paper_size: PaperSize::A3,
            color: true,
            duplex: true,
            max_copies: 0,
        }),
    }
}

pub(crate) fn numbered_pdf(pages: u32) -> Vec<u8> {
    let texts: Vec<String> = (1..=pages).map(|n| format!("page {n}")).collect();
    PdfWriter::a4().create_pages(&texts).expect("render test pdf")
}

/// Overwrite a job's heartbeat directly.
pub(crate) async fn set_heartbeat(store: &JobStore, job_id: JobId, at: Option<DateTime<Utc>>) {
    store
        .call(move |conn| {
            conn.execute(
                "UPDATE jobs SET heartbeat_at = ?1 WHERE id = ?2",
                params![at.map(ts), job_id.to_string()],
            )
            .map_err(|e| SpoolwardError::Database(e.to_string()))
        })
        .await
        .expect("set heartbeat");
}

/// Overwrite a job's stored `page_colors` with raw JSON, bypassing the
/// typed write path.
pub(crate) async fn set_raw_page_colors(store: &JobStore, job_id: JobId, raw: &str) {
    let raw = raw.to_string();
    store
        .call(move |conn| {
            conn.execute(
                "UPDATE jobs SET requirements = json_set(requirements, '$.page_colors', json(?1)) \
                 WHERE id = ?2",
                params![raw, job_id.to_string()],
            )
            .map_err(|e| SpoolwardError::Database(e.to_string()))
        })
        .await
        .expect("set page colors");
}

/// Documents served from memory.
#[derive(Default)]
pub(crate) struct MemoryDocuments {
    docs: HashMap<String, Vec<u8>>,
}

impl MemoryDocuments {
    pub(crate) fn with(mut self, reference: &str, bytes: Vec<u8>) -> Self {
        self.docs.insert(reference.to_string(), bytes);
        self
    }
}

#[async_trait]
impl DocumentSource for MemoryDocuments {
    async fn fetch(&self, reference: &str) -> Result<Vec<u8>> {
        self.docs
            .get(reference)
            .cloned()
            .ok_or_else(|| SpoolwardError::Document(format!("no document '{reference}'")))
    }
}

/// One call observed by [`RecordingTransport`].
#[derive(Debug, Clone)]
pub(crate) struct Dispatch {
    pub pages: u32,
    pub copies: u32,
    pub mode: PrintMode,
    pub selector: Option<String>,
    pub printer: String,
    pub file: PathBuf,
}

/// Transport that counts pages instead of printing. Call number
/// `fail_on` (1-based) fails, or every call when `fail_all` is set.
#[derive(Default)]
pub(crate) struct RecordingTransport {
    dispatches: Mutex<Vec<Dispatch>>,
    calls: Mutex<usize>,
    fail_on: Option<usize>,
    fail_all: bool,
}

impl RecordingTransport {
    pub(crate) fn failing_on(call: usize) -> Self {
        Self {
            fail_on: Some(call),
            ..Default::default()
        }
    }

    pub(crate) fn always_failing() -> Self {
        Self {
            fail_all: true,
            ..Default::default()
        }
    }

    pub(crate) fn dispatches(&self) -> Vec<Dispatch> {
        self.dispatches.lock().expect("dispatch log").clone()
    }
}

#[async_trait]
impl PrintTransport for RecordingTransport {
    async fn print(&self, file: &Path, options: &PrintOptions) -> Result<()> {
        let call = {
            let mut calls = self.calls.lock().expect("call counter");
            *calls += 1;
            *calls
        };
        let bytes = tokio::fs::read(file).await?;
        if self.fail_all || self.fail_on == Some(call) {
            return Err(SpoolwardError::Transport("printer jammed".into()));
        }
        let pages = PdfReader::from_bytes(&bytes)?.page_count();
        self.dispatches.lock().expect("dispatch log").push(Dispatch {
            pages,
            copies: options.copies,
            mode: options.mode,
            selector: options.page_selector.clone(),
            printer: options.printer_name.clone(),
            file: file.to_path_buf(),
        });
        Ok(())
    }
}

/// Alert sink that keeps everything it is given.
#[derive(Default)]
pub(crate) struct RecordingAlerts {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingAlerts {
    pub(crate) fn kinds(&self) -> Vec<AlertKind> {
        self.alerts
            .lock()
            .expect("alert log")
            .iter()
            .map(|a| a.kind)
            .collect()
    }
}

impl AlertSink for RecordingAlerts {
    fn raise(&self, alert: Alert) {
        self.alerts.lock().expect("alert log").push(alert);
    }
}
