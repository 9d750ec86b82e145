// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Operator alerts.

use chrono::{DateTime, Utc};
use serde::Serialize;
use spoolward_core::types::JobId;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AlertKind {
    /// A job failed and is running out of (or has run out of) attempts.
    RepeatedFailure,
    /// A printer's circuit opened, or no printer is available at all.
    PrinterOffline,
    /// A printing job stopped heartbeating.
    StaleJob,
    /// More paid jobs are waiting than the configured threshold.
    QueueBacklog,
    /// An operator overrode a job's status.
    AdminOverride,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RepeatedFailure => "repeated-failure",
            Self::PrinterOffline => "printer-offline",
            Self::StaleJob => "stale-job",
            Self::QueueBacklog => "queue-backlog",
            Self::AdminOverride => "admin-override",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub job_id: Option<JobId>,
    pub printer_id: Option<String>,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(kind: AlertKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            job_id: None,
            printer_id: None,
            message: message.into(),
            raised_at: Utc::now(),
        }
    }

    pub fn job(mut self, job_id: JobId) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn printer(mut self, printer_id: impl Into<String>) -> Self {
        self.printer_id = Some(printer_id.into());
        self
    }
}

/// Destination for alerts. Raising never fails and never blocks.
pub trait AlertSink: Send + Sync {
    fn raise(&self, alert: Alert);
}

/// Emits alerts as tracing events under the `spoolward::alert` target.
#[derive(Debug, Default)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn raise(&self, alert: Alert) {
        let job_id = alert.job_id.map(|id| id.to_string());
        match alert.kind {
            AlertKind::StaleJob | AlertKind::PrinterOffline | AlertKind::RepeatedFailure => error!(
                target: "spoolward::alert",
                kind = alert.kind.as_str(),
                job_id = job_id.as_deref(),
                printer = alert.printer_id.as_deref(),
                "{}",
                alert.message
            ),
            AlertKind::QueueBacklog | AlertKind::AdminOverride => warn!(
                target: "spoolward::alert",
                kind = alert.kind.as_str(),
                job_id = job_id.as_deref(),
                printer = alert.printer_id.as_deref(),
                "{}",
                alert.message
            ),
        }
    }
}
