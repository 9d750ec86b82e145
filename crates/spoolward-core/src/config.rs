// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Worker configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for one worker process. Every field has a default so a partial
/// JSON file is enough.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Stable worker name. Defaults to one derived from the host name.
    pub worker_name: Option<String>,
    /// Job store database. Defaults to `<data dir>/jobs.db`.
    pub database_path: Option<PathBuf>,
    /// Audit database. Defaults to `<data dir>/audit.db`.
    pub audit_path: Option<PathBuf>,
    /// Directory that job file references are resolved against.
    pub document_root: Option<PathBuf>,
    /// Seconds between poll ticks.
    pub poll_interval_secs: u64,
    /// Seconds between bulk heartbeats.
    pub heartbeat_interval_secs: u64,
    /// Heartbeat age after which a printing job counts as stale.
    pub stale_threshold_secs: u64,
    /// Seconds between health sweeps (stale count, backlog).
    pub health_check_interval_secs: u64,
    /// Attempts before a job is frozen with a terminal error.
    pub max_print_attempts: u32,
    /// Pending jobs fetched per poll tick.
    pub poll_batch_size: u32,
    /// Pending jobs above which a queue-backlog alert is raised.
    pub backlog_alert_threshold: u64,
    /// Consecutive failures before a printer's circuit opens.
    pub printer_failure_threshold: u32,
    /// How long shutdown waits for an in-flight job before releasing it.
    pub shutdown_grace_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_name: None,
            database_path: None,
            audit_path: None,
            document_root: None,
            poll_interval_secs: 5,
            heartbeat_interval_secs: 30,
            stale_threshold_secs: 300,
            health_check_interval_secs: 60,
            max_print_attempts: 3,
            poll_batch_size: 20,
            backlog_alert_threshold: 25,
            printer_failure_threshold: 3,
            shutdown_grace_secs: 10,
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_threshold_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs.max(1))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Reject settings that would break liveness detection.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.max_print_attempts == 0 {
            return Err(crate::error::SpoolwardError::Config(
                "max_print_attempts must be at least 1".into(),
            ));
        }
        if self.stale_threshold_secs <= self.heartbeat_interval_secs {
            return Err(crate::error::SpoolwardError::Config(format!(
                "stale_threshold_secs ({}) must exceed heartbeat_interval_secs ({})",
                self.stale_threshold_secs, self.heartbeat_interval_secs
            )));
        }
        Ok(())
    }
}
