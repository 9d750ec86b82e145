// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Periodic health sweep. Read-only: it counts and alerts, the stale
// detector does the resetting.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use spoolward_core::error::Result;

use crate::alerts::{Alert, AlertKind, AlertSink};
use crate::health::HealthTracker;
use crate::store::JobStore;
use crate::stale::stale_cutoff;
use crate::ticker::run_every;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    /// Printing jobs whose heartbeat is older than the stale threshold.
    pub stale: u64,
    /// Paid jobs waiting to be claimed.
    pub backlog: u64,
    /// Printers this worker is currently skipping, by id.
    pub open_circuits: Vec<String>,
}

pub struct HealthMonitor {
    store: JobStore,
    alerts: Arc<dyn AlertSink>,
    breakers: Option<Arc<Mutex<HealthTracker>>>,
    stale_threshold: Duration,
    backlog_threshold: u64,
}

impl HealthMonitor {
    pub fn new(
        store: JobStore,
        alerts: Arc<dyn AlertSink>,
        stale_threshold: Duration,
        backlog_threshold: u64,
    ) -> Self {
        Self {
            store,
            alerts,
            breakers: None,
            stale_threshold,
            backlog_threshold,
        }
    }

    /// Report the circuit state kept by this worker's order processor.
    pub fn with_breakers(mut self, breakers: Arc<Mutex<HealthTracker>>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    fn open_circuits(&self) -> Vec<String> {
        let Some(breakers) = &self.breakers else {
            return Vec::new();
        };
        let breakers = match breakers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        breakers.tripped().into_iter().map(|(id, _)| id.to_string()).collect()
    }

    pub async fn check(&self) -> Result<HealthSnapshot> {
        let snapshot = HealthSnapshot {
            stale: self.store.count_stale(stale_cutoff(self.stale_threshold)).await?,
            backlog: self.store.count_backlog().await?,
            open_circuits: self.open_circuits(),
        };

        if snapshot.stale > 0 {
            self.alerts.raise(Alert::new(
                AlertKind::StaleJob,
                format!("{} printing job(s) without a recent heartbeat", snapshot.stale),
            ));
        }
        if self.backlog_threshold > 0 && snapshot.backlog > self.backlog_threshold {
            self.alerts.raise(Alert::new(
                AlertKind::QueueBacklog,
                format!(
                    "{} paid jobs waiting (threshold {})",
                    snapshot.backlog, self.backlog_threshold
                ),
            ));
        }

        if !snapshot.open_circuits.is_empty() {
            warn!(printers = ?snapshot.open_circuits, "printers skipped by open circuits");
        }
        info!(stale = snapshot.stale, backlog = snapshot.backlog, "health check");
        Ok(snapshot)
    }

    pub async fn run(self, interval: Duration, shutdown: watch::Receiver<bool>) {
        run_every("health-monitor", interval, shutdown, || async {
            if let Err(e) = self.check().await {
                warn!(error = %e, "health check failed");
            }
        })
        .await;
    }
}
