// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Worker supervisor.
//
// Wires the background tasks of one worker process together: the lease on
// the worker id and startup recovery first, then the poll loop, heartbeat, stale detector and health
// monitor as sibling tasks sharing one shutdown channel. Any task ending on
// its own is a fault, and faults go through the same shutdown path as a
// signal.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use spoolward_core::config::WorkerConfig;
use spoolward_core::error::Result;
use spoolward_security::AuditLog;

use crate::admin::AdminOperations;
use crate::alerts::AlertSink;
use crate::health::HealthTracker;
use crate::heartbeat::HeartbeatService;
use crate::identity::WorkerIdentity;
use crate::monitor::HealthMonitor;
use crate::operations::JobOperations;
use crate::processor::OrderProcessor;
use crate::recovery::{ShutdownReport, recover_on_startup, release_on_shutdown};
use crate::scheduler::PrintExecutor;
use crate::stale::StaleJobDetector;
use crate::store::JobStore;
use crate::transport::{DocumentSource, PrintTransport};

/// A configured, not yet started worker.
pub struct Worker {
    config: WorkerConfig,
    ops: Arc<JobOperations>,
    alerts: Arc<dyn AlertSink>,
    breakers: Arc<Mutex<HealthTracker>>,
    processor: Arc<OrderProcessor>,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        identity: WorkerIdentity,
        store: JobStore,
        audit: AuditLog,
        documents: Arc<dyn DocumentSource>,
        transport: Arc<dyn PrintTransport>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        let ops = Arc::new(
            JobOperations::new(store.clone(), audit, identity)
                .with_attempt_budget(config.max_print_attempts),
        );
        let breakers = Arc::new(Mutex::new(HealthTracker::new(config.printer_failure_threshold)));
        let executor = PrintExecutor::new(Arc::clone(&ops), documents, transport);
        let processor = Arc::new(OrderProcessor::new(
            Arc::clone(&ops),
            Arc::new(store),
            executor,
            Arc::clone(&alerts),
            Arc::clone(&breakers),
            config.poll_batch_size,
        ));
        Self {
            config,
            ops,
            alerts,
            breakers,
            processor,
        }
    }

    pub fn operations(&self) -> &Arc<JobOperations> {
        &self.ops
    }

    /// Operator overrides acting as this worker.
    pub fn admin(&self) -> AdminOperations {
        AdminOperations::new(Arc::clone(&self.ops), Arc::clone(&self.alerts))
    }

    /// Take the worker lease, recover from a previous crash, then start
    /// every background task. Nothing is polled until recovery has
    /// finished. Fails when another live process holds the same worker id.
    pub async fn start(self) -> Result<WorkerHandle> {
        let Worker {
            config,
            ops,
            alerts,
            breakers,
            processor,
        } = self;

        info!(
            worker_id = %ops.worker_id(),
            boot_id = %ops.identity().boot_id(),
            "worker starting"
        );
        ops.acquire_lease(config.heartbeat_interval() * 2).await?;
        if let Err(e) = recover_on_startup(&ops).await {
            if let Err(release) = ops.release_lease().await {
                warn!(error = %release, "could not release worker lease");
            }
            return Err(e);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();

        let poller = Arc::clone(&processor);
        let rx = shutdown_rx.clone();
        let poll_interval = config.poll_interval();
        tasks.spawn(async move {
            poller.run(poll_interval, rx).await;
            "order-processor"
        });

        let heartbeat = HeartbeatService::new(Arc::clone(&ops), config.heartbeat_interval());
        let rx = shutdown_rx.clone();
        tasks.spawn(async move {
            heartbeat.run(rx).await;
            "heartbeat"
        });

        let detector = StaleJobDetector::new(Arc::clone(&ops), Arc::clone(&alerts), config.stale_threshold());
        let rx = shutdown_rx.clone();
        let stale_interval = config.health_check_interval();
        tasks.spawn(async move {
            detector.run(stale_interval, rx).await;
            "stale-detector"
        });

        let monitor = HealthMonitor::new(
            ops.store().clone(),
            Arc::clone(&alerts),
            config.stale_threshold(),
            config.backlog_alert_threshold,
        )
        .with_breakers(breakers);
        let health_interval = config.health_check_interval();
        tasks.spawn(async move {
            monitor.run(health_interval, shutdown_rx).await;
            "health-monitor"
        });

        info!(worker_id = %ops.worker_id(), "worker started");
        Ok(WorkerHandle {
            ops,
            processor,
            tasks,
            shutdown_tx,
            grace: config.shutdown_grace(),
        })
    }
}

/// A running worker.
pub struct WorkerHandle {
    ops: Arc<JobOperations>,
    processor: Arc<OrderProcessor>,
    tasks: JoinSet<&'static str>,
    shutdown_tx: watch::Sender<bool>,
    grace: Duration,
}

impl WorkerHandle {
    pub fn operations(&self) -> &Arc<JobOperations> {
        &self.ops
    }

    /// Resolve when a background task stops without being asked to.
    /// Returns a description of the fault.
    pub async fn wait_for_fault(&mut self) -> String {
        match self.tasks.join_next().await {
            Some(Ok(name)) => format!("{name} stopped unexpectedly"),
            Some(Err(e)) if e.is_panic() => format!("background task panicked: {e}"),
            Some(Err(e)) => format!("background task cancelled: {e}"),
            None => std::future::pending().await,
        }
    }

    /// Stop polling, let the in-flight job finish within the grace period,
    /// then hand every job still owned back to the queue and free the
    /// worker id.
    pub async fn shutdown(mut self) -> ShutdownReport {
        info!(worker_id = %self.ops.worker_id(), "worker shutting down");
        self.processor.request_stop();
        // Receivers may already be gone after a fault.
        let _ = self.shutdown_tx.send(true);

        let drained = tokio::time::timeout(self.grace, async {
            while let Some(joined) = self.tasks.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "background task failed during shutdown");
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(grace_secs = self.grace.as_secs(), "grace period elapsed, aborting tasks");
            self.tasks.abort_all();
            while self.tasks.join_next().await.is_some() {}
        }

        let report = release_on_shutdown(&self.ops).await;
        if let Err(e) = self.ops.release_lease().await {
            warn!(error = %e, "could not release worker lease");
        }
        report
    }
}
