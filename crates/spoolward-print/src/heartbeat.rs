// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Heartbeat service.
//
// Liveness is inferred only from heartbeat age, so every job this worker is
// printing gets its heartbeat refreshed on a fixed interval, and so does the
// lease on the worker id. The executor also beats a single job between long
// steps.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::operations::JobOperations;
use crate::ticker::run_every;

pub struct HeartbeatService {
    ops: Arc<JobOperations>,
    interval: Duration,
}

impl HeartbeatService {
    pub fn new(ops: Arc<JobOperations>, interval: Duration) -> Self {
        Self { ops, interval }
    }

    /// One bulk heartbeat, plus a renewal of the worker lease. Returns the
    /// number of jobs refreshed; store errors are logged and count as zero.
    pub async fn tick(&self) -> usize {
        match self.ops.renew_lease().await {
            Ok(true) => {}
            Ok(false) => warn!("worker lease was taken over by another process"),
            Err(e) => warn!(error = %e, "lease renewal failed"),
        }
        match self.ops.heartbeat_all().await {
            Ok(refreshed) => {
                if refreshed > 0 {
                    debug!(refreshed, "heartbeats refreshed");
                }
                refreshed
            }
            Err(e) => {
                warn!(error = %e, "heartbeat tick failed");
                0
            }
        }
    }

    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        run_every("heartbeat", self.interval, shutdown, || async {
            self.tick().await;
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operations::ClaimOutcome;
    use crate::test_support::{backing, ops_for, paid_job, set_heartbeat};
    use chrono::Utc;
    use spoolward_core::types::ColorMode;

    #[tokio::test]
    async fn refreshes_only_jobs_owned_by_this_worker() {
        let (store, audit) = backing();
        let mine = Arc::new(ops_for(&store, &audit, "mine"));
        let theirs = ops_for(&store, &audit, "theirs");

        let a = paid_job(1, ColorMode::Bw);
        let b = paid_job(1, ColorMode::Bw);
        store.insert_job(&a).await.unwrap();
        store.insert_job(&b).await.unwrap();
        assert!(matches!(mine.claim(a.id, "p", "P").await.unwrap(), ClaimOutcome::Claimed { .. }));
        assert!(matches!(theirs.claim(b.id, "p", "P").await.unwrap(), ClaimOutcome::Claimed { .. }));

        let old = Utc::now() - chrono::Duration::minutes(3);
        set_heartbeat(&store, a.id, Some(old)).await;
        set_heartbeat(&store, b.id, Some(old)).await;

        let service = HeartbeatService::new(Arc::clone(&mine), Duration::from_secs(30));
        assert_eq!(service.tick().await, 1);

        let a = store.get_job(a.id).await.unwrap().unwrap();
        let b = store.get_job(b.id).await.unwrap().unwrap();
        let recent = Utc::now() - chrono::Duration::minutes(1);
        assert!(a.heartbeat_at.unwrap() > recent);
        assert!(b.heartbeat_at.unwrap() < recent);
    }

    #[tokio::test]
    async fn idle_worker_refreshes_nothing() {
        let (store, audit) = backing();
        let ops = Arc::new(ops_for(&store, &audit, "idle"));
        let service = HeartbeatService::new(ops, Duration::from_secs(30));
        assert_eq!(service.tick().await, 0);
    }

    #[tokio::test]
    async fn run_beats_until_shutdown() {
        let (store, audit) = backing();
        let ops = Arc::new(ops_for(&store, &audit, "runner"));
        ops.acquire_lease(Duration::from_secs(60)).await.unwrap();
        let job = paid_job(1, ColorMode::Bw);
        store.insert_job(&job).await.unwrap();
        assert!(matches!(ops.claim(job.id, "p", "P").await.unwrap(), ClaimOutcome::Claimed { .. }));
        let old = Utc::now() - chrono::Duration::minutes(3);
        set_heartbeat(&store, job.id, Some(old)).await;

        let (tx, rx) = watch::channel(false);
        let service = HeartbeatService::new(Arc::clone(&ops), Duration::from_millis(20));
        let running = tokio::spawn(service.run(rx));

        let recent = Utc::now() - chrono::Duration::minutes(1);
        let mut refreshed = false;
        for _ in 0..100 {
            let beat = store.get_job(job.id).await.unwrap().unwrap().heartbeat_at;
            if beat.is_some_and(|at| at > recent) {
                refreshed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(refreshed);

        tx.send(true).unwrap();
        running.await.unwrap();
        assert!(ops.renew_lease().await.unwrap());
    }
}
