// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Per-printer circuit breaker.
//
// A printer that keeps failing is skipped by printer selection until a
// cooldown passes, then one job is let through as a trial. A trial slot
// whose job never reaches the printer is handed back so the circuit cannot
// stick half-open. Failures here are transport failures observed by this
// worker only; the fleet's own printer status is a separate input.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Jobs are dispatched normally.
    Closed,
    /// Too many failures; the printer is skipped until the cooldown ends.
    Open,
    /// Cooldown over; one trial job is in flight.
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct PrinterHealth {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub opened_at: Option<Instant>,
    pub last_success: Option<Instant>,
    pub last_error: Option<String>,
}

impl Default for PrinterHealth {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            last_success: None,
            last_error: None,
        }
    }
}

/// Circuit state for every printer this worker has dispatched to, keyed by
/// printer id.
pub struct HealthTracker {
    printers: HashMap<String, PrinterHealth>,
    failure_threshold: u32,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new(3)
    }
}

impl HealthTracker {
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            printers: HashMap::new(),
            failure_threshold: failure_threshold.max(1),
        }
    }

    /// Whether a job may be sent to `printer_id` now.
    ///
    /// An open circuit whose cooldown has passed moves to half-open and
    /// admits exactly one trial job.
    pub fn allow_request(&mut self, printer_id: &str) -> bool {
        let health = self.printers.entry(printer_id.to_string()).or_default();

        match health.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let Some(opened_at) = health.opened_at else {
                    health.state = CircuitState::Closed;
                    return true;
                };
                let cooldown = cooldown_duration(health.consecutive_failures);
                if opened_at.elapsed() >= cooldown {
                    info!(printer = printer_id, "circuit half-open, allowing a trial job");
                    health.state = CircuitState::HalfOpen;
                    true
                } else {
                    debug!(
                        printer = printer_id,
                        remaining_ms = (cooldown - opened_at.elapsed()).as_millis(),
                        "circuit open, skipping printer"
                    );
                    false
                }
            }
            CircuitState::HalfOpen => false,
        }
    }

    pub fn record_success(&mut self, printer_id: &str) {
        let health = self.printers.entry(printer_id.to_string()).or_default();

        if health.state != CircuitState::Closed {
            info!(printer = printer_id, prev_state = ?health.state, "printer recovered, closing circuit");
        }

        health.state = CircuitState::Closed;
        health.consecutive_failures = 0;
        health.opened_at = None;
        health.last_success = Some(Instant::now());
        health.last_error = None;
    }

    /// Record a failed dispatch. Returns `true` when this failure opened
    /// (or re-opened) the circuit.
    pub fn record_failure(&mut self, printer_id: &str, error: &str) -> bool {
        let health = self.printers.entry(printer_id.to_string()).or_default();

        health.consecutive_failures += 1;
        health.last_error = Some(error.to_string());

        if health.state == CircuitState::HalfOpen {
            warn!(printer = printer_id, "trial job failed, reopening circuit");
            health.state = CircuitState::Open;
            health.opened_at = Some(Instant::now());
            return true;
        }

        if health.consecutive_failures >= self.failure_threshold && health.state == CircuitState::Closed {
            warn!(
                printer = printer_id,
                failures = health.consecutive_failures,
                "opening circuit breaker for printer"
            );
            health.state = CircuitState::Open;
            health.opened_at = Some(Instant::now());
            return true;
        }
        false
    }

    /// Hand back a trial slot that ended without reaching the printer
    /// (claim lost, job rejected, nothing dispatched). The circuit returns
    /// to open with its original cooldown, so the next request is admitted
    /// as the trial again. No-op unless half-open.
    pub fn release_trial(&mut self, printer_id: &str) {
        if let Some(health) = self.printers.get_mut(printer_id) {
            if health.state == CircuitState::HalfOpen {
                debug!(printer = printer_id, "trial slot returned unused");
                health.state = CircuitState::Open;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn backdate_open(&mut self, printer_id: &str, by: Duration) {
        if let Some(health) = self.printers.get_mut(printer_id) {
            health.opened_at = health.opened_at.map(|at| at - by);
        }
    }

    /// Printers whose circuit is not closed.
    pub fn tripped(&self) -> Vec<(&str, CircuitState)> {
        let mut tripped: Vec<_> = self
            .printers
            .iter()
            .filter(|(_, h)| h.state != CircuitState::Closed)
            .map(|(id, h)| (id.as_str(), h.state))
            .collect();
        tripped.sort_by(|a, b| a.0.cmp(b.0));
        tripped
    }
}

/// 30s below 5 failures, 2 minutes below 10, then 5 minutes.
fn cooldown_duration(failures: u32) -> Duration {
    if failures >= 10 {
        Duration::from_secs(300)
    } else if failures >= 5 {
        Duration::from_secs(120)
    } else {
        Duration::from_secs(30)
    }
}
