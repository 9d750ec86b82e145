// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Spoolward Print: the worker side of the print pipeline. Job store and
// atomic claim operations, liveness (heartbeat, stale detection, crash
// recovery), page segmentation and dispatch, and the poll loop that ties
// them together.

pub mod admin;
pub mod alerts;
pub mod capabilities;
pub mod health;
pub mod heartbeat;
pub mod identity;
pub mod monitor;
pub mod operations;
pub mod processor;
pub mod raw_client;
pub mod recovery;
pub mod scheduler;
pub mod segments;
pub mod stale;
pub mod store;
pub mod transport;
pub mod worker;

mod ticker;

#[cfg(test)]
mod test_support;

pub use admin::AdminOperations;
pub use alerts::{Alert, AlertKind, AlertSink, TracingAlertSink};
pub use identity::WorkerIdentity;
pub use operations::{ClaimOutcome, JobOperations};
pub use processor::OrderProcessor;
pub use raw_client::RawTcpTransport;
pub use store::JobStore;
pub use transport::{DocumentSource, FsDocumentSource, PrintOptions, PrintTransport, PrinterFleet};
pub use worker::{Worker, WorkerHandle};
