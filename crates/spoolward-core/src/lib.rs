// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Spoolward: Core types, the print status state machine, and error
// definitions shared across all crates.

pub mod config;
pub mod error;
pub mod state_machine;
pub mod types;

pub use config::WorkerConfig;
pub use error::SpoolwardError;
pub use types::*;
