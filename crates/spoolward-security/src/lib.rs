// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// spoolward-security: tamper-evident record keeping for print workers.
//
// The audit log is append-only and is consulted by the idempotency check,
// so it must outlive any overwrite of the live job record.

pub mod audit;
pub mod integrity;

pub use audit::{AuditEntry, AuditLog, AuditRecord};
pub use integrity::{hash_bytes, hash_parts};
