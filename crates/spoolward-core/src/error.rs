// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Unified error types for Spoolward.

use thiserror::Error;

use crate::types::JobId;

/// Top-level error type for all Spoolward operations.
#[derive(Debug, Error)]
pub enum SpoolwardError {
    // -- Job lifecycle --
    #[error("job {0} not found")]
    JobNotFound(JobId),

    #[error("job {0} is no longer owned by this worker")]
    OwnershipLost(JobId),

    #[error("illegal transition: {0}")]
    InvalidTransition(String),

    #[error("invalid page colour classification: {0}")]
    InvalidPageColor(String),

    #[error("segment {segment} failed: {reason}")]
    SegmentFailed { segment: String, reason: String },

    // -- Collaborators --
    #[error("print transport failed: {0}")]
    Transport(String),

    #[error("document fetch failed: {0}")]
    Document(String),

    #[error("PDF operation failed: {0}")]
    Pdf(String),

    // -- Storage / persistence --
    #[error("database error: {0}")]
    Database(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, SpoolwardError>;
