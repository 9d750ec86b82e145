// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Data directory resolution.

use std::path::PathBuf;

use spoolward_core::error::Result;

/// Return the worker's data directory, creating it if needed.
///
/// `SPOOLWARD_DATA_DIR` wins; otherwise the XDG data directory.
pub fn data_dir() -> Result<PathBuf> {
    let dir = match std::env::var_os("SPOOLWARD_DATA_DIR") {
        Some(dir) => PathBuf::from(dir),
        None => base_dir().join("spoolward"),
    };
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

fn base_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(xdg);
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".local").join("share");
    }
    // Last resort
    PathBuf::from("/tmp")
}
