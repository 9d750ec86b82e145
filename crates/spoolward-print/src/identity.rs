// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Worker identity, resolved once per process.
//
// The id is derived from configuration, or from the host name plus the
// worker's state directory, rather than generated randomly, so a worker
// restarted after a crash recognises the jobs it left in `printing` as its
// own. Two workers on one host with separate state directories get
// different ids; the store's worker lease refuses a second live process
// under an id already in use.

use std::path::Path;

use chrono::{DateTime, Utc};
use spoolward_core::types::WorkerId;
use spoolward_security::hash_bytes;
use uuid::Uuid;

/// Identity of the running worker process.
#[derive(Debug, Clone)]
pub struct WorkerIdentity {
    id: WorkerId,
    boot_id: Uuid,
    started_at: DateTime<Utc>,
}

impl WorkerIdentity {
    /// Use `configured` when set, otherwise `<hostname>-worker-<tag>`
    /// where `tag` is derived from the `instance` directory.
    pub fn resolve(configured: Option<&str>, instance: &Path) -> Self {
        let name = match configured.map(str::trim).filter(|s| !s.is_empty()) {
            Some(name) => sanitize(name),
            None => format!(
                "{}-worker-{}",
                sanitize(&host_name()),
                instance_tag(instance)
            ),
        };
        Self::named(name)
    }

    /// Identity with an explicit id.
    pub fn named(id: impl Into<String>) -> Self {
        Self {
            id: WorkerId(id.into()),
            boot_id: Uuid::new_v4(),
            started_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    /// Distinguishes successive runs of the same worker in logs.
    pub fn boot_id(&self) -> Uuid {
        self.boot_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}

fn host_name() -> String {
    if let Ok(name) = std::env::var("HOSTNAME") {
        if !name.trim().is_empty() {
            return name;
        }
    }
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// First eight hex digits of the SHA-256 of the instance path.
fn instance_tag(instance: &Path) -> String {
    let absolute = std::path::absolute(instance).unwrap_or_else(|_| instance.to_path_buf());
    let mut digest = hash_bytes(absolute.to_string_lossy().as_bytes());
    digest.truncate(8);
    digest
}

/// Lowercase, with anything outside `[a-z0-9._-]` replaced by `-`.
fn sanitize(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}
