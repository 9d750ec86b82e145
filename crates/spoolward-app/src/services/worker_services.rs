// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Configuration loading and worker wiring.
//
// The shipped collaborators are the filesystem document source, the raw
// TCP (port 9100) print transport and the tracing alert sink. Everything
// else comes from `WorkerConfig`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use spoolward_core::WorkerConfig;
use spoolward_core::error::{Result, SpoolwardError};
use spoolward_print::{
    FsDocumentSource, JobStore, RawTcpTransport, TracingAlertSink, Worker, WorkerIdentity,
};
use spoolward_security::AuditLog;
use tracing::info;

pub const CONFIG_FILE: &str = "config.json";

/// Load the worker configuration.
///
/// An explicit path must exist. Without one, `config.json` in the data
/// directory is used when present, defaults otherwise. The result is
/// validated either way.
pub fn load_config(explicit: Option<&Path>, data_dir: &Path) -> Result<WorkerConfig> {
    let config = match explicit {
        Some(path) => read_config(path)?,
        None => {
            let path = data_dir.join(CONFIG_FILE);
            if path.exists() {
                read_config(&path)?
            } else {
                info!(path = %path.display(), "no config file, using defaults");
                WorkerConfig::default()
            }
        }
    };
    config.validate()?;
    Ok(config)
}

fn read_config(path: &Path) -> Result<WorkerConfig> {
    let data = std::fs::read_to_string(path)?;
    let config = serde_json::from_str(&data)
        .map_err(|e| SpoolwardError::Config(format!("{}: {e}", path.display())))?;
    info!(path = %path.display(), "configuration loaded");
    Ok(config)
}

/// Where the worker keeps its state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPaths {
    pub database: PathBuf,
    pub audit: PathBuf,
    pub documents: PathBuf,
}

impl WorkerPaths {
    pub fn resolve(config: &WorkerConfig, data_dir: &Path) -> Self {
        Self {
            database: config
                .database_path
                .clone()
                .unwrap_or_else(|| data_dir.join("jobs.db")),
            audit: config
                .audit_path
                .clone()
                .unwrap_or_else(|| data_dir.join("audit.db")),
            documents: config
                .document_root
                .clone()
                .unwrap_or_else(|| data_dir.join("documents")),
        }
    }
}

/// Open the databases and assemble a worker ready to start.
pub fn build_worker(config: WorkerConfig, data_dir: &Path) -> Result<Worker> {
    let paths = WorkerPaths::resolve(&config, data_dir);
    info!(
        database = %paths.database.display(),
        audit = %paths.audit.display(),
        documents = %paths.documents.display(),
        "opening worker state"
    );

    let store = JobStore::open(&paths.database)?;
    let audit = AuditLog::open(&paths.audit)?;
    std::fs::create_dir_all(&paths.documents)?;

    let identity = WorkerIdentity::resolve(config.worker_name.as_deref(), data_dir);
    Ok(Worker::new(
        config,
        identity,
        store,
        audit,
        Arc::new(FsDocumentSource::new(paths.documents)),
        Arc::new(RawTcpTransport::default()),
        Arc::new(TracingAlertSink),
    ))
}
