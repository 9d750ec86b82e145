// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Spoolward worker process.
//
// Entry point. Initialises logging, loads configuration, starts the worker
// and runs it until a signal or a task fault, then shuts down through the
// same release path either way.
//
// Usage: spoolward [CONFIG_PATH]

mod services;

use std::path::PathBuf;
use std::process::ExitCode;

use spoolward_core::error::Result;
use tracing::{error, info, warn};

use services::data_dir;
use services::worker_services::{build_worker, load_config};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Spoolward starting");

    match run().await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "spoolward failed to start");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<ExitCode> {
    let explicit = std::env::args_os().nth(1).map(PathBuf::from);
    let dir = data_dir::data_dir()?;
    let config = load_config(explicit.as_deref(), &dir)?;

    let mut handle = build_worker(config, &dir)?.start().await?;

    let code = tokio::select! {
        signal = shutdown_signal() => {
            info!(signal, "shutdown requested");
            ExitCode::SUCCESS
        }
        fault = handle.wait_for_fault() => {
            error!(%fault, "worker fault, shutting down");
            ExitCode::FAILURE
        }
    };

    let report = handle.shutdown().await;
    info!(
        released = report.released.len(),
        errors = report.errors,
        "spoolward stopped"
    );
    Ok(code)
}

/// Resolve on Ctrl-C or, on Unix, SIGTERM.
async fn shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => tokio::select! {
                _ = tokio::signal::ctrl_c() => "ctrl-c",
                _ = term.recv() => "sigterm",
            },
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable, waiting for Ctrl-C");
                let _ = tokio::signal::ctrl_c().await;
                "ctrl-c"
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "ctrl-c"
    }
}
