// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Raw TCP print transport (JetDirect, port 9100).
//
// Opens a socket and streams the PDF. No settings travel with the data, so
// copies are sent as repeated submissions; the printer must understand PDF
// natively.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info, instrument};

use spoolward_core::error::{Result, SpoolwardError};

use crate::transport::{PrintOptions, PrintTransport};

/// Default raw TCP port (HP JetDirect).
pub const RAW_PORT: u16 = 9100;

const CHUNK_SIZE: usize = 8192;

/// Print transport that writes documents straight to a printer socket.
pub struct RawTcpTransport {
    timeout: Duration,
}

impl RawTcpTransport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for RawTcpTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

/// Turn a printer URI into a `host:port` socket address.
///
/// Accepts `socket://host[:port]`, `raw://host[:port]` or a bare
/// `host[:port]`; the port defaults to 9100.
pub fn socket_address(uri: &str) -> Result<String> {
    let rest = uri
        .strip_prefix("socket://")
        .or_else(|| uri.strip_prefix("raw://"))
        .unwrap_or(uri);
    let host_port = rest.trim_end_matches('/');
    if host_port.is_empty() || host_port.contains('/') {
        return Err(SpoolwardError::Transport(format!(
            "unsupported printer uri '{uri}'"
        )));
    }

    // Bracketed IPv6 literals carry colons of their own.
    let has_port = match host_port.rfind(']') {
        Some(close) => host_port[close..].contains(':'),
        None => host_port.contains(':'),
    };
    if has_port {
        Ok(host_port.to_string())
    } else {
        Ok(format!("{host_port}:{RAW_PORT}"))
    }
}

impl RawTcpTransport {
    async fn send_once(&self, addr: &str, document: &[u8]) -> Result<()> {
        let mut stream = tokio::time::timeout(self.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                SpoolwardError::Transport(format!(
                    "connection to {addr} timed out after {}s",
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| SpoolwardError::Transport(format!("connect to {addr}: {e}")))?;

        let mut sent = 0usize;
        for chunk in document.chunks(CHUNK_SIZE) {
            tokio::time::timeout(self.timeout, stream.write_all(chunk))
                .await
                .map_err(|_| {
                    SpoolwardError::Transport(format!("send to {addr} stalled at byte {sent}"))
                })?
                .map_err(|e| {
                    SpoolwardError::Transport(format!("send failed at byte {sent}: {e}"))
                })?;
            sent += chunk.len();
            debug!(sent, total = document.len(), "raw TCP progress");
        }

        stream
            .flush()
            .await
            .map_err(|e| SpoolwardError::Transport(format!("flush: {e}")))?;
        stream
            .shutdown()
            .await
            .map_err(|e| SpoolwardError::Transport(format!("shutdown: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl PrintTransport for RawTcpTransport {
    #[instrument(skip(self, options), fields(printer = %options.printer_name, copies = options.copies))]
    async fn print(&self, file: &Path, options: &PrintOptions) -> Result<()> {
        let addr = socket_address(&options.printer_uri)?;
        let document = tokio::fs::read(file).await?;

        for copy in 1..=options.copies.max(1) {
            self.send_once(&addr, &document).await?;
            debug!(copy, "copy sent");
        }

        info!(
            addr = %addr,
            bytes = document.len(),
            pages = options.page_selector.as_deref().unwrap_or("all"),
            "raw TCP submission complete"
        );
        Ok(())
    }
}
