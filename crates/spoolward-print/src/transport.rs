// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Collaborator seams: the physical print transport, the document source,
// and the printer fleet. Each is an object-safe async trait so the worker
// can be wired against real hardware or against in-memory doubles.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use spoolward_core::error::{Result, SpoolwardError};
use spoolward_core::types::{DuplexMode, PaperSize, PrintMode, Printer};
use tracing::{debug, instrument};

/// Settings for one call to the print transport.
#[derive(Debug, Clone, PartialEq)]
pub struct PrintOptions {
    pub printer_name: String,
    /// Transport address of the printer.
    pub printer_uri: String,
    pub copies: u32,
    /// Page selector in `start-end` form, informational for transports
    /// that receive an already-sliced file.
    pub page_selector: Option<String>,
    pub mode: PrintMode,
    pub duplex: DuplexMode,
    pub paper_size: PaperSize,
}

/// Sends one file to one printer. One call per sheet or segment.
#[async_trait]
pub trait PrintTransport: Send + Sync {
    async fn print(&self, file: &Path, options: &PrintOptions) -> Result<()>;
}

/// Resolves a job's file references to document bytes.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn fetch(&self, reference: &str) -> Result<Vec<u8>>;
}

/// Live view of the printers a worker may dispatch to.
#[async_trait]
pub trait PrinterFleet: Send + Sync {
    /// Active, auto-printing printers that are online or busy, shortest
    /// queue first.
    async fn available_printers(&self) -> Result<Vec<Printer>>;
}

/// Reads documents from a directory on the local filesystem.
pub struct FsDocumentSource {
    root: PathBuf,
}

impl FsDocumentSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve `reference` under the root. Absolute paths and `..` are
    /// refused so a job cannot read outside the document directory.
    fn resolve(&self, reference: &str) -> Result<PathBuf> {
        let relative = Path::new(reference);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if reference.is_empty() || escapes {
            return Err(SpoolwardError::Document(format!(
                "document reference '{reference}' is not a relative path"
            )));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl DocumentSource for FsDocumentSource {
    #[instrument(skip(self), fields(root = %self.root.display()))]
    async fn fetch(&self, reference: &str) -> Result<Vec<u8>> {
        let path = self.resolve(reference)?;
        let bytes = tokio::fs::read(&path).await.map_err(|e| {
            SpoolwardError::Document(format!("read {}: {e}", path.display()))
        })?;
        debug!(bytes = bytes.len(), "document fetched");
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fetches_relative_references() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("orders")).unwrap();
        std::fs::write(dir.path().join("orders/1001.pdf"), b"%PDF-1.5").unwrap();

        let source = FsDocumentSource::new(dir.path());
        let bytes = source.fetch("orders/1001.pdf").await.unwrap();
        assert_eq!(bytes, b"%PDF-1.5");
    }

    #[tokio::test]
    async fn refuses_escaping_references() {
        let dir = tempfile::tempdir().unwrap();
        let source = FsDocumentSource::new(dir.path());

        assert!(source.fetch("../secret.pdf").await.is_err());
        assert!(source.fetch("/etc/passwd").await.is_err());
        assert!(source.fetch("").await.is_err());
    }

    #[tokio::test]
    async fn missing_file_is_a_document_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = FsDocumentSource::new(dir.path());
        let err = source.fetch("absent.pdf").await.unwrap_err();
        assert!(matches!(err, SpoolwardError::Document(_)));
    }
}
