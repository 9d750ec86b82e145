// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// spoolward-document: Document handling for Spoolward print workers.
//
// Concatenates multi-file jobs, cuts page ranges out for segment dispatch,
// appends the order summary sheet, and renders that sheet from text. No
// format conversion happens here: inputs are PDFs.

pub mod pdf;

pub use pdf::reader::PdfReader;
pub use pdf::writer::PdfWriter;
