// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Printer capability validation.
//
// Compares what a job needs against what a printer declares. Nothing is
// auto-corrected: a mismatch means the job waits for a printer that fits.

use spoolward_core::types::{ColorMode, PrintRequirements, PrinterCapabilities};

/// Every way `caps` falls short of `req`. Empty means the printer can take
/// the job. A printer without a capability descriptor accepts everything.
pub fn validate_capabilities(req: &PrintRequirements, caps: Option<&PrinterCapabilities>) -> Vec<String> {
    let Some(caps) = caps else {
        return Vec::new();
    };
    let mut violations = Vec::new();

    if req.paper_size.rank() > caps.max_paper_size.rank() {
        violations.push(format!(
            "paper size {:?} exceeds printer maximum {:?}",
            req.paper_size, caps.max_paper_size
        ));
    }

    // Mixed jobs contain colour pages.
    if req.color_mode != ColorMode::Bw && !caps.color {
        violations.push("colour printing required but printer is monochrome".to_string());
    }

    if req.duplex.is_duplex() && !caps.duplex {
        violations.push(format!(
            "duplex ({:?}) required but printer is simplex only",
            req.duplex
        ));
    }

    if caps.max_copies > 0 && req.copies > caps.max_copies {
        violations.push(format!(
            "{} copies requested but printer allows at most {}",
            req.copies, caps.max_copies
        ));
    }

    violations
}
