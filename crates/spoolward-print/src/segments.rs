// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Page segment analysis for mixed colour / black & white jobs.
//
// A mixed job is cut into maximal runs of consecutive pages sharing one
// print mode, so colour pages go to the colour path and the rest print
// cheaply in mono. Printers stack output face up, so segments are sent
// last-page-first and the finished pile reads in natural order.

use std::collections::HashMap;

use spoolward_core::types::{ColorMode, PageRange, PrintMode, PrintRequirements, Segment};

/// Split a job of `page_count` pages into pending segments, in reading
/// order.
///
/// Mixed jobs without any classification print as one colour segment.
/// Pages missing from a partial classification are treated as colour.
pub fn analyze(req: &PrintRequirements, page_count: u32) -> Vec<Segment> {
    if page_count == 0 {
        return Vec::new();
    }
    let whole = PageRange::new(1, page_count);

    match req.color_mode {
        ColorMode::Color => vec![Segment::new(whole, PrintMode::Color, req)],
        ColorMode::Bw => vec![Segment::new(whole, PrintMode::Bw, req)],
        ColorMode::Mixed if req.page_colors.is_empty() => {
            vec![Segment::new(whole, PrintMode::Color, req)]
        }
        ColorMode::Mixed => {
            let classified: HashMap<u32, PrintMode> = req
                .page_colors
                .iter()
                .map(|pc| (pc.page_number, pc.mode))
                .collect();

            let mut color = Vec::new();
            let mut bw = Vec::new();
            for page in 1..=page_count {
                match classified.get(&page).copied().unwrap_or(PrintMode::Color) {
                    PrintMode::Color => color.push(page),
                    PrintMode::Bw => bw.push(page),
                }
            }

            let mut segments: Vec<Segment> = collapse_runs(&color)
                .into_iter()
                .map(|range| Segment::new(range, PrintMode::Color, req))
                .chain(
                    collapse_runs(&bw)
                        .into_iter()
                        .map(|range| Segment::new(range, PrintMode::Bw, req)),
                )
                .collect();
            segments.sort_by_key(|s| s.page_range.start);
            segments
        }
    }
}

/// Collapse page numbers into maximal runs of consecutive pages.
pub fn collapse_runs(pages: &[u32]) -> Vec<PageRange> {
    let mut sorted = pages.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut runs: Vec<PageRange> = Vec::new();
    for page in sorted {
        match runs.last_mut() {
            Some(run) if run.end + 1 == page => run.end = page,
            _ => runs.push(PageRange::new(page, page)),
        }
    }
    runs
}

/// Indices of `segments` in dispatch order: descending by last page, ties
/// broken by descending first page.
pub fn execution_order(segments: &[Segment]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..segments.len()).collect();
    order.sort_by(|&a, &b| {
        let (ra, rb) = (segments[a].page_range, segments[b].page_range);
        rb.end.cmp(&ra.end).then(rb.start.cmp(&ra.start))
    });
    order
}
