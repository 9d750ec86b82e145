// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Criterion benchmarks for page segmentation and dispatch ordering.

use criterion::{Criterion, black_box, criterion_group, criterion_main};

use spoolward_core::types::{ColorMode, PageColor, PrintMode, PrintRequirements};
use spoolward_print::segments::{analyze, collapse_runs, execution_order};

/// A mixed job whose colour flips every `run` pages.
fn mixed_job(pages: u32, run: u32) -> PrintRequirements {
    let page_colors = (1..=pages)
        .map(|page_number| PageColor {
            page_number,
            mode: if ((page_number - 1) / run) % 2 == 0 {
                PrintMode::Color
            } else {
                PrintMode::Bw
            },
        })
        .collect();
    PrintRequirements {
        color_mode: ColorMode::Mixed,
        page_count: pages,
        page_colors,
        ..Default::default()
    }
}

fn bench_analyze(c: &mut Criterion) {
    let alternating = mixed_job(1000, 1);
    c.bench_function("analyze (1000 pages, alternating)", |b| {
        b.iter(|| black_box(analyze(black_box(&alternating), 1000)));
    });

    let chunky = mixed_job(1000, 50);
    c.bench_function("analyze (1000 pages, runs of 50)", |b| {
        b.iter(|| black_box(analyze(black_box(&chunky), 1000)));
    });
}

fn bench_execution_order(c: &mut Criterion) {
    let segments = analyze(&mixed_job(1000, 1), 1000);
    c.bench_function("execution_order (1000 segments)", |b| {
        b.iter(|| black_box(execution_order(black_box(&segments))));
    });
}

fn bench_collapse_runs(c: &mut Criterion) {
    let pages: Vec<u32> = (1..=2000).filter(|p| p % 3 != 0).rev().collect();
    c.bench_function("collapse_runs (1334 unsorted pages)", |b| {
        b.iter(|| black_box(collapse_runs(black_box(&pages))));
    });
}

criterion_group!(benches, bench_analyze, bench_execution_order, bench_collapse_runs);
criterion_main!(benches);
