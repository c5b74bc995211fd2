//! Quadrature decoder micro-benchmark.
//!
//! Edge handlers run on the GPIO interrupt threads, so the per-edge cost
//! bounds the highest encoder frequency the reader can follow.
//! - single edge on a fresh decoder
//! - full forward Gray cycle (four edges)
//! - two threads feeding A and B concurrently

use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use std::sync::Arc;
use std::thread;

use blitz_hal::motion::QuadratureDecoder;

/// Forward sequence (A, B): 00 -> 10 -> 11 -> 01 -> 00.
const FORWARD: [(bool, bool); 4] = [(true, false), (true, true), (false, true), (false, false)];

fn bench_single_edge(c: &mut Criterion) {
    let decoder = QuadratureDecoder::new(false, false);
    let mut level = false;

    c.bench_function("quadrature_single_edge", |b| {
        b.iter(|| {
            level = !level;
            decoder.on_a(black_box(level));
        });
    });
}

fn bench_forward_cycle(c: &mut Criterion) {
    let decoder = QuadratureDecoder::new(false, false);

    c.bench_function("quadrature_forward_cycle", |b| {
        b.iter(|| {
            for (a, b) in FORWARD {
                decoder.on_a(black_box(a));
                decoder.on_b(black_box(b));
            }
            decoder.count()
        });
    });
}

fn bench_contended(c: &mut Criterion) {
    const EDGES: usize = 10_000;

    c.bench_function("quadrature_two_threads_10k_edges", |b| {
        b.iter(|| {
            let decoder = Arc::new(QuadratureDecoder::new(false, false));
            let on_a = Arc::clone(&decoder);
            let on_b = Arc::clone(&decoder);
            let ta = thread::spawn(move || {
                for i in 0..EDGES {
                    on_a.on_a(i % 2 == 0);
                }
            });
            let tb = thread::spawn(move || {
                for i in 0..EDGES {
                    on_b.on_b(i % 2 == 0);
                }
            });
            let _ = ta.join();
            let _ = tb.join();
            decoder.count()
        });
    });
}

criterion_group!(benches, bench_single_edge, bench_forward_cycle, bench_contended);
criterion_main!(benches);
