//! Benchmarks for autotune candidate selection.

use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use gpurt::prelude::*;

fn candidates(count: usize) -> Vec<CandidateResult> {
    (0..count)
        .map(|i| {
            let run_time = Duration::from_nanos(10_000 + ((i * 7919) % 5_000) as u64);
            let result = CandidateResult::success(run_time, ((i * 104_729) % 4096) as u64)
                .with_algorithm(Algorithm::Id(i as i64));
            // Every tenth candidate fails outright.
            if i % 10 == 9 {
                result.with_failure(FailureKind::RedzoneModified, format!("algo {} wrote past its buffer", i))
            } else {
                result
            }
        })
        .collect()
}

fn benchmark_select(c: &mut Criterion) {
    let mut group = c.benchmark_group("autotune/select");

    for count in [8, 64, 512] {
        let results = candidates(count);

        let fastest = AutotuneSelector::new(&RuntimeConfig::default());
        group.bench_with_input(BenchmarkId::new("fastest", count), &results, |b, results| {
            b.iter(|| fastest.select(black_box(results), Some("gemm.1")))
        });

        let deterministic = AutotuneSelector::with_determinism(true);
        group.bench_with_input(BenchmarkId::new("deterministic", count), &results, |b, results| {
            b.iter(|| deterministic.select(black_box(results), Some("gemm.1")))
        });
    }

    group.finish();
}

fn benchmark_all_failed(c: &mut Criterion) {
    let results: Vec<_> = (0..64)
        .map(|i| CandidateResult::failed(FailureKind::Disqualified, format!("algo {} disqualified", i)))
        .collect();
    let selector = AutotuneSelector::new(&RuntimeConfig::default());

    c.bench_function("autotune/all_failed", |b| {
        b.iter(|| selector.select(black_box(&results), Some("conv.3")).is_err())
    });
}

criterion_group!(benches, benchmark_select, benchmark_all_failed);
criterion_main!(benches);
