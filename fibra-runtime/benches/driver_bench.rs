//! Driver benchmarks using criterion.
//!
//! Measures the interpreter loop on long synchronous chains, fork/join
//! round trips, and contended semaphores.
//!
//! Run with: cargo bench --bench driver_bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use fibra_runtime::prelude::*;

fn runtime() -> Runtime {
    Runtime::new(RuntimeConfig::builder().num_workers(4).build_unchecked())
}

fn count_down(n: u64) -> Effect<(), Never, u64> {
    if n == 0 {
        succeed(0)
    } else {
        succeed(n - 1).chain(count_down).map(|x| x + 1)
    }
}

/// Benchmark the interpreter on chains of synchronous steps
fn bench_chain(c: &mut Criterion) {
    let runtime = runtime();
    let mut group = c.benchmark_group("chain");

    for depth in [100u64, 1_000, 10_000] {
        group.throughput(Throughput::Elements(depth));
        group.bench_with_input(BenchmarkId::new("count_down", depth), &depth, |b, &depth| {
            b.iter(|| black_box(runtime.run(count_down(depth))));
        });
    }

    group.bench_function("fold_error", |b| {
        let program = fail::<(), u32, u32>(1)
            .fold::<Never, _, _, _>(|e| e + 1, |a| a)
            .chain(|n| succeed(n * 2));
        b.iter(|| black_box(runtime.run(program.clone())));
    });

    group.finish();
}

/// Benchmark fork/join round trips
fn bench_fork_join(c: &mut Criterion) {
    let runtime = runtime();
    let mut group = c.benchmark_group("fork_join");

    group.bench_function("single", |b| {
        let program = succeed::<(), Never, u32>(1)
            .fork::<Never>()
            .chain(|fiber| fiber.join());
        b.iter(|| black_box(runtime.run(program.clone())));
    });

    for width in [10usize, 100, 1_000] {
        group.throughput(Throughput::Elements(width as u64));
        group.bench_with_input(BenchmarkId::new("foreach_par", width), &width, |b, &width| {
            b.iter(|| {
                let program = foreach_par(0..width, |n| succeed::<(), Never, usize>(n + 1));
                black_box(runtime.run(program))
            });
        });
    }

    group.finish();
}

/// Benchmark permit hand-off under contention
fn bench_semaphore(c: &mut Criterion) {
    let runtime = runtime();
    let mut group = c.benchmark_group("semaphore");

    for permits in [1usize, 4] {
        group.bench_with_input(BenchmarkId::new("with_permit", permits), &permits, |b, &permits| {
            b.iter(|| {
                let semaphore = Semaphore::new(permits);
                let task = semaphore.with_permit(yield_now::<(), Never>());
                let program = foreach_par(0..64, move |_: usize| task.clone());
                black_box(runtime.run(program))
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_chain, bench_fork_join, bench_semaphore);
criterion_main!(benches);
