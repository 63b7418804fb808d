//! Job throughput benchmark using criterion.
//!
//! Measures fire-and-forget job dispatch through the recycler and the
//! central queue when a root job fans out a large batch of tiny children.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use taskweave::JobSystem;

const JOB_COUNT: usize = 100_000;

fn bench_fire_and_forget(c: &mut Criterion) {
    let num_threads = num_cpus::get();
    let system = JobSystem::new(num_threads);

    // Warmup populates the recycler.
    let warm = Arc::new(AtomicUsize::new(0));
    for _ in 0..1000 {
        let warm = Arc::clone(&warm);
        system.run(move || {
            warm.fetch_add(1, Ordering::Relaxed);
        });
    }
    while warm.load(Ordering::Relaxed) < 1000 {
        std::hint::spin_loop();
    }

    let mut group = c.benchmark_group("throughput");
    group.throughput(Throughput::Elements(JOB_COUNT as u64));
    group.sample_size(10);

    group.bench_function(BenchmarkId::new("fire_and_forget", num_threads), |b| {
        b.iter(|| {
            let completed = Arc::new(AtomicUsize::new(0));
            let counter = Arc::clone(&completed);
            let sys = Arc::clone(&system);
            system.run(move || {
                for _ in 0..JOB_COUNT {
                    let counter = Arc::clone(&counter);
                    sys.run(move || {
                        counter.fetch_add(1, Ordering::Relaxed);
                    });
                }
            });
            while completed.load(Ordering::Relaxed) < JOB_COUNT {
                std::hint::spin_loop();
            }
        })
    });

    group.finish();
    system.shutdown().expect("shutdown failed");
}

fn bench_pinned_dispatch(c: &mut Criterion) {
    let num_threads = num_cpus::get().min(4);
    let system = JobSystem::new(num_threads);

    let mut group = c.benchmark_group("pinned");
    group.throughput(Throughput::Elements(10_000));
    group.sample_size(10);

    group.bench_function("inbox_round_robin", |b| {
        b.iter(|| {
            let completed = Arc::new(AtomicUsize::new(0));
            for i in 0..10_000usize {
                let completed = Arc::clone(&completed);
                system.run_on((i % num_threads) as i32, move || {
                    completed.fetch_add(1, Ordering::Relaxed);
                });
            }
            while completed.load(Ordering::Relaxed) < 10_000 {
                std::hint::spin_loop();
            }
        })
    });

    group.finish();
    system.shutdown().expect("shutdown failed");
}

criterion_group!(benches, bench_fire_and_forget, bench_pinned_dispatch);
criterion_main!(benches);
