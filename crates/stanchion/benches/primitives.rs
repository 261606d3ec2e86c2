//! Benchmarks for the coordination primitives
//!
//! Measures:
//! - StatCounter update and read throughput
//! - AdmissionGate admit/reject cost
//! - ResourcePool checkout, uncontended and contended
//! - ScatterGather batch overhead over an inline substrate

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use stanchion::{
    AdmissionGate, GatherConfig, InlineDispatcher, PoolConfig, ResourcePool, ScatterGather,
    StatCounter, Subtasks, WaitStrategy,
};
use std::convert::Infallible;
use std::hint::black_box;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn counter_updates(c: &mut Criterion) {
    let mut group = c.benchmark_group("counter/update");

    group.bench_function("increment", |b| {
        let counter = StatCounter::new();
        b.iter(|| counter.increment());
    });

    group.bench_function("get", |b| {
        let counter = StatCounter::with_value(42);
        b.iter(|| black_box(counter.get()));
    });

    group.finish();
}

fn gate_admission(c: &mut Criterion) {
    let mut group = c.benchmark_group("gate/admission");

    group.bench_function("admit_uncontended", |b| {
        let gate = AdmissionGate::new("bench", 64);
        b.iter(|| black_box(gate.try_acquire()));
    });

    group.bench_function("reject_exhausted", |b| {
        let gate = AdmissionGate::new("bench-full", 1);
        let _held = gate.try_acquire();
        b.iter(|| black_box(gate.try_acquire().is_none()));
    });

    group.finish();
}

fn pool_checkout(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool/checkout");

    group.bench_function("acquire_release_uncontended", |b| {
        let pool: ResourcePool<u32> = ResourcePool::new("bench", vec![1, 2, 3, 4]);
        b.iter(|| {
            let guard = pool.acquire(Duration::from_millis(100)).unwrap();
            black_box(*guard);
        });
    });

    group.bench_function("try_acquire_uncontended", |b| {
        let pool: ResourcePool<u32> = ResourcePool::new("bench-try", vec![1, 2, 3, 4]);
        b.iter(|| black_box(pool.try_acquire().is_some()));
    });

    group.finish();
}

fn pool_contention(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool/contention");
    group.sample_size(50); // Thread spawning makes iterations expensive

    for &threads in &[2, 4, 8] {
        group.bench_with_input(
            BenchmarkId::new("contended_cycles", threads),
            &threads,
            |b, &threads| {
                let config =
                    PoolConfig::new("bench-contended", 2).with_wait_strategy(WaitStrategy::SeparateConditions);
                let pool = Arc::new(ResourcePool::with_config(config, vec![1u32, 2]).unwrap());

                b.iter(|| {
                    let handles: Vec<_> = (0..threads)
                        .map(|_| {
                            let pool = Arc::clone(&pool);
                            thread::spawn(move || {
                                for _ in 0..25 {
                                    let guard = pool.acquire(Duration::from_secs(5)).unwrap();
                                    black_box(*guard);
                                }
                            })
                        })
                        .collect();
                    for handle in handles {
                        handle.join().unwrap();
                    }
                });
            },
        );
    }

    group.finish();
}

fn gather_inline(c: &mut Criterion) {
    let mut group = c.benchmark_group("gather/inline");

    for &subtasks in &[1, 4, 16] {
        group.bench_with_input(
            BenchmarkId::new("batch", subtasks),
            &subtasks,
            |b, &subtasks| {
                let gather = ScatterGather::new(
                    GatherConfig::new("bench").with_deadline(Duration::from_secs(1)),
                    Arc::new(InlineDispatcher),
                )
                .unwrap();

                b.iter(|| {
                    let mut batch = Subtasks::new();
                    for i in 0..subtasks {
                        batch = batch.task(format!("task-{}", i), move || {
                            Ok::<_, Infallible>(black_box(i))
                        });
                    }
                    black_box(gather.run(batch).unwrap())
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    counter_updates,
    gate_admission,
    pool_checkout,
    pool_contention,
    gather_inline,
);

criterion_main!(benches);
