//! Integration tests for resource pool contention
//!
//! Exercises the pool under real thread contention:
//! - Conservation invariant (available + outstanding == capacity)
//! - No resource held by two threads at once
//! - Liveness under heavy acquire/release churn
//! - Both signaling strategies pass the same load

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use stanchion::{PoolConfig, ResourcePool, StanchionError, WaitStrategy};

const CAPACITY: usize = 3;
const THREADS: usize = 10;
const CYCLES: usize = 1000;

/// Runs the churn scenario: 10 threads, 1000 acquire/use/release cycles
/// each, over 3 resources. Per-resource in-use flags catch any double
/// checkout; a sampler thread checks the conservation invariant while the
/// churn is in flight.
fn run_churn(strategy: WaitStrategy) {
    let config = PoolConfig::new("churn", CAPACITY).with_wait_strategy(strategy);
    let pool = Arc::new(ResourcePool::with_config(config, (0..CAPACITY).collect()).unwrap());
    let in_use: Arc<Vec<AtomicBool>> =
        Arc::new((0..CAPACITY).map(|_| AtomicBool::new(false)).collect());
    let churning = Arc::new(AtomicBool::new(true));
    let started = Instant::now();

    let sampler = {
        let pool = Arc::clone(&pool);
        let churning = Arc::clone(&churning);
        thread::spawn(move || {
            while churning.load(Ordering::SeqCst) {
                let stats = pool.stats();
                assert_eq!(
                    stats.available + stats.outstanding,
                    CAPACITY,
                    "conservation invariant violated: {} free + {} outstanding",
                    stats.available,
                    stats.outstanding
                );
                thread::yield_now();
            }
        })
    };

    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let pool = Arc::clone(&pool);
            let in_use = Arc::clone(&in_use);
            thread::spawn(move || {
                for _ in 0..CYCLES {
                    let resource = pool
                        .acquire(Duration::from_secs(30))
                        .expect("acquire must not time out while peers keep releasing");
                    let id = *resource;
                    let already_held = in_use[id].swap(true, Ordering::SeqCst);
                    assert!(!already_held, "resource {} handed to two threads", id);
                    // Clear the flag before the guard returns the resource.
                    in_use[id].store(false, Ordering::SeqCst);
                    drop(resource);
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
    churning.store(false, Ordering::SeqCst);
    sampler.join().unwrap();

    // Liveness: heavy churn terminates in bounded wall-clock time.
    assert!(
        started.elapsed() < Duration::from_secs(60),
        "churn took too long: {:?}",
        started.elapsed()
    );

    let stats = pool.stats();
    assert_eq!(stats.available, CAPACITY);
    assert_eq!(stats.outstanding, 0);
    assert_eq!(stats.acquires, (THREADS * CYCLES) as i64);
    assert_eq!(stats.returns, (THREADS * CYCLES) as i64);
    assert_eq!(stats.timeouts, 0);
}

/// Test: churn with one-waiter signaling
#[test]
fn test_churn_separate_conditions() {
    run_churn(WaitStrategy::SeparateConditions);
}

/// Test: churn with wake-everyone signaling
#[test]
fn test_churn_single_wait_set() {
    run_churn(WaitStrategy::SingleWaitSet);
}

/// Test: an exhausted pool times acquires out instead of hanging
#[test]
fn test_exhausted_pool_times_out() {
    let pool: ResourcePool<u32> = ResourcePool::new("exhausted", vec![1, 2]);
    let first = pool.acquire(Duration::from_millis(10)).unwrap();
    let second = pool.acquire(Duration::from_millis(10)).unwrap();

    let started = Instant::now();
    let err = pool.acquire(Duration::from_millis(100)).unwrap_err();
    let waited = started.elapsed();

    assert!(matches!(err, StanchionError::Timeout { .. }));
    assert!(
        waited >= Duration::from_millis(100),
        "timed out early after {:?}",
        waited
    );
    assert_eq!(pool.stats().timeouts, 1);
    drop(first);
    drop(second);
}

/// Test: a release reaches a waiter that was already blocked
#[test]
fn test_release_wakes_blocked_waiter() {
    let pool: Arc<ResourcePool<&str>> = Arc::new(ResourcePool::new("handoff", vec!["only"]));
    let held = pool.acquire(Duration::from_millis(10)).unwrap();

    let waiter = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || pool.acquire(Duration::from_secs(10)).map(|r| *r))
    };

    // Give the waiter time to block, then hand the resource back.
    thread::sleep(Duration::from_millis(50));
    drop(held);

    let reacquired = waiter.join().unwrap().expect("waiter should get the resource");
    assert_eq!(reacquired, "only");
}
