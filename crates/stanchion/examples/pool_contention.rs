//! Resource Pool Contention Demonstration
//!
//! Ten worker threads share three connections. Shows blocking checkout
//! with timeouts, RAII returns, the conservation invariant, and the two
//! signaling strategies side by side.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use stanchion::{PoolConfig, ResourcePool, StanchionError, WaitStrategy};

#[derive(Debug)]
struct Connection {
    id: usize,
}

impl Connection {
    fn query(&self, statement: &str) -> String {
        // Simulated round trip.
        thread::sleep(Duration::from_millis(15));
        format!("conn-{} answered '{}'", self.id, statement)
    }
}

fn run_workload(strategy: WaitStrategy) -> Duration {
    let connections = (0..3).map(|id| Connection { id }).collect();
    let config = PoolConfig::new("db", 3).with_wait_strategy(strategy);
    let pool = Arc::new(ResourcePool::with_config(config, connections).unwrap());

    let start = Instant::now();
    let workers: Vec<_> = (0..10)
        .map(|worker| {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                for cycle in 0..5 {
                    let conn = pool
                        .acquire(Duration::from_secs(5))
                        .expect("pool releases fast enough for every worker");
                    let answer = conn.query(&format!("select {} from t{}", cycle, worker));
                    drop(conn);
                    if cycle == 0 {
                        println!("    🔄 worker {:>2}: {}", worker, answer);
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    let elapsed = start.elapsed();

    let stats = pool.stats();
    println!(
        "    📊 acquires={}, timeouts={}, free={}/{} (invariant: {} + {} == {})",
        stats.acquires,
        stats.timeouts,
        stats.available,
        stats.capacity,
        stats.available,
        stats.outstanding,
        stats.capacity
    );
    elapsed
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,stanchion=debug")),
        )
        .init();

    println!("🏊 Resource Pool Contention Demo");
    println!("================================");

    // Test 1: 10 workers over 3 connections, one-waiter signaling
    println!("\n📊 Test 1: Churn with separate-conditions signaling");
    let separate = run_workload(WaitStrategy::SeparateConditions);
    println!("  ✅ finished in {:?}", separate);

    // Test 2: Same workload, wake-everyone signaling
    println!("\n📊 Test 2: Churn with single-wait-set signaling");
    let single = run_workload(WaitStrategy::SingleWaitSet);
    println!("  ✅ finished in {:?}", single);

    // Test 3: Exhausted pool times out instead of hanging
    println!("\n📊 Test 3: Acquire timeout on an exhausted pool");
    let pool: ResourcePool<Connection> =
        ResourcePool::new("drained", (0..2).map(|id| Connection { id }).collect());
    let first = pool.acquire(Duration::from_millis(100))?;
    let second = pool.acquire(Duration::from_millis(100))?;
    println!("  🔒 both connections held");

    match pool.acquire(Duration::from_millis(200)) {
        Err(StanchionError::Timeout { waited, .. }) => {
            println!("  ⏰ third acquire timed out after {:?} (expected)", waited);
        }
        Ok(_) => println!("  ❌ unexpected checkout"),
        Err(error) => println!("  ❌ unexpected error: {}", error),
    }

    // Non-blocking probe while drained.
    assert!(pool.try_acquire().is_none());
    println!("  🚫 try_acquire correctly reports nothing free");

    drop(first);
    drop(second);
    println!(
        "  ♻️  released: {}/{} free again",
        pool.available(),
        pool.capacity()
    );

    println!("\n🎉 Demo complete");
    Ok(())
}
