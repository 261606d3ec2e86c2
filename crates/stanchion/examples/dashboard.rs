//! Dashboard Fan-Out Demonstration
//!
//! Simulates a dashboard endpoint: at most two builds run concurrently
//! (admission gate), and each build fans three backend lookups out to a
//! thread-pool substrate, keeping whatever beat the deadline.

use std::convert::Infallible;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use stanchion::{
    AdmissionGate, CountdownLatch, DispatcherConfig, GatherConfig, JoinPolicy, ScatterGather,
    StanchionError, Subtasks, ThreadPoolDispatcher,
};

fn backend_lookups() -> Subtasks<String> {
    Subtasks::new()
        .task("weather", || {
            thread::sleep(Duration::from_millis(1000));
            Ok::<_, Infallible>("22C, clear".to_string())
        })
        .task("traffic", || {
            thread::sleep(Duration::from_millis(800));
            Ok::<_, Infallible>("flowing".to_string())
        })
        .task("news", || {
            thread::sleep(Duration::from_millis(1500));
            Ok::<_, Infallible>("3 headlines".to_string())
        })
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,stanchion=debug")),
        )
        .init();

    println!("🧩 Dashboard Fan-Out Demo");
    println!("=========================");

    let dispatcher = Arc::new(ThreadPoolDispatcher::new(
        DispatcherConfig::new("backend").with_workers(4, 8),
    )?);

    // Test 1: Everything beats a generous deadline
    println!("\n📊 Test 1: Full dashboard within a 2500 ms deadline");
    let relaxed = ScatterGather::new(
        GatherConfig::new("dashboard").with_deadline(Duration::from_millis(2500)),
        dispatcher.clone(),
    )?;

    let start = Instant::now();
    let outcome = relaxed.run(backend_lookups())?;
    println!(
        "  ✅ complete={} after {:?}",
        outcome.all_completed(),
        start.elapsed()
    );
    for entry in outcome.results().iter() {
        match entry.value() {
            Ok(value) => println!("    📋 {} = {}", entry.key(), value),
            Err(failure) => println!("    ❌ {} failed: {}", entry.key(), failure),
        }
    }

    // Test 2: A tight deadline keeps the fast lookups only
    println!("\n📊 Test 2: Partial dashboard at a 1200 ms deadline");
    let tight = ScatterGather::new(
        GatherConfig::new("dashboard-tight").with_deadline(Duration::from_millis(1200)),
        dispatcher.clone(),
    )?;

    let outcome = tight.run(backend_lookups())?;
    println!(
        "  ⏰ complete={}, {} of 3 lookups made it",
        outcome.all_completed(),
        outcome.len()
    );

    // The slow lookup was not cancelled; it lands in the same map later.
    while !outcome.contains("news") {
        thread::sleep(Duration::from_millis(50));
    }
    println!("  🐢 straggler arrived after the response went out: news = ok");

    // Test 3: All-or-nothing discards the batch on any failure
    println!("\n📊 Test 3: All-or-nothing with a failing backend");
    let strict = ScatterGather::new(
        GatherConfig::new("dashboard-strict").with_policy(JoinPolicy::AllOrNothing),
        dispatcher.clone(),
    )?;

    let tasks = Subtasks::new()
        .task("weather", || Ok::<_, &str>("22C".to_string()))
        .task("billing", || Err::<String, _>("backend 500"));
    match strict.run(tasks) {
        Ok(_) => println!("  ❌ unexpected success"),
        Err(error) => println!("  ✅ batch discarded: {}", error),
    }

    // Test 4: The admission gate sheds the third concurrent build
    println!("\n📊 Test 4: Admission gate with two permits");
    let gate = Arc::new(AdmissionGate::new("dashboard", 2));
    let inside = Arc::new(CountdownLatch::new(2));
    let release = Arc::new(CountdownLatch::new(1));

    let builders: Vec<_> = (0..2)
        .map(|i| {
            let gate = Arc::clone(&gate);
            let inside = Arc::clone(&inside);
            let release = Arc::clone(&release);
            thread::spawn(move || {
                gate.admit(|| {
                    println!("  🔄 build {} holding a permit", i);
                    inside.count_down();
                    release.wait();
                })
            })
        })
        .collect();

    inside.wait();
    match gate.admit(|| "third build") {
        Err(StanchionError::Overloaded { capacity, .. }) => {
            println!("  🚫 third build rejected (capacity {})", capacity);
        }
        other => println!("  ❌ expected rejection, got {:?}", other.is_ok()),
    }
    release.count_down();
    for builder in builders {
        builder.join().unwrap()?;
    }

    let stats = gate.stats();
    println!(
        "  📊 gate stats: admitted={}, rejected={}, available={}",
        stats.admitted, stats.rejected, stats.available
    );

    // Summary
    let dispatcher_stats = dispatcher.stats();
    println!("\n🎉 Demo complete");
    println!(
        "   ⚙️  dispatcher: executed={}, caller_runs={}, rejected={}",
        dispatcher_stats.executed, dispatcher_stats.caller_runs, dispatcher_stats.rejected
    );
    println!(
        "   📈 tight aggregator: batches={}, deadline_exits={}",
        tight.stats().batches,
        tight.stats().deadline_exits
    );
    dispatcher.shutdown();
    Ok(())
}
