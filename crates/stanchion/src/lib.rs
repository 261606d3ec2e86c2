//! # Stanchion
//!
//! In-process concurrency-coordination primitives for request-handling
//! services: share a fixed set of expensive resources, shed excess load
//! before it queues, fan slow lookups out and join them under a deadline,
//! and count events without lock contention.
//!
//! ## Primitives
//!
//! - **[`ResourcePool`]**: blocking checkout of a fixed resource set with RAII return
//! - **[`AdmissionGate`]**: non-blocking bulkhead admission with scoped permits
//! - **[`ScatterGather`]**: named-subtask fan-out with best-effort or all-or-nothing joins
//! - **[`CountdownLatch`]**: blocking join point for a known number of events
//! - **[`StatCounter`]**: wait-free operational counters
//! - **[`ThreadPoolDispatcher`]**: bounded-queue work substrate with a named overflow policy
//!
//! Everything blocks OS threads; there is no async runtime and no event
//! loop. The aggregator consumes its substrate through the [`Dispatch`]
//! trait, so any thread source that can run a boxed job plugs in.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::convert::Infallible;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use stanchion::prelude::*;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Share three connections among any number of threads.
//!     let pool = ResourcePool::new("db", vec!["conn-a", "conn-b", "conn-c"]);
//!     let conn = pool.acquire(Duration::from_millis(250))?;
//!     assert_eq!(pool.available(), 2);
//!     drop(conn); // returned on every exit path
//!
//!     // Admit at most two concurrent dashboard builds; reject the rest.
//!     let gate = AdmissionGate::new("dashboard", 2);
//!     let summary = gate.admit(|| "rendered")?;
//!     assert_eq!(summary, "rendered");
//!
//!     // Fan two lookups out and keep whatever beats the deadline.
//!     let dispatcher = Arc::new(ThreadPoolDispatcher::with_defaults()?);
//!     let gather = ScatterGather::new(
//!         GatherConfig::new("dashboard").with_deadline(Duration::from_millis(500)),
//!         dispatcher,
//!     )?;
//!     let outcome = gather.run(
//!         Subtasks::new()
//!             .task("weather", || Ok::<_, Infallible>("sunny"))
//!             .task("traffic", || Ok::<_, Infallible>("light")),
//!     )?;
//!     assert!(outcome.all_completed());
//!     assert!(outcome.contains("weather"));
//!     Ok(())
//! }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Shared support types
pub mod config;
pub mod counter;
pub mod error;

// Blocking coordination primitives
pub mod latch;
pub mod pool;

// Admission control
pub mod gate;

// Work dispatch and aggregation
pub mod dispatch;
pub mod gather;

// Public API - errors and configuration
pub use config::{ConfigError, ConfigResult};
pub use error::{
    ErrorClass, FailureKind, ReleaseViolation, StanchionError, StanchionResult, TaskFailure,
};

// Public API - primitives
pub use counter::StatCounter;
pub use gate::{AdmissionGate, GatePermit, GateStats};
pub use latch::CountdownLatch;
pub use pool::{PoolConfig, PoolStats, PooledResource, ResourcePool, WaitStrategy};

// Public API - dispatch substrate and aggregation
pub use dispatch::{
    Dispatch, DispatchExt, DispatcherConfig, DispatcherStats, InlineDispatcher, Job,
    OverflowPolicy, TaskHandle, ThreadPoolDispatcher,
};
pub use gather::{GatherConfig, GatherOutcome, GatherStats, JoinPolicy, ScatterGather, Subtasks};

/// Common imports for working with the toolkit.
pub mod prelude {
    pub use crate::counter::StatCounter;
    pub use crate::dispatch::{Dispatch, DispatchExt, ThreadPoolDispatcher};
    pub use crate::error::{StanchionError, StanchionResult};
    pub use crate::gate::AdmissionGate;
    pub use crate::gather::{GatherConfig, JoinPolicy, ScatterGather, Subtasks};
    pub use crate::latch::CountdownLatch;
    pub use crate::pool::{PoolConfig, ResourcePool, WaitStrategy};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
