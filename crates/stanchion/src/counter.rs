//! Wait-free operational counters.

use std::sync::atomic::{AtomicI64, Ordering};

/// A wait-free counter for operational statistics.
///
/// All operations are single atomic instructions on one cell, so they are
/// linearizable with respect to each other and never block. `get` returns a
/// value that existed at some point during the call and carries no
/// synchronizes-with relationship to any other state: this is a statistics
/// side-channel, not a coordination primitive. Code that needs a value
/// ordered against pool or gate state must read that state under its own
/// synchronization instead.
#[derive(Debug, Default)]
pub struct StatCounter(AtomicI64);

impl StatCounter {
    /// Creates a counter starting at zero.
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicI64::new(0))
    }

    /// Creates a counter starting at `value`.
    #[must_use]
    pub const fn with_value(value: i64) -> Self {
        Self(AtomicI64::new(value))
    }

    /// Adds one.
    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Subtracts one.
    pub fn decrement(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    /// Adds `n`.
    pub fn add(&self, n: i64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Subtracts `n`.
    pub fn sub(&self, n: i64) {
        self.0.fetch_sub(n, Ordering::Relaxed);
    }

    /// Current value; possibly stale by the time the caller looks at it.
    #[must_use]
    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }

    /// Resets to zero, returning the previous value.
    pub fn reset(&self) -> i64 {
        self.0.swap(0, Ordering::Relaxed)
    }
}
