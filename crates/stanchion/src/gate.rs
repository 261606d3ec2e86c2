//! Admission gate: a non-blocking bulkhead over an atomic permit count.

use std::sync::atomic::{AtomicU32, Ordering};

use tracing::{debug, trace};

use crate::counter::StatCounter;
use crate::error::{StanchionError, StanchionResult};

/// A non-blocking admission gate guarding a bounded-concurrency section.
///
/// The gate holds `capacity` permits in a single atomic cell. Callers take a
/// permit with [`try_acquire`](Self::try_acquire), which either succeeds
/// immediately or fails immediately; nobody ever queues. Rejected callers get
/// a distinct overload signal so transports can answer with "shed load" (the
/// bulkhead pattern) instead of stalling the caller.
///
/// Permits are restored by dropping the returned [`GatePermit`], which makes
/// release happen on every exit path of the guarded section, panics
/// included. The permit count therefore never leaves `0..=capacity`.
///
/// The gate takes no lock anywhere and is safe to call from any thread,
/// including while the holder of a pool lock is blocked elsewhere.
#[derive(Debug)]
pub struct AdmissionGate {
    name: String,
    capacity: u32,
    permits: AtomicU32,
    admitted: StatCounter,
    rejected: StatCounter,
}

impl AdmissionGate {
    /// Creates a gate with `capacity` permits.
    ///
    /// A zero-capacity gate is legal and rejects every caller; services use
    /// that as a drain/maintenance switch.
    #[must_use]
    pub fn new(name: impl Into<String>, capacity: u32) -> Self {
        Self {
            name: name.into(),
            capacity,
            permits: AtomicU32::new(capacity),
            admitted: StatCounter::new(),
            rejected: StatCounter::new(),
        }
    }

    /// Attempts to take a permit without blocking.
    ///
    /// Returns `None` when no permit is available; the gate's state is left
    /// unchanged. This never suspends the calling thread: the entire
    /// operation is one CAS loop over the permit cell.
    #[must_use = "the permit releases on drop; bind it for the guarded section"]
    pub fn try_acquire(&self) -> Option<GatePermit<'_>> {
        let mut available = self.permits.load(Ordering::Acquire);
        loop {
            if available == 0 {
                self.rejected.increment();
                debug!(gate = %self.name, capacity = self.capacity, "admission rejected");
                return None;
            }
            match self.permits.compare_exchange_weak(
                available,
                available - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.admitted.increment();
                    trace!(gate = %self.name, remaining = available - 1, "admitted");
                    return Some(GatePermit { gate: self });
                }
                Err(actual) => available = actual,
            }
        }
    }

    /// Runs `operation` under a permit, or reports overload without running
    /// it.
    ///
    /// The permit is held for exactly the duration of `operation` and is
    /// restored even if `operation` panics.
    pub fn admit<T>(&self, operation: impl FnOnce() -> T) -> StanchionResult<T> {
        match self.try_acquire() {
            Some(_permit) => Ok(operation()),
            None => Err(StanchionError::overloaded(&self.name, self.capacity)),
        }
    }

    /// Permits currently available; possibly stale once returned.
    #[must_use]
    pub fn remaining_permits(&self) -> u32 {
        self.permits.load(Ordering::Acquire)
    }

    /// Callers currently inside the guarded section.
    #[must_use]
    pub fn in_flight(&self) -> u32 {
        self.capacity - self.remaining_permits()
    }

    /// Total permit count.
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Whether every permit is currently taken.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.remaining_permits() == 0
    }

    /// Configured gate name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Snapshot of gate statistics.
    #[must_use]
    pub fn stats(&self) -> GateStats {
        let available = self.remaining_permits();
        GateStats {
            capacity: self.capacity,
            available,
            in_flight: self.capacity - available,
            admitted: self.admitted.get(),
            rejected: self.rejected.get(),
        }
    }

    fn release_permit(&self) {
        let previous = self.permits.fetch_add(1, Ordering::Release);
        debug_assert!(
            previous < self.capacity,
            "gate '{}': more releases than acquires",
            self.name
        );
    }
}

/// Proof of admission; restores its permit on drop.
#[must_use = "the permit releases on drop; bind it for the guarded section"]
#[derive(Debug)]
pub struct GatePermit<'a> {
    gate: &'a AdmissionGate,
}

impl GatePermit<'_> {
    /// The gate this permit belongs to.
    #[must_use]
    pub fn gate(&self) -> &AdmissionGate {
        self.gate
    }
}

impl Drop for GatePermit<'_> {
    fn drop(&mut self) {
        self.gate.release_permit();
    }
}

/// Snapshot of gate statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateStats {
    /// Total permit count.
    pub capacity: u32,
    /// Permits available at snapshot time.
    pub available: u32,
    /// Callers inside the guarded section at snapshot time.
    pub in_flight: u32,
    /// Successful admissions so far.
    pub admitted: i64,
    /// Rejections so far.
    pub rejected: i64,
}
