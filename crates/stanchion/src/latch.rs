//! Countdown latch: a one-shot blocking join point.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// A one-shot countdown latch.
///
/// Starts at `count` and counts down toward zero; once zero is reached every
/// current and future waiter is released and the latch stays open. The latch
/// never resets.
///
/// The internal mutex orders a `count_down` caller's prior writes before any
/// waiter that observes the decrement, so work published immediately before
/// counting down (for example an insert into a shared result map) is visible
/// to the woken thread.
#[derive(Debug)]
pub struct CountdownLatch {
    remaining: Mutex<usize>,
    zero: Condvar,
}

impl CountdownLatch {
    /// Creates a latch that opens after `count` calls to
    /// [`count_down`](Self::count_down).
    ///
    /// A latch created with `count == 0` is already open.
    #[must_use]
    pub fn new(count: usize) -> Self {
        Self {
            remaining: Mutex::new(count),
            zero: Condvar::new(),
        }
    }

    /// Decrements the count, waking all waiters when zero is reached.
    ///
    /// Counting down an open latch is a no-op; the count saturates at zero.
    pub fn count_down(&self) {
        let mut remaining = self.remaining.lock();
        if *remaining == 0 {
            return;
        }
        *remaining -= 1;
        if *remaining == 0 {
            self.zero.notify_all();
        }
    }

    /// Blocks the calling thread until the count reaches zero.
    pub fn wait(&self) {
        let mut remaining = self.remaining.lock();
        while *remaining > 0 {
            self.zero.wait(&mut remaining);
        }
    }

    /// Blocks until the count reaches zero or `timeout` elapses.
    ///
    /// Returns `true` if the latch opened, `false` on timeout. Spurious
    /// wakeups re-check the count and resume waiting against the original
    /// deadline. A `timeout` too large for the monotonic clock to represent
    /// is treated as an indefinite wait, never an overflow.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.wait_until(deadline),
            None => {
                self.wait();
                true
            }
        }
    }

    /// Blocks until the count reaches zero or `deadline` passes.
    ///
    /// Returns `true` if the latch opened, `false` if the deadline passed
    /// first.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        let mut remaining = self.remaining.lock();
        while *remaining > 0 {
            if self.zero.wait_until(&mut remaining, deadline).timed_out() {
                return *remaining == 0;
            }
        }
        true
    }

    /// Current count; possibly stale by the time the caller looks at it.
    #[must_use]
    pub fn count(&self) -> usize {
        *self.remaining.lock()
    }
}
