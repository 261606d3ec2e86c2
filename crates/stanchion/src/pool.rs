//! Bounded blocking resource pool.
//!
//! A fixed set of resources is created up front and shared among callers:
//! [`ResourcePool::acquire`] blocks (with a deadline) until a resource is
//! free, and the returned [`PooledResource`] guard puts it back on drop, on
//! every exit path. Resources are never created or destroyed after
//! construction; the pool only moves them between "free" and "checked out".
//!
//! One mutex guards the free list and the borrow count; everything the pool
//! knows about its own state is read or written under that lock. Waiting is
//! done on a condition variable with the classic predicate loop: a wakeup
//! only means "the free list may be non-empty now", so the guard re-checks
//! and goes back to sleep when another thread won the race.

use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace};

use crate::config::{ConfigError, ConfigResult, validate_name};
use crate::counter::StatCounter;
use crate::error::{ReleaseViolation, StanchionError, StanchionResult};

/// How the pool wakes blocked acquirers when a resource comes back.
///
/// Both strategies are correct (neither can lose a wakeup, because every
/// waiter re-checks the free list under the lock); they differ in how many
/// threads wake up per release under contention.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WaitStrategy {
    /// Wake exactly one waiter per release.
    ///
    /// The release signals only the condition whose predicate it changed, so
    /// at most one thread contends for the returned resource.
    #[default]
    SeparateConditions,
    /// Wake every waiter per release and let each re-check the predicate.
    ///
    /// One shared wait set, broadcast on release. Correct but produces
    /// thundering-herd wakeups under load; exists because some deployments
    /// prefer the simpler single-wait-set discipline.
    SingleWaitSet,
}

/// Pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Name used in log events and errors.
    pub name: String,
    /// Fixed number of resources the pool holds.
    pub capacity: usize,
    /// Wakeup discipline for blocked acquirers.
    #[serde(default)]
    pub wait_strategy: WaitStrategy,
}

impl PoolConfig {
    /// Creates a config with the default wait strategy.
    #[must_use]
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity,
            wait_strategy: WaitStrategy::default(),
        }
    }

    /// Sets the wait strategy.
    #[must_use]
    pub fn with_wait_strategy(mut self, strategy: WaitStrategy) -> Self {
        self.wait_strategy = strategy;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        validate_name(&self.name)?;
        if self.capacity == 0 {
            return Err(ConfigError::field("capacity", "must be greater than 0"));
        }
        Ok(())
    }
}

struct PoolInner<T> {
    free: VecDeque<T>,
    outstanding: usize,
}

/// A bounded blocking pool of homogeneous resources.
///
/// Invariant, readable under the pool's lock at any quiescent instant:
/// `free.len() + outstanding == capacity`.
///
/// Acquisition order is whatever the free list yields; no FIFO fairness
/// among waiters is guaranteed. Callers that need strict admission order
/// must layer an explicit ticket queue on top.
pub struct ResourcePool<T> {
    config: PoolConfig,
    inner: Mutex<PoolInner<T>>,
    not_empty: Condvar,
    acquires: StatCounter,
    timeouts: StatCounter,
    returns: StatCounter,
}

impl<T> ResourcePool<T> {
    /// Creates a pool holding exactly the given resources.
    ///
    /// Capacity is `resources.len()` and the wait strategy is the default.
    /// Use [`with_config`](Self::with_config) when the strategy or validated
    /// construction matters.
    pub fn new(name: impl Into<String>, resources: Vec<T>) -> Self {
        let config = PoolConfig::new(name, resources.len());
        Self {
            inner: Mutex::new(PoolInner {
                free: VecDeque::from(resources),
                outstanding: 0,
            }),
            not_empty: Condvar::new(),
            acquires: StatCounter::new(),
            timeouts: StatCounter::new(),
            returns: StatCounter::new(),
            config,
        }
    }

    /// Creates a pool from a validated configuration.
    ///
    /// Fails if the config is invalid or if `resources.len()` does not match
    /// `config.capacity`.
    pub fn with_config(config: PoolConfig, resources: Vec<T>) -> StanchionResult<Self> {
        config.validate()?;
        if resources.len() != config.capacity {
            return Err(ConfigError::field(
                "capacity",
                format!(
                    "expected {} resources, got {}",
                    config.capacity,
                    resources.len()
                ),
            )
            .into());
        }
        Ok(Self {
            inner: Mutex::new(PoolInner {
                free: VecDeque::from(resources),
                outstanding: 0,
            }),
            not_empty: Condvar::new(),
            acquires: StatCounter::new(),
            timeouts: StatCounter::new(),
            returns: StatCounter::new(),
            config,
        })
    }

    /// Borrows a resource, blocking up to `timeout` for one to come free.
    ///
    /// Returns [`StanchionError::Timeout`] when the deadline passes with the
    /// free list still empty; the pool's lock is released before the error
    /// surfaces. The wait re-checks the free list on every wakeup, so
    /// spurious or raced wakeups simply go back to sleep against the
    /// original deadline. A `timeout` too large for the monotonic clock to
    /// represent is treated as an indefinite wait.
    pub fn acquire(&self, timeout: Duration) -> StanchionResult<PooledResource<'_, T>> {
        // Request counting is lock-free and happens whether or not the
        // caller ends up waiting.
        self.acquires.increment();
        let started = Instant::now();
        let deadline = started.checked_add(timeout);

        let mut inner = self.inner.lock();
        loop {
            if let Some(value) = Self::checkout(&mut inner) {
                let available = inner.free.len();
                drop(inner);
                trace!(pool = %self.config.name, available, "resource checked out");
                return Ok(PooledResource {
                    pool: self,
                    value: Some(value),
                });
            }

            let timed_out = match deadline {
                Some(deadline) => self.not_empty.wait_until(&mut inner, deadline).timed_out(),
                None => {
                    self.not_empty.wait(&mut inner);
                    false
                }
            };
            if timed_out {
                // A release may have signalled in the same instant the wait
                // timed out; prefer the resource over the error.
                if let Some(value) = Self::checkout(&mut inner) {
                    drop(inner);
                    trace!(pool = %self.config.name, "resource checked out at deadline");
                    return Ok(PooledResource {
                        pool: self,
                        value: Some(value),
                    });
                }
                drop(inner);
                self.timeouts.increment();
                let waited = started.elapsed();
                debug!(pool = %self.config.name, ?waited, "acquire timed out");
                return Err(StanchionError::timeout(
                    waited,
                    format!("pool '{}' acquire", self.config.name),
                ));
            }
        }
    }

    /// Borrows a resource only if one is free right now.
    pub fn try_acquire(&self) -> Option<PooledResource<'_, T>> {
        self.acquires.increment();
        let mut inner = self.inner.lock();
        let value = Self::checkout(&mut inner)?;
        drop(inner);
        trace!(pool = %self.config.name, "resource checked out");
        Some(PooledResource {
            pool: self,
            value: Some(value),
        })
    }

    /// Returns a previously [detached](PooledResource::detach) resource.
    ///
    /// The pool cannot distinguish one value of `T` from another, so the
    /// protocol is checked structurally: a release while nothing is checked
    /// out, or one that would push the free list past capacity, is reported
    /// as [`StanchionError::InvalidRelease`]. A rejected value never lands
    /// in the free list.
    pub fn release(&self, value: T) -> StanchionResult<()> {
        match self.return_value(value) {
            Ok(()) => Ok(()),
            Err((_value, violation)) => {
                error!(pool = %self.config.name, %violation, "invalid release");
                Err(StanchionError::invalid_release(
                    &self.config.name,
                    violation,
                ))
            }
        }
    }

    /// Free resources right now; possibly stale once returned.
    #[must_use]
    pub fn available(&self) -> usize {
        self.inner.lock().free.len()
    }

    /// Resources currently checked out; possibly stale once returned.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.inner.lock().outstanding
    }

    /// Fixed pool capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// Configured pool name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Wakeup discipline in use.
    #[must_use]
    pub fn wait_strategy(&self) -> WaitStrategy {
        self.config.wait_strategy
    }

    /// Snapshot of pool statistics.
    ///
    /// `available` and `outstanding` are read under one lock acquisition, so
    /// they always satisfy the pool invariant even mid-churn.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        PoolStats {
            capacity: self.config.capacity,
            available: inner.free.len(),
            outstanding: inner.outstanding,
            acquires: self.acquires.get(),
            timeouts: self.timeouts.get(),
            returns: self.returns.get(),
        }
    }

    fn checkout(inner: &mut PoolInner<T>) -> Option<T> {
        let value = inner.free.pop_front()?;
        inner.outstanding += 1;
        Some(value)
    }

    /// Puts a value back and wakes waiters per the configured strategy.
    ///
    /// On violation the value is handed back to the caller untouched.
    fn return_value(&self, value: T) -> Result<(), (T, ReleaseViolation)> {
        let mut inner = self.inner.lock();
        if inner.outstanding == 0 {
            return Err((value, ReleaseViolation::NothingBorrowed));
        }
        if inner.free.len() >= self.config.capacity {
            return Err((value, ReleaseViolation::AtCapacity));
        }
        inner.outstanding -= 1;
        inner.free.push_back(value);
        match self.config.wait_strategy {
            WaitStrategy::SeparateConditions => {
                self.not_empty.notify_one();
            }
            WaitStrategy::SingleWaitSet => {
                self.not_empty.notify_all();
            }
        }
        drop(inner);
        self.returns.increment();
        trace!(pool = %self.config.name, "resource returned");
        Ok(())
    }
}

impl<T> fmt::Debug for ResourcePool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePool")
            .field("name", &self.config.name)
            .field("capacity", &self.config.capacity)
            .field("wait_strategy", &self.config.wait_strategy)
            .finish_non_exhaustive()
    }
}

impl<T> Drop for ResourcePool<T> {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if inner.outstanding > 0 {
            // Only reachable when detached resources were never released;
            // guards borrow the pool and cannot outlive it.
            error!(
                pool = %self.config.name,
                outstanding = inner.outstanding,
                "pool destroyed with resources still checked out"
            );
        }
    }
}

/// A borrowed resource; returns itself to the pool on drop.
///
/// Dereferences to the pooled value. Dropping the guard is the normal
/// release path and runs on every exit from the borrowing scope, panics
/// included. [`detach`](Self::detach) opts out of that and shifts the
/// obligation to call [`ResourcePool::release`] onto the caller.
#[must_use = "the resource returns to the pool on drop; bind it while in use"]
pub struct PooledResource<'a, T> {
    pool: &'a ResourcePool<T>,
    value: Option<T>,
}

impl<'a, T> PooledResource<'a, T> {
    /// The pool this resource belongs to.
    #[must_use]
    pub fn pool(&self) -> &'a ResourcePool<T> {
        self.pool
    }

    /// Takes the value out of the guard without returning it to the pool.
    ///
    /// The resource stays counted as checked out until the caller hands it
    /// back through [`ResourcePool::release`]. Losing the value instead is a
    /// caller error and is reported when the pool is destroyed.
    #[must_use]
    pub fn detach(mut self) -> T {
        self.value
            .take()
            .expect("pooled value present until drop or detach")
    }
}

impl<T> fmt::Debug for PooledResource<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledResource")
            .field("pool", &self.pool.config.name)
            .finish_non_exhaustive()
    }
}

impl<T> Deref for PooledResource<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.value {
            Some(value) => value,
            None => unreachable!("pooled value present until drop or detach"),
        }
    }
}

impl<T> DerefMut for PooledResource<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.value {
            Some(value) => value,
            None => unreachable!("pooled value present until drop or detach"),
        }
    }
}

impl<T> Drop for PooledResource<'_, T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            if let Err((_, violation)) = self.pool.return_value(value) {
                // Unreachable unless the caller broke the detach/release
                // protocol elsewhere and consumed this guard's borrow count.
                debug_assert!(
                    false,
                    "pool '{}': guard return failed: {violation}",
                    self.pool.config.name
                );
                error!(
                    pool = %self.pool.config.name,
                    %violation,
                    "guard return failed"
                );
            }
        }
    }
}

/// Snapshot of pool statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Fixed pool capacity.
    pub capacity: usize,
    /// Free resources at snapshot time.
    pub available: usize,
    /// Checked-out resources at snapshot time.
    pub outstanding: usize,
    /// Acquire attempts so far (including timeouts).
    pub acquires: i64,
    /// Acquire timeouts so far.
    pub timeouts: i64,
    /// Successful returns so far.
    pub returns: i64,
}
