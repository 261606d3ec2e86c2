//! Work-dispatch substrate: the trait the aggregator consumes, a typed
//! join handle, and a fixed thread-pool implementation.
//!
//! The core primitives never own the threads that run fanned-out work; they
//! hand jobs to a [`Dispatch`] implementation and join through their own
//! latches or through [`TaskHandle`]. [`ThreadPoolDispatcher`] is the
//! reference substrate: a bounded queue in front of a fixed set of core
//! workers, transient workers up to a ceiling, and a named overflow policy.
//! Under [`OverflowPolicy::CallerRuns`] a saturated dispatcher pushes work
//! back onto the submitting thread, which is why nothing in this crate
//! submits while holding a lock another primitive needs.

use std::any::Any;
use std::collections::VecDeque;
use std::mem;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::config::{ConfigError, ConfigResult, validate_name};
use crate::counter::StatCounter;
use crate::error::{StanchionError, StanchionResult, TaskFailure};

/// A unit of work handed to a dispatcher.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Something that can run jobs on its own threads.
///
/// `execute` is fire-and-forget and infallible from the caller's point of
/// view: what happens to a job the substrate cannot run right now is the
/// substrate's configured policy (queue it, run it on the submitting
/// thread, or drop it). Callers that need completion signals attach them to
/// the job itself, either via [`DispatchExt::submit`] or via their own
/// completion guards.
pub trait Dispatch: Send + Sync {
    /// Runs or schedules `job`.
    fn execute(&self, job: Job);
}

/// Typed submission on top of any [`Dispatch`].
pub trait DispatchExt: Dispatch {
    /// Submits `work` and returns a handle to await its outcome.
    ///
    /// Panics inside `work` are caught and surface as a
    /// [`TaskFailure`]-carrying error on join, never as a dispatcher crash.
    fn submit<R, F>(&self, name: impl Into<String>, work: F) -> TaskHandle<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let name = name.into();
        let (tx, rx) = mpsc::sync_channel(1);
        let job: Job = Box::new(move || {
            let outcome = catch_unwind(AssertUnwindSafe(work))
                .map_err(|payload| TaskFailure::panicked(panic_message(payload.as_ref())));
            // The receiver may have given up; that is its business.
            let _ = tx.send(outcome);
        });
        self.execute(job);
        TaskHandle { name, rx }
    }
}

impl<D: Dispatch + ?Sized> DispatchExt for D {}

/// Handle to one submitted unit of work.
///
/// Joining consumes the handle. A handle whose job was dropped before
/// running (rejected or submitted after shutdown) reports cancellation.
#[must_use = "a handle that is never joined discards the task outcome"]
#[derive(Debug)]
pub struct TaskHandle<R> {
    name: String,
    rx: mpsc::Receiver<Result<R, TaskFailure>>,
}

impl<R> TaskHandle<R> {
    /// Name the task was submitted under.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Blocks until the task completes.
    pub fn join(self) -> StanchionResult<R> {
        match self.rx.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(failure)) => Err(StanchionError::task_failed(self.name, failure)),
            Err(_) => Err(StanchionError::cancelled(format!(
                "task '{}' was dropped before completion",
                self.name
            ))),
        }
    }

    /// Blocks until the task completes or `timeout` elapses.
    ///
    /// Timing out does not cancel the task; it keeps running on the
    /// substrate and its outcome is discarded.
    pub fn join_for(self, timeout: Duration) -> StanchionResult<R> {
        match self.rx.recv_timeout(timeout) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(failure)) => Err(StanchionError::task_failed(self.name, failure)),
            Err(RecvTimeoutError::Timeout) => Err(StanchionError::timeout(
                timeout,
                format!("task '{}' join", self.name),
            )),
            Err(RecvTimeoutError::Disconnected) => Err(StanchionError::cancelled(format!(
                "task '{}' was dropped before completion",
                self.name
            ))),
        }
    }
}

/// What a saturated dispatcher does with one more job.
///
/// Saturated means the queue is full and the worker ceiling is reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Run the job inline on the submitting thread.
    ///
    /// Backpressure by occupation: the submitter cannot submit faster than
    /// it can execute. Submitters must not hold locks that the job (or
    /// anything waiting on the job) needs.
    #[default]
    CallerRuns,
    /// Drop the job with a warning.
    ///
    /// Any completion guard inside the job fires on drop, so joins observe
    /// a cancellation instead of hanging.
    Reject,
}

/// Dispatcher configuration.
///
/// The defaults mirror a common service executor profile: 10 core workers,
/// growth to 30 under load, a queue of 20 and caller-runs overflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Name used for worker threads and log events.
    pub name: String,
    /// Workers spawned at construction and kept for the dispatcher's life.
    pub core_workers: usize,
    /// Ceiling on live workers (core plus transient).
    pub max_workers: usize,
    /// Idle time after which a transient worker exits.
    #[cfg_attr(feature = "humantime", serde(with = "humantime_serde"))]
    pub keep_alive: Duration,
    /// Jobs the queue holds before the dispatcher grows or overflows.
    pub queue_capacity: usize,
    /// Behavior once the queue is full and the worker ceiling is reached.
    #[serde(default)]
    pub overflow: OverflowPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            name: "dispatcher".to_string(),
            core_workers: 10,
            max_workers: 30,
            keep_alive: Duration::from_secs(10),
            queue_capacity: 20,
            overflow: OverflowPolicy::CallerRuns,
        }
    }
}

impl DispatcherConfig {
    /// Creates a config with the default sizing under a custom name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Sets core and maximum worker counts.
    #[must_use]
    pub fn with_workers(mut self, core: usize, max: usize) -> Self {
        self.core_workers = core;
        self.max_workers = max;
        self
    }

    /// Sets the queue capacity.
    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Sets the overflow policy.
    #[must_use]
    pub fn with_overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }

    /// Sets the transient-worker idle timeout.
    #[must_use]
    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        validate_name(&self.name)?;
        if self.core_workers == 0 {
            return Err(ConfigError::field("core_workers", "must be greater than 0"));
        }
        if self.max_workers < self.core_workers {
            return Err(ConfigError::field(
                "max_workers",
                "must be at least core_workers",
            ));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::field(
                "queue_capacity",
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

struct QueueState {
    jobs: VecDeque<Job>,
    /// Join handles for every spawned worker. Kept under the queue lock so
    /// shutdown takes the roster in the same critical section that sets the
    /// `shutdown` flag; a spawn racing it sees the flag when it registers.
    workers: Vec<JoinHandle<()>>,
    live_workers: usize,
    shutdown: bool,
}

struct Shared {
    config: DispatcherConfig,
    queue: Mutex<QueueState>,
    not_empty: Condvar,
    next_worker_id: AtomicUsize,
    busy: StatCounter,
    executed: StatCounter,
    panicked: StatCounter,
    rejected: StatCounter,
    caller_runs: StatCounter,
}

impl Shared {
    /// Runs one job on a worker thread, tracking it in the busy gauge.
    fn run_job(&self, job: Job) {
        self.busy.increment();
        self.run_isolated(job);
        self.busy.decrement();
    }

    /// Runs one job, isolating the calling thread from its panics.
    ///
    /// Caller-runs overflow takes this path directly: the submitting thread
    /// is not a worker, so it never touches the busy gauge.
    fn run_isolated(&self, job: Job) {
        match catch_unwind(AssertUnwindSafe(job)) {
            Ok(()) => self.executed.increment(),
            Err(payload) => {
                self.panicked.increment();
                error!(
                    dispatcher = %self.config.name,
                    panic = %panic_message(payload.as_ref()),
                    "job panicked"
                );
            }
        }
    }
}

/// Fixed thread-pool dispatcher with a bounded queue.
///
/// Submission order on a busy dispatcher: queue the job if the queue has
/// room; otherwise spawn a transient worker seeded with the job while under
/// the worker ceiling; otherwise apply the configured [`OverflowPolicy`].
/// Transient workers exit after `keep_alive` of idleness; core workers live
/// until shutdown.
///
/// Dropping the dispatcher shuts it down: intake stops, queued jobs drain,
/// and every worker is joined.
pub struct ThreadPoolDispatcher {
    shared: Arc<Shared>,
}

impl ThreadPoolDispatcher {
    /// Creates a dispatcher and spawns its core workers.
    pub fn new(config: DispatcherConfig) -> StanchionResult<Self> {
        config.validate()?;
        let core_workers = config.core_workers;
        let shared = Arc::new(Shared {
            queue: Mutex::new(QueueState {
                jobs: VecDeque::with_capacity(config.queue_capacity),
                workers: Vec::with_capacity(core_workers),
                live_workers: core_workers,
                shutdown: false,
            }),
            not_empty: Condvar::new(),
            next_worker_id: AtomicUsize::new(0),
            busy: StatCounter::new(),
            executed: StatCounter::new(),
            panicked: StatCounter::new(),
            rejected: StatCounter::new(),
            caller_runs: StatCounter::new(),
            config,
        });
        let dispatcher = Self { shared };
        for _ in 0..core_workers {
            dispatcher.spawn_worker(None, false);
        }
        Ok(dispatcher)
    }

    /// Creates a dispatcher with the default configuration.
    pub fn with_defaults() -> StanchionResult<Self> {
        Self::new(DispatcherConfig::default())
    }

    /// Configured name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    /// Snapshot of dispatcher statistics.
    #[must_use]
    pub fn stats(&self) -> DispatcherStats {
        let queue = self.shared.queue.lock();
        DispatcherStats {
            queued: queue.jobs.len(),
            live_workers: queue.live_workers,
            busy_workers: self.shared.busy.get(),
            executed: self.shared.executed.get(),
            panicked: self.shared.panicked.get(),
            rejected: self.shared.rejected.get(),
            caller_runs: self.shared.caller_runs.get(),
        }
    }

    /// Stops intake, drains the queue and joins every worker.
    ///
    /// Idempotent. Jobs submitted after shutdown are dropped with a
    /// warning; completion guards inside them fire so joins never hang.
    pub fn shutdown(&self) {
        let workers = {
            let mut queue = self.shared.queue.lock();
            if queue.shutdown {
                return;
            }
            queue.shutdown = true;
            self.shared.not_empty.notify_all();
            mem::take(&mut queue.workers)
        };
        debug!(dispatcher = %self.shared.config.name, "shutting down");
        for worker in workers {
            let _ = worker.join();
        }
    }

    fn enqueue(&self, job: Job) {
        let mut queue = self.shared.queue.lock();
        if queue.shutdown {
            drop(queue);
            self.shared.rejected.increment();
            warn!(dispatcher = %self.shared.config.name, "job submitted after shutdown; dropping");
            drop(job);
            return;
        }
        if queue.jobs.len() < self.shared.config.queue_capacity {
            queue.jobs.push_back(job);
            self.shared.not_empty.notify_one();
            return;
        }
        if queue.live_workers < self.shared.config.max_workers {
            // Reserve the slot under the lock; the spawn happens outside it.
            queue.live_workers += 1;
            drop(queue);
            self.spawn_worker(Some(job), true);
            return;
        }
        drop(queue);
        match self.shared.config.overflow {
            OverflowPolicy::CallerRuns => {
                self.shared.caller_runs.increment();
                debug!(
                    dispatcher = %self.shared.config.name,
                    "saturated; running job on the submitting thread"
                );
                self.shared.run_isolated(job);
            }
            OverflowPolicy::Reject => {
                self.shared.rejected.increment();
                warn!(dispatcher = %self.shared.config.name, "saturated; rejecting job");
                drop(job);
            }
        }
    }

    fn spawn_worker(&self, seed: Option<Job>, transient: bool) {
        let shared = Arc::clone(&self.shared);
        let id = shared.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-worker-{id}", shared.config.name);
        // Same failure behavior as `thread::spawn`, which aborts on spawn
        // failure inside std; the builder only adds the thread name.
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || worker_loop(&shared, seed, transient))
            .expect("failed to spawn dispatcher worker thread");
        let mut queue = self.shared.queue.lock();
        if queue.shutdown {
            // Shutdown took the roster between this worker's slot
            // reservation and its registration. The worker runs its seed,
            // sees the flag and exits; joining it here keeps the contract
            // that every worker is joined.
            drop(queue);
            let _ = handle.join();
            return;
        }
        queue.workers.retain(|worker| !worker.is_finished());
        queue.workers.push(handle);
    }
}

impl Dispatch for ThreadPoolDispatcher {
    fn execute(&self, job: Job) {
        self.enqueue(job);
    }
}

impl Drop for ThreadPoolDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ThreadPoolDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPoolDispatcher")
            .field("name", &self.shared.config.name)
            .field("core_workers", &self.shared.config.core_workers)
            .field("max_workers", &self.shared.config.max_workers)
            .finish_non_exhaustive()
    }
}

fn worker_loop(shared: &Shared, seed: Option<Job>, transient: bool) {
    if let Some(job) = seed {
        shared.run_job(job);
    }
    let mut queue = shared.queue.lock();
    loop {
        if let Some(job) = queue.jobs.pop_front() {
            drop(queue);
            shared.run_job(job);
            queue = shared.queue.lock();
            continue;
        }
        if queue.shutdown {
            break;
        }
        if transient {
            let timed_out = shared
                .not_empty
                .wait_for(&mut queue, shared.config.keep_alive)
                .timed_out();
            if timed_out && queue.jobs.is_empty() {
                break;
            }
        } else {
            shared.not_empty.wait(&mut queue);
        }
    }
    queue.live_workers -= 1;
}

/// Snapshot of dispatcher statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherStats {
    /// Jobs waiting in the queue at snapshot time.
    pub queued: usize,
    /// Workers alive at snapshot time (core plus transient).
    pub live_workers: usize,
    /// Workers executing a job at snapshot time. Jobs running on a
    /// submitting thread under caller-runs overflow are not counted.
    pub busy_workers: i64,
    /// Jobs completed without panicking so far.
    pub executed: i64,
    /// Jobs that panicked so far.
    pub panicked: i64,
    /// Jobs dropped (reject policy or post-shutdown submission) so far.
    pub rejected: i64,
    /// Jobs run on the submitting thread so far.
    pub caller_runs: i64,
}

/// Runs every job synchronously on the submitting thread.
///
/// The degenerate substrate: useful in tests and wherever deterministic
/// inline execution is wanted. Panics propagate to the submitter.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineDispatcher;

impl Dispatch for InlineDispatcher {
    fn execute(&self, job: Job) {
        job();
    }
}

/// Best-effort text from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "opaque panic payload".to_string()
    }
}
