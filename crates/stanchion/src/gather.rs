//! Scatter-gather aggregation: fan named subtasks out to a dispatch
//! substrate and join their results under a deadline.
//!
//! A batch is a set of uniquely named, independent units of work. The
//! aggregator submits each to its [`Dispatch`] substrate, then blocks on a
//! countdown latch until the batch completes or the deadline passes,
//! depending on the [`JoinPolicy`]. Results land in a concurrent map keyed
//! by subtask name; under [`JoinPolicy::BestEffort`] the caller may get the
//! map back while stragglers are still running, and those stragglers keep
//! writing into the same map.
//!
//! Every subtask carries a completion obligation: whether its work returns,
//! panics, or is dropped unrun by the substrate, the result map gains an
//! entry and the latch counts down. The join can time out, but it can never
//! hang on a subtask that will not report.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::config::{ConfigError, ConfigResult, validate_name};
use crate::counter::StatCounter;
use crate::dispatch::{Dispatch, Job, panic_message};
use crate::error::{StanchionError, StanchionResult, TaskFailure};
use crate::latch::CountdownLatch;

/// How the join decides when to hand control back to the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JoinPolicy {
    /// Return at the deadline with whatever completed by then.
    ///
    /// The outcome reports whether the whole batch made it. Stragglers are
    /// not cancelled and may still write into the shared result map after
    /// the caller has moved on.
    #[default]
    BestEffort,
    /// Wait for the whole batch, however long it takes.
    ///
    /// The configured deadline does not apply. If any subtask fails, the
    /// batch fails with the first failure observed in completion order and
    /// no partial map is returned.
    AllOrNothing,
}

/// Aggregator configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatherConfig {
    /// Name carried into log events.
    pub name: String,
    /// Join deadline under [`JoinPolicy::BestEffort`].
    #[cfg_attr(feature = "humantime", serde(with = "humantime_serde"))]
    pub deadline: Duration,
    /// Join policy for every batch this aggregator runs.
    #[serde(default)]
    pub policy: JoinPolicy,
}

impl Default for GatherConfig {
    fn default() -> Self {
        Self {
            name: "gather".to_string(),
            deadline: Duration::from_secs(2),
            policy: JoinPolicy::BestEffort,
        }
    }
}

impl GatherConfig {
    /// Creates a config with a 2 second deadline and best-effort joins.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Sets the best-effort join deadline.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Sets the join policy.
    #[must_use]
    pub fn with_policy(mut self, policy: JoinPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        validate_name(&self.name)?;
        if self.deadline.is_zero() {
            return Err(ConfigError::field("deadline", "must be greater than zero"));
        }
        Ok(())
    }
}

type SubtaskFn<T> = Box<dyn FnOnce() -> Result<T, TaskFailure> + Send + 'static>;

/// Builder for one batch of uniquely named subtasks.
///
/// Names are the keys of the result map. Adding a second subtask under an
/// existing name replaces the earlier work while keeping its position, so a
/// batch never dispatches two subtasks with the same key.
pub struct Subtasks<T> {
    tasks: IndexMap<String, SubtaskFn<T>>,
}

impl<T> Subtasks<T> {
    /// Creates an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tasks: IndexMap::new(),
        }
    }

    /// Adds a named subtask.
    ///
    /// The error type only needs to render itself; it is captured as the
    /// subtask's failure message.
    #[must_use]
    pub fn task<F, E>(mut self, name: impl Into<String>, work: F) -> Self
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        E: fmt::Display,
    {
        let erased: SubtaskFn<T> =
            Box::new(move || work().map_err(|error| TaskFailure::failed(error.to_string())));
        self.tasks.insert(name.into(), erased);
        self
    }

    /// Number of subtasks in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the batch is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Subtask names in insertion order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }
}

impl<T> Default for Subtasks<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Subtasks<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subtasks")
            .field("names", &self.tasks.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Shared state of one in-flight batch.
struct BatchState<T> {
    batch: String,
    results: DashMap<String, Result<T, TaskFailure>>,
    first_failure: OnceLock<(String, TaskFailure)>,
    latch: CountdownLatch,
}

/// Completion obligation for one subtask.
///
/// Consumed by `finish` when the work reports; the `Drop` impl covers jobs
/// the substrate drops without running, so the latch always counts down
/// exactly once per subtask.
struct Completion<T> {
    subtask: String,
    state: Arc<BatchState<T>>,
    done: bool,
}

impl<T> Completion<T> {
    fn finish(mut self, outcome: Result<T, TaskFailure>) {
        self.record(outcome);
        self.done = true;
    }

    fn record(&self, outcome: Result<T, TaskFailure>) {
        match &outcome {
            Ok(_) => {
                trace!(batch = %self.state.batch, subtask = %self.subtask, "subtask completed");
            }
            Err(failure) => {
                warn!(
                    batch = %self.state.batch,
                    subtask = %self.subtask,
                    %failure,
                    "subtask failed"
                );
                let _ = self
                    .state
                    .first_failure
                    .set((self.subtask.clone(), failure.clone()));
            }
        }
        self.state.results.insert(self.subtask.clone(), outcome);
    }
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        if !self.done {
            let failure =
                TaskFailure::cancelled("dropped by the dispatch substrate before running");
            warn!(
                batch = %self.state.batch,
                subtask = %self.subtask,
                "subtask never ran; recording cancellation"
            );
            let _ = self
                .state
                .first_failure
                .set((self.subtask.clone(), failure.clone()));
            self.state.results.insert(self.subtask.clone(), Err(failure));
        }
        self.state.latch.count_down();
    }
}

/// Scatter-gather aggregator over a dispatch substrate.
///
/// One aggregator is configured once and reused; each [`run`](Self::run)
/// call scatters an independent batch. The aggregator never runs subtask
/// work inline itself, though the substrate may under its own overflow
/// policy.
pub struct ScatterGather {
    config: GatherConfig,
    dispatch: Arc<dyn Dispatch>,
    batches: StatCounter,
    deadline_exits: StatCounter,
    failed_batches: StatCounter,
}

impl ScatterGather {
    /// Creates an aggregator over `dispatch`.
    pub fn new(config: GatherConfig, dispatch: Arc<dyn Dispatch>) -> StanchionResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            dispatch,
            batches: StatCounter::new(),
            deadline_exits: StatCounter::new(),
            failed_batches: StatCounter::new(),
        })
    }

    /// Configured name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Aggregator configuration.
    #[must_use]
    pub fn config(&self) -> &GatherConfig {
        &self.config
    }

    /// Snapshot of aggregator statistics.
    #[must_use]
    pub fn stats(&self) -> GatherStats {
        GatherStats {
            batches: self.batches.get(),
            deadline_exits: self.deadline_exits.get(),
            failed_batches: self.failed_batches.get(),
        }
    }

    /// Scatters `tasks` and joins their results under the configured policy.
    ///
    /// Under [`JoinPolicy::BestEffort`] this always returns `Ok`; the
    /// outcome says whether everything completed and the map holds exactly
    /// the subtasks that reported before the deadline. Under
    /// [`JoinPolicy::AllOrNothing`] it blocks until the whole batch reports
    /// and fails with the first observed failure, returning no partial map.
    ///
    /// An empty batch completes immediately.
    #[tracing::instrument(skip_all, fields(batch = %self.config.name, subtasks = tasks.len(), policy = ?self.config.policy))]
    pub fn run<T>(&self, tasks: Subtasks<T>) -> StanchionResult<GatherOutcome<T>>
    where
        T: Send + Sync + 'static,
    {
        let started = Instant::now();
        let total = tasks.len();
        self.batches.increment();
        let state = Arc::new(BatchState {
            batch: self.config.name.clone(),
            results: DashMap::with_capacity(total),
            first_failure: OnceLock::new(),
            latch: CountdownLatch::new(total),
        });

        for (name, work) in tasks.tasks {
            trace!(subtask = %name, "dispatching subtask");
            let guard = Completion {
                subtask: name,
                state: Arc::clone(&state),
                done: false,
            };
            let job: Job = Box::new(move || {
                let outcome = match catch_unwind(AssertUnwindSafe(work)) {
                    Ok(result) => result,
                    Err(payload) => Err(TaskFailure::panicked(panic_message(payload.as_ref()))),
                };
                guard.finish(outcome);
            });
            self.dispatch.execute(job);
        }

        match self.config.policy {
            JoinPolicy::BestEffort => {
                let all_completed = state.latch.wait_for(self.config.deadline);
                let elapsed = started.elapsed();
                if all_completed {
                    debug!(elapsed = ?elapsed, "batch completed");
                } else {
                    self.deadline_exits.increment();
                    warn!(
                        elapsed = ?elapsed,
                        completed = state.results.len(),
                        total,
                        "deadline reached with subtasks outstanding"
                    );
                }
                Ok(GatherOutcome {
                    all_completed,
                    elapsed,
                    state,
                })
            }
            JoinPolicy::AllOrNothing => {
                state.latch.wait();
                let elapsed = started.elapsed();
                if let Some((subtask, failure)) = state.first_failure.get() {
                    self.failed_batches.increment();
                    warn!(
                        elapsed = ?elapsed,
                        subtask = %subtask,
                        %failure,
                        "discarding batch after subtask failure"
                    );
                    return Err(StanchionError::aggregation(subtask.clone(), failure.clone()));
                }
                debug!(elapsed = ?elapsed, "batch completed");
                Ok(GatherOutcome {
                    all_completed: true,
                    elapsed,
                    state,
                })
            }
        }
    }
}

impl fmt::Debug for ScatterGather {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScatterGather")
            .field("name", &self.config.name)
            .field("deadline", &self.config.deadline)
            .field("policy", &self.config.policy)
            .finish_non_exhaustive()
    }
}

/// Joined result of one batch.
pub struct GatherOutcome<T> {
    all_completed: bool,
    elapsed: Duration,
    state: Arc<BatchState<T>>,
}

impl<T> GatherOutcome<T> {
    /// Whether every subtask reported before the join returned.
    #[must_use]
    pub fn all_completed(&self) -> bool {
        self.all_completed
    }

    /// Wall-clock time the join took.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// The live result map, keyed by subtask name.
    ///
    /// After a best-effort join that hit its deadline, stragglers still
    /// hold a reference to this map and insert their entries when they
    /// eventually report.
    #[must_use]
    pub fn results(&self) -> &DashMap<String, Result<T, TaskFailure>> {
        &self.state.results
    }

    /// Number of subtasks that have reported so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.results.len()
    }

    /// Whether no subtask has reported yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.results.is_empty()
    }

    /// Whether `name` has reported.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.state.results.contains_key(name)
    }
}

impl<T> fmt::Debug for GatherOutcome<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatherOutcome")
            .field("all_completed", &self.all_completed)
            .field("elapsed", &self.elapsed)
            .field("reported", &self.state.results.len())
            .finish()
    }
}

/// Snapshot of aggregator statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatherStats {
    /// Batches run so far.
    pub batches: i64,
    /// Best-effort joins that returned at the deadline with stragglers.
    pub deadline_exits: i64,
    /// All-or-nothing batches discarded after a subtask failure.
    pub failed_batches: i64,
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::thread;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::dispatch::{DispatcherConfig, InlineDispatcher, ThreadPoolDispatcher};
    use crate::error::FailureKind;

    fn inline() -> Arc<dyn Dispatch> {
        Arc::new(InlineDispatcher)
    }

    fn ok(value: i32) -> impl FnOnce() -> Result<i32, Infallible> {
        move || Ok(value)
    }

    #[test]
    fn config_defaults_and_validation() {
        let config = GatherConfig::default();
        assert_eq!(config.name, "gather");
        assert_eq!(config.deadline, Duration::from_secs(2));
        assert_eq!(config.policy, JoinPolicy::BestEffort);
        assert!(config.validate().is_ok());

        assert!(
            GatherConfig::new("g")
                .with_deadline(Duration::ZERO)
                .validate()
                .is_err()
        );
        assert!(GatherConfig::new("").validate().is_err());
    }

    #[test]
    fn join_policy_serde_uses_kebab_case() {
        let json = serde_json::to_string(&JoinPolicy::AllOrNothing).unwrap();
        assert_eq!(json, "\"all-or-nothing\"");
        let policy: JoinPolicy = serde_json::from_str("\"best-effort\"").unwrap();
        assert_eq!(policy, JoinPolicy::BestEffort);
    }

    #[test]
    fn empty_batch_completes_immediately() {
        let gather = ScatterGather::new(GatherConfig::new("empty"), inline()).unwrap();
        let outcome = gather.run(Subtasks::<i32>::new()).unwrap();
        assert!(outcome.all_completed());
        assert!(outcome.is_empty());
    }

    #[test]
    fn best_effort_collects_every_result() {
        let gather = ScatterGather::new(GatherConfig::new("dashboard"), inline()).unwrap();
        let tasks = Subtasks::new()
            .task("weather", ok(21))
            .task("traffic", ok(7))
            .task("news", ok(3));
        let outcome = gather.run(tasks).unwrap();

        assert!(outcome.all_completed());
        assert_eq!(outcome.len(), 3);
        assert_eq!(
            *outcome.results().get("weather").unwrap().value(),
            Ok(21),
        );
        assert!(outcome.contains("traffic"));
        assert!(outcome.contains("news"));
    }

    #[test]
    fn best_effort_records_failures_as_entries() {
        let gather = ScatterGather::new(GatherConfig::new("mixed"), inline()).unwrap();
        let tasks = Subtasks::new()
            .task("good", ok(1))
            .task("bad", || Err::<i32, _>("backend unavailable"));
        let outcome = gather.run(tasks).unwrap();

        assert!(outcome.all_completed());
        assert_eq!(outcome.len(), 2);
        let entry = outcome.results().get("bad").unwrap();
        let failure = entry.value().as_ref().unwrap_err();
        assert_eq!(failure.kind, FailureKind::Failed);
        assert_eq!(failure.message, "backend unavailable");
    }

    #[test]
    fn best_effort_deadline_leaves_stragglers_absent_then_they_land() {
        let dispatcher = Arc::new(
            ThreadPoolDispatcher::new(
                DispatcherConfig::new("gather-pool").with_workers(2, 2),
            )
            .unwrap(),
        );
        let config = GatherConfig::new("partial").with_deadline(Duration::from_millis(100));
        let gather = ScatterGather::new(config, dispatcher.clone()).unwrap();

        let release = Arc::new(CountdownLatch::new(1));
        let straggler_release = Arc::clone(&release);
        let tasks = Subtasks::new().task("fast", ok(1)).task("slow", move || {
            straggler_release.wait();
            Ok::<_, Infallible>(2)
        });
        let outcome = gather.run(tasks).unwrap();

        assert!(!outcome.all_completed());
        assert_eq!(outcome.len(), 1);
        assert!(outcome.contains("fast"));
        assert!(!outcome.contains("slow"));
        assert_eq!(gather.stats().deadline_exits, 1);

        // The straggler was not cancelled; once unblocked it writes into
        // the same map the caller already holds.
        release.count_down();
        let deadline = Instant::now() + Duration::from_secs(5);
        while outcome.len() < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(
            *outcome.results().get("slow").unwrap().value(),
            Ok(2),
        );
        dispatcher.shutdown();
    }

    #[test]
    fn best_effort_tolerates_an_unbounded_deadline() {
        // A deadline past the end of the monotonic clock means the join
        // waits for the whole batch; it must not overflow, even when the
        // batch already completed by the time the join starts.
        let config = GatherConfig::new("patient").with_deadline(Duration::MAX);
        let gather = ScatterGather::new(config, inline()).unwrap();
        let outcome = gather.run(Subtasks::new().task("answer", ok(42))).unwrap();

        assert!(outcome.all_completed());
        assert_eq!(*outcome.results().get("answer").unwrap().value(), Ok(42));
        assert_eq!(gather.stats().deadline_exits, 0);
    }

    #[test]
    fn panicking_subtask_reports_as_panicked_entry() {
        let gather = ScatterGather::new(GatherConfig::new("panicky"), inline()).unwrap();
        let tasks = Subtasks::new()
            .task("calm", ok(1))
            .task("explosive", || -> Result<i32, Infallible> {
                panic!("subtask blew up")
            });
        let outcome = gather.run(tasks).unwrap();

        assert!(outcome.all_completed());
        let entry = outcome.results().get("explosive").unwrap();
        let failure = entry.value().as_ref().unwrap_err();
        assert_eq!(failure.kind, FailureKind::Panicked);
        assert_eq!(failure.message, "subtask blew up");
    }

    #[test]
    fn all_or_nothing_returns_the_full_map() {
        let config = GatherConfig::new("strict").with_policy(JoinPolicy::AllOrNothing);
        let gather = ScatterGather::new(config, inline()).unwrap();
        let tasks = Subtasks::new().task("a", ok(1)).task("b", ok(2));
        let outcome = gather.run(tasks).unwrap();

        assert!(outcome.all_completed());
        assert_eq!(outcome.len(), 2);
    }

    #[test]
    fn all_or_nothing_ignores_the_deadline() {
        let dispatcher = Arc::new(
            ThreadPoolDispatcher::new(DispatcherConfig::new("patient").with_workers(1, 1))
                .unwrap(),
        );
        let config = GatherConfig::new("strict")
            .with_deadline(Duration::from_millis(1))
            .with_policy(JoinPolicy::AllOrNothing);
        let gather = ScatterGather::new(config, dispatcher.clone()).unwrap();

        let tasks = Subtasks::new().task("slow", || {
            thread::sleep(Duration::from_millis(150));
            Ok::<_, Infallible>(9)
        });
        let outcome = gather.run(tasks).unwrap();

        assert!(outcome.all_completed());
        assert!(outcome.elapsed() >= Duration::from_millis(150));
        dispatcher.shutdown();
    }

    #[test]
    fn all_or_nothing_fails_with_first_failure_failing_first() {
        let config = GatherConfig::new("strict").with_policy(JoinPolicy::AllOrNothing);
        let gather = ScatterGather::new(config, inline()).unwrap();
        let tasks = Subtasks::new()
            .task("flaky", || Err::<i32, _>("no data"))
            .task("steady", ok(1));

        let err = gather.run(tasks).unwrap_err();
        match err {
            StanchionError::Aggregation { name, failure } => {
                assert_eq!(name, "flaky");
                assert_eq!(failure.kind, FailureKind::Failed);
                assert_eq!(failure.message, "no data");
            }
            other => panic!("expected Aggregation, got {other:?}"),
        }
        assert_eq!(gather.stats().failed_batches, 1);
    }

    #[test]
    fn all_or_nothing_fails_with_first_failure_failing_last() {
        let config = GatherConfig::new("strict").with_policy(JoinPolicy::AllOrNothing);
        let gather = ScatterGather::new(config, inline()).unwrap();
        let tasks = Subtasks::new()
            .task("steady", ok(1))
            .task("flaky", || Err::<i32, _>("no data"));

        let err = gather.run(tasks).unwrap_err();
        match err {
            StanchionError::Aggregation { name, .. } => assert_eq!(name, "flaky"),
            other => panic!("expected Aggregation, got {other:?}"),
        }
    }

    #[test]
    fn dropped_jobs_count_down_and_report_cancellation() {
        // A shut-down dispatcher drops every submitted job; the completion
        // obligations still fire, so the join returns instead of hanging.
        let dispatcher = Arc::new(
            ThreadPoolDispatcher::new(DispatcherConfig::new("closed").with_workers(1, 1))
                .unwrap(),
        );
        dispatcher.shutdown();

        let config = GatherConfig::new("doomed").with_policy(JoinPolicy::AllOrNothing);
        let gather = ScatterGather::new(config, dispatcher).unwrap();
        let tasks = Subtasks::new().task("never", ok(1));

        let err = gather.run(tasks).unwrap_err();
        match err {
            StanchionError::Aggregation { name, failure } => {
                assert_eq!(name, "never");
                assert_eq!(failure.kind, FailureKind::Cancelled);
            }
            other => panic!("expected Aggregation, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_names_replace_earlier_work() {
        let gather = ScatterGather::new(GatherConfig::new("dedup"), inline()).unwrap();
        let tasks = Subtasks::new().task("key", ok(1)).task("key", ok(2));
        assert_eq!(tasks.len(), 1);

        let outcome = gather.run(tasks).unwrap();
        assert_eq!(outcome.len(), 1);
        assert_eq!(*outcome.results().get("key").unwrap().value(), Ok(2));
    }

    #[test]
    fn stats_count_batches() {
        let gather = ScatterGather::new(GatherConfig::new("counted"), inline()).unwrap();
        let _ = gather.run(Subtasks::new().task("one", ok(1))).unwrap();
        let _ = gather.run(Subtasks::new().task("two", ok(2))).unwrap();
        assert_eq!(gather.stats().batches, 2);
        assert_eq!(gather.stats().deadline_exits, 0);
    }
}
