//! Error types for coordination operations.

use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;

/// Result alias used across the crate.
pub type StanchionResult<T> = Result<T, StanchionError>;

/// Core coordination errors.
///
/// Overload and timeout are distinct variants on purpose: callers shed load
/// immediately on [`Overloaded`](StanchionError::Overloaded) but may retry
/// with a longer deadline on [`Timeout`](StanchionError::Timeout). Nothing in
/// this crate retries internally.
#[derive(Debug, Clone, Error)]
pub enum StanchionError {
    /// A blocking wait exceeded its deadline.
    #[error("{context} timed out after {waited:?}")]
    Timeout {
        /// How long the caller waited before giving up.
        waited: Duration,
        /// What the caller was waiting for.
        context: String,
    },

    /// The admission gate rejected the caller outright.
    #[error("gate '{name}' overloaded: all {capacity} permits in use")]
    Overloaded {
        /// Configured gate name.
        name: String,
        /// Total permit count of the gate.
        capacity: u32,
    },

    /// A release violated the pool's borrow protocol.
    ///
    /// This is a caller bug, not an operational condition. Internal paths
    /// additionally `debug_assert!` so the violation is loud in development.
    #[error("invalid release on pool '{name}': {violation}")]
    InvalidRelease {
        /// Configured pool name.
        name: String,
        /// Which protocol rule was broken.
        violation: ReleaseViolation,
    },

    /// All-or-nothing aggregation observed a subtask failure.
    ///
    /// Carries the first failure by completion order; the partial result map
    /// is discarded.
    #[error("subtask '{name}' failed during aggregation")]
    Aggregation {
        /// Name of the first subtask observed to fail.
        name: String,
        /// The failure itself.
        #[source]
        failure: TaskFailure,
    },

    /// Dispatched work reported failure when joined through its handle.
    #[error("task '{name}' failed")]
    TaskFailed {
        /// Name the task was submitted under.
        name: String,
        /// The failure itself.
        #[source]
        failure: TaskFailure,
    },

    /// Work was dropped before it could run or complete.
    #[error("cancelled: {context}")]
    Cancelled {
        /// What was cancelled and why.
        context: String,
    },

    /// Invalid configuration values.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Which borrow-protocol rule an invalid release broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReleaseViolation {
    /// A release arrived while nothing was checked out.
    #[error("no resource is currently checked out")]
    NothingBorrowed,
    /// A release would push the free list past the pool's capacity.
    #[error("free list is already at capacity")]
    AtCapacity,
}

/// Why a dispatched subtask did not produce a value.
///
/// Stored per subtask in gather result maps and wrapped by
/// [`StanchionError::Aggregation`]. `Clone` so the same failure can live in
/// the map and in the first-failure slot.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct TaskFailure {
    /// Broad failure category.
    pub kind: FailureKind,
    /// Human-readable detail.
    pub message: String,
}

/// Category of a subtask failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FailureKind {
    /// The work ran and returned an error.
    #[error("failed")]
    Failed,
    /// The work panicked; the panic was caught at the dispatch boundary.
    #[error("panicked")]
    Panicked,
    /// The work was dropped before it ran (rejected or shut down).
    #[error("cancelled")]
    Cancelled,
}

impl TaskFailure {
    /// Failure reported by the work itself.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Failed,
            message: message.into(),
        }
    }

    /// Failure recorded when work panicked.
    pub fn panicked(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Panicked,
            message: message.into(),
        }
    }

    /// Failure recorded when work was dropped without running.
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Cancelled,
            message: message.into(),
        }
    }
}

/// Error classification for decision making.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Transient errors worth retrying as-is.
    Transient,
    /// Resource exhaustion; retry after backing off.
    ResourceExhaustion,
    /// Configuration or programming errors.
    Configuration,
    /// Permanent failures.
    Permanent,
}

impl StanchionError {
    /// Create a timeout error.
    pub fn timeout(waited: Duration, context: impl Into<String>) -> Self {
        Self::Timeout {
            waited,
            context: context.into(),
        }
    }

    /// Create an overload error.
    pub fn overloaded(name: impl Into<String>, capacity: u32) -> Self {
        Self::Overloaded {
            name: name.into(),
            capacity,
        }
    }

    /// Create an invalid-release error.
    pub fn invalid_release(name: impl Into<String>, violation: ReleaseViolation) -> Self {
        Self::InvalidRelease {
            name: name.into(),
            violation,
        }
    }

    /// Create an aggregation error from the first observed subtask failure.
    pub fn aggregation(name: impl Into<String>, failure: TaskFailure) -> Self {
        Self::Aggregation {
            name: name.into(),
            failure,
        }
    }

    /// Create a task-failure error for a joined handle.
    pub fn task_failed(name: impl Into<String>, failure: TaskFailure) -> Self {
        Self::TaskFailed {
            name: name.into(),
            failure,
        }
    }

    /// Create a cancellation error.
    pub fn cancelled(context: impl Into<String>) -> Self {
        Self::Cancelled {
            context: context.into(),
        }
    }

    /// Classify the error for decision making.
    pub fn classify(&self) -> ErrorClass {
        match self {
            Self::Timeout { .. } => ErrorClass::Transient,
            Self::Overloaded { .. } => ErrorClass::ResourceExhaustion,
            Self::InvalidRelease { .. } | Self::Config(_) => ErrorClass::Configuration,
            Self::Aggregation { .. } | Self::TaskFailed { .. } | Self::Cancelled { .. } => {
                ErrorClass::Permanent
            }
        }
    }

    /// Check if the error is worth retrying (possibly after backoff).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classify(),
            ErrorClass::Transient | ErrorClass::ResourceExhaustion
        )
    }

    /// Check if the error is terminal for the calling operation.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.classify(),
            ErrorClass::Permanent | ErrorClass::Configuration
        )
    }
}
