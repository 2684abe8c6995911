//! Core types shared by the Run Logger and the Worker Pool

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Lifecycle of one run
///
/// `Running` moves to one of the three exit paths, then through `Closing`
/// to `Closed`. Closing happens exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Driving code is executing
    Running,
    /// An uncaught failure (error or panic) ended the body
    ExceptionRaised,
    /// The body requested a non-zero exit
    ExplicitExit,
    /// The body returned normally
    CleanReturn,
    /// The exit hook is running
    Closing,
    /// Logs are closed and counters persisted
    Closed,
}

/// Where a run's error value came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorSource {
    /// Set by the driving code through `set_error`
    Raised,
    /// An uncaught error or panic
    Uncaught,
    /// Explicit exit with the given code
    Exit(i32),
    /// The notification e-mail could not be sent
    SendMail,
}

/// A run's error value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorValue {
    /// Origin of the failure
    pub source: ErrorSource,
    /// Text recorded in the logs and the e-mail
    pub message: String,
}

impl ErrorValue {
    /// Error value set by application code
    pub fn raised(message: impl Into<String>) -> Self {
        Self {
            source: ErrorSource::Raised,
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.source {
            ErrorSource::Exit(code) => write!(f, "exit({code}): {}", self.message),
            _ => f.write_str(&self.message),
        }
    }
}

/// Outcome class used for notification decisions and persisted as `last_state`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MailState {
    /// Run finished without an error value
    #[default]
    Success,
    /// Run finished with an error value
    Failure,
    /// The previous run exited prematurely (discovered by this run)
    PrematureExit,
}

impl MailState {
    /// Numeric code (0 success, 1 failure, 2 premature exit)
    pub fn code(&self) -> u8 {
        match self {
            MailState::Success => 0,
            MailState::Failure => 1,
            MailState::PrematureExit => 2,
        }
    }
}

/// Worker Pool lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    /// Accepting tasks
    Running,
    /// No new tasks; queued work drains
    Closing,
    /// All workers finished
    Closed,
    /// Workers were aborted
    Terminated,
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            PoolState::Running => "RUNNING",
            PoolState::Closing => "CLOSING",
            PoolState::Closed => "CLOSED",
            PoolState::Terminated => "TERMINATED",
        };
        f.write_str(text)
    }
}

/// Result of one pooled task, tagged by the worker that ran it
#[derive(Debug, Clone)]
pub enum TaskOutcome<T> {
    /// Task returned a value
    Succeeded {
        /// Worker identifier
        worker: usize,
        /// Returned value
        value: T,
        /// Time spent in the task
        elapsed: Duration,
    },
    /// Task failed inside the worker (error, panic, or uninitialized worker)
    Failed {
        /// Worker identifier
        worker: usize,
        /// Failure text
        error: String,
        /// Time spent in the task
        elapsed: Duration,
    },
}

impl<T> TaskOutcome<T> {
    /// True for [`TaskOutcome::Succeeded`]
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Succeeded { .. })
    }

    /// Time spent in the task
    pub fn elapsed(&self) -> Duration {
        match self {
            TaskOutcome::Succeeded { elapsed, .. } | TaskOutcome::Failed { elapsed, .. } => *elapsed,
        }
    }

    /// Worker that ran the task
    pub fn worker(&self) -> usize {
        match self {
            TaskOutcome::Succeeded { worker, .. } | TaskOutcome::Failed { worker, .. } => *worker,
        }
    }
}
