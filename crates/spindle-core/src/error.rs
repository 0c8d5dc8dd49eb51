use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::TaskId;

/// Infrastructure errors, returned synchronously to the caller.
///
/// Task bodies never produce these; their failures are recorded as
/// [`TaskFailure`] inside an outcome.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("queue is closed; the pool no longer accepts work")]
    QueueClosed,

    #[error("timed out after {waited:?} waiting for {id}")]
    TimedOut { id: TaskId, waited: Duration },

    /// A second terminal outcome was written for the same task.
    /// This is a broken invariant, not a recoverable condition.
    #[error("duplicate terminal outcome for {id}")]
    DuplicatePut { id: TaskId },

    #[error("unknown task {0}")]
    UnknownTask(TaskId),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Why a task did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskFailure {
    #[error("task failed: {cause}")]
    Failed { cause: String },

    #[error("task panicked: {message}")]
    Panicked { message: String },

    #[error("gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        last_error: Box<TaskFailure>,
        attempts: u32,
    },

    #[error("task cancelled: {reason}")]
    Cancelled { reason: String },
}

impl TaskFailure {
    pub fn failed(cause: impl Into<String>) -> Self {
        TaskFailure::Failed {
            cause: cause.into(),
        }
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        TaskFailure::Cancelled {
            reason: reason.into(),
        }
    }

    /// Whether running the body again could change the result.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TaskFailure::Cancelled { .. })
    }
}

impl From<String> for TaskFailure {
    fn from(cause: String) -> Self {
        TaskFailure::Failed { cause }
    }
}

impl From<&str> for TaskFailure {
    fn from(cause: &str) -> Self {
        TaskFailure::failed(cause)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}
