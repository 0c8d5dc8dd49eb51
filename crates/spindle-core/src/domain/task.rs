//! Task: the unit of work carried through the queue.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::TaskId;
use super::outcome::Outcome;
use crate::error::TaskFailure;

/// Values a task may produce.
///
/// Outcomes are cloned out of the store for readers and callbacks, so values
/// must be `Clone`; they cross to worker threads, so they must be `Send`.
pub trait TaskValue: Clone + Send + 'static {}

impl<T: Clone + Send + 'static> TaskValue for T {}

/// Zero-argument unit of work.
pub type TaskBody<T> = Box<dyn FnOnce() -> Result<T, TaskFailure> + Send + 'static>;

/// Completion callback. Invoked at most once with the terminal outcome.
pub type CompletionCallback<T> = Box<dyn FnOnce(TaskId, &Outcome<T>) + Send + 'static>;

/// Scheduling priority. Higher is served first in priority mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(pub i32);

impl Priority {
    pub const NORMAL: Priority = Priority(0);
}

impl From<i32> for Priority {
    fn from(value: i32) -> Self {
        Priority(value)
    }
}

/// A submitted task. Immutable once built; the queue owns it until a worker
/// dequeues it.
///
/// The completion callback is not carried here: it is handed to the result
/// store at submission time so it fires exactly once even if the task is
/// cancelled instead of executed.
pub struct Task<T> {
    id: TaskId,
    body: TaskBody<T>,
    priority: Priority,
    submitted_at: DateTime<Utc>,
}

impl<T> Task<T> {
    pub fn new(
        id: TaskId,
        body: TaskBody<T>,
        priority: Priority,
        submitted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            body,
            priority,
            submitted_at,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }

    /// Consume the task, yielding its body.
    pub fn into_body(self) -> TaskBody<T> {
        self.body
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("submitted_at", &self.submitted_at)
            .finish_non_exhaustive()
    }
}
