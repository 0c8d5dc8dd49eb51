//! Outcome model: what the result store holds for each task id.

use serde::{Deserialize, Serialize};

use crate::error::TaskFailure;

/// State of a task as seen by the result store.
///
/// State transitions:
/// - Pending -> Succeeded
/// - Pending -> Failed
///
/// Terminal states never go back to `Pending`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome<T> {
    Pending,
    Succeeded(T),
    Failed(TaskFailure),
}

impl<T> Outcome<T> {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Outcome::Pending)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded(_))
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Outcome::Succeeded(v) => Some(v),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<&TaskFailure> {
        match self {
            Outcome::Failed(f) => Some(f),
            _ => None,
        }
    }

    /// Turn a terminal outcome into a `Result`. `None` while pending.
    pub fn into_result(self) -> Option<Result<T, TaskFailure>> {
        match self {
            Outcome::Pending => None,
            Outcome::Succeeded(v) => Some(Ok(v)),
            Outcome::Failed(f) => Some(Err(f)),
        }
    }
}

impl<T> From<Result<T, TaskFailure>> for Outcome<T> {
    fn from(result: Result<T, TaskFailure>) -> Self {
        match result {
            Ok(v) => Outcome::Succeeded(v),
            Err(f) => Outcome::Failed(f),
        }
    }
}
