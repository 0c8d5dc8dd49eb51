//! Domain model (ids, tasks, outcomes).

pub mod ids;
pub mod outcome;
pub mod task;

pub use ids::{BatchId, TaskId};
pub use outcome::Outcome;
pub use task::{CompletionCallback, Priority, Task, TaskBody, TaskValue};
