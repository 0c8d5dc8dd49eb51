//! spindle-core
//!
//! In-process task execution engine: a fixed pool of worker threads pulling
//! opaque task bodies off one shared queue, recording each outcome exactly
//! once in a result store.
//!
//! # Modules
//! - **domain**: ids, tasks, outcomes
//! - **ports**: clock and batch id generation
//! - **queue**: FIFO / priority task queue
//! - **store**: result store with waiters and completion callbacks
//! - **pool**: worker pool lifecycle and submission
//! - **handle**: per-task handle (poll, block, callback, await)
//! - **retry**: retry policy with exponential backoff
//! - **batch**: fan-out / fan-in orchestration
//! - **config**, **error**, **observability**: ambient plumbing

pub mod batch;
pub mod config;
pub mod domain;
pub mod error;
pub mod handle;
pub mod observability;
pub mod pool;
pub mod ports;
pub mod queue;
pub mod retry;
pub mod runtime;
pub mod store;

mod worker;

pub use batch::{BatchHandle, BatchItem, BatchOrchestrator, BatchReport};
pub use config::EngineConfig;
pub use domain::{BatchId, Outcome, Priority, TaskId, TaskValue};
pub use error::{ConfigError, EngineError, TaskFailure};
pub use handle::TaskHandle;
pub use observability::{EngineCounts, init_tracing};
pub use pool::{Reservation, SubmitOptions, WorkerPool};
pub use queue::QueueMode;
pub use retry::RetryPolicy;
pub use store::{ResultStore, StoreCounts};
