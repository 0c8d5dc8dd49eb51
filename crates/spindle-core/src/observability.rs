//! Logging setup and engine counters.

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Point-in-time view of a pool, as returned by
/// [`WorkerPool::counts`](crate::WorkerPool::counts).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineCounts {
    pub workers: usize,
    pub queued: usize,
    pub inflight: usize,
    pub pending: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub callback_panics: u64,
}

/// Initialize tracing for the process.
///
/// Filter comes from `RUST_LOG`, defaulting to `info`. Safe to call multiple
/// times (subsequent calls are no-ops).
pub fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .with_target(false);

    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
