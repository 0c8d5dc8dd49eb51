//! Engine configuration.
//!
//! Defaults suit a small interactive process; `from_env` lets a deployment
//! override them without code changes:
//!
//! | variable                     | field             |
//! |------------------------------|-------------------|
//! | `SPINDLE_WORKERS`            | `worker_count`    |
//! | `SPINDLE_QUEUE_MODE`         | `queue_mode`      |
//! | `SPINDLE_DEQUEUE_TIMEOUT_MS` | `dequeue_timeout` |
//! | `SPINDLE_THREAD_NAME`        | `thread_name`     |

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::queue::QueueMode;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of worker threads started by [`WorkerPool::launch`](crate::WorkerPool::launch).
    pub worker_count: usize,

    pub queue_mode: QueueMode,

    /// How long an idle worker blocks in `dequeue` before re-checking the
    /// running flag.
    #[serde(with = "duration_millis")]
    pub dequeue_timeout: Duration,

    /// Prefix for worker thread names; workers are `<prefix>-<n>`.
    pub thread_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            queue_mode: QueueMode::Fifo,
            dequeue_timeout: Duration::from_secs(1),
            thread_name: "spindle-worker".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count.max(1);
        self
    }

    pub fn with_queue_mode(mut self, mode: QueueMode) -> Self {
        self.queue_mode = mode;
        self
    }

    pub fn with_dequeue_timeout(mut self, timeout: Duration) -> Self {
        self.dequeue_timeout = timeout;
        self
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Defaults overridden by `SPINDLE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup("SPINDLE_WORKERS") {
            let n: usize = raw.trim().parse().map_err(|e| ConfigError::Invalid {
                key: "SPINDLE_WORKERS",
                value: raw.clone(),
                reason: format!("{e}"),
            })?;
            if n == 0 {
                return Err(ConfigError::Invalid {
                    key: "SPINDLE_WORKERS",
                    value: raw,
                    reason: "must be at least 1".to_string(),
                });
            }
            config.worker_count = n;
        }

        if let Some(raw) = lookup("SPINDLE_QUEUE_MODE") {
            config.queue_mode = raw.parse()?;
        }

        if let Some(raw) = lookup("SPINDLE_DEQUEUE_TIMEOUT_MS") {
            let ms: u64 = raw.trim().parse().map_err(|e| ConfigError::Invalid {
                key: "SPINDLE_DEQUEUE_TIMEOUT_MS",
                value: raw.clone(),
                reason: format!("{e}"),
            })?;
            config.dequeue_timeout = Duration::from_millis(ms);
        }

        if let Some(raw) = lookup("SPINDLE_THREAD_NAME") {
            config.thread_name = raw;
        }

        Ok(config)
    }
}

pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
