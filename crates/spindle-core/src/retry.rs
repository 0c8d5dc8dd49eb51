//! Retry policy: bounded re-execution of a body with exponential backoff.
//!
//! Retries are pinned to the worker running the task: the backoff sleep blocks
//! that worker, and every attempt belongs to the same task id.

use std::thread;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::TaskFailure;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. At least 1.
    pub max_attempts: u32,

    /// Delay before the first retry.
    #[serde(with = "crate::config::duration_millis")]
    pub base_delay: Duration,

    /// Backoff multiplier.
    pub multiplier: f64,

    /// Upper bound for a single delay, before jitter.
    #[serde(default, with = "option_duration_millis")]
    pub max_delay: Option<Duration>,

    /// Extra random delay as a fraction of the computed delay (0.0-1.0).
    /// Only ever added, so the delay never drops below the exponential value.
    #[serde(default)]
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            multiplier: 2.0,
            max_delay: None,
            jitter: 0.0,
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `attempts` (1-indexed):
    /// `base_delay * multiplier^(attempts - 1)`, capped, then jittered.
    ///
    /// With base_delay=10ms and the default multiplier:
    /// - retry 1: 10ms
    /// - retry 2: 20ms
    /// - retry 3: 40ms
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let mut delay_secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if delay_secs.is_nan() {
            // zero base times an overflowed factor
            delay_secs = 0.0;
        }
        let ceiling = self.max_delay.unwrap_or(Duration::MAX).as_secs_f64();
        delay_secs = delay_secs.min(ceiling);
        if self.jitter > 0.0 && delay_secs > 0.0 {
            delay_secs += rand::thread_rng().gen_range(0.0..delay_secs * self.jitter);
        }
        Duration::try_from_secs_f64(delay_secs).unwrap_or(Duration::MAX)
    }

    /// Wrap `body` so it is retried according to this policy.
    pub fn wrap<T, F>(&self, body: F) -> impl FnOnce() -> Result<T, TaskFailure> + Send + 'static + use<T, F>
    where
        T: 'static,
        F: FnMut() -> Result<T, TaskFailure> + Send + 'static,
    {
        self.wrap_with_cancellation(body, CancellationToken::new())
    }

    /// Like [`wrap`](Self::wrap), checking `token` before every attempt.
    pub fn wrap_with_cancellation<T, F>(
        &self,
        mut body: F,
        token: CancellationToken,
    ) -> impl FnOnce() -> Result<T, TaskFailure> + Send + 'static + use<T, F>
    where
        T: 'static,
        F: FnMut() -> Result<T, TaskFailure> + Send + 'static,
    {
        let policy = self.clone();
        move || policy.run(&mut body, &token)
    }

    fn run<T, F>(&self, body: &mut F, token: &CancellationToken) -> Result<T, TaskFailure>
    where
        F: FnMut() -> Result<T, TaskFailure>,
    {
        let mut attempt = 1;
        loop {
            if token.is_cancelled() {
                return Err(TaskFailure::cancelled(format!(
                    "cancelled before attempt {attempt}"
                )));
            }

            let err = match body() {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_retryable() {
                return Err(err);
            }
            if attempt >= self.max_attempts {
                warn!(attempts = attempt, error = %err, "retries exhausted");
                return Err(TaskFailure::RetriesExhausted {
                    last_error: Box::new(err),
                    attempts: attempt,
                });
            }

            let delay = self.next_delay(attempt);
            warn!(attempt, max_attempts = self.max_attempts, error = %err, "attempt failed");
            debug!(delay_ms = delay.as_millis() as u64, "backing off before retry");
            thread::sleep(delay);
            attempt += 1;
        }
    }
}

/// Wrap `body` with `max_attempts` total attempts and exponential backoff
/// starting at `base_delay`.
pub fn wrap<T, F>(
    body: F,
    max_attempts: u32,
    base_delay: Duration,
) -> impl FnOnce() -> Result<T, TaskFailure> + Send + 'static + use<T, F>
where
    T: 'static,
    F: FnMut() -> Result<T, TaskFailure> + Send + 'static,
{
    RetryPolicy::new(max_attempts, base_delay).wrap(body)
}

mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
