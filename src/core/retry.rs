//! Retry policies and the retry helpers shared by every retry site.
//!
//! Storage writes, transcription calls, pipeline attempts and queue
//! admission all describe their backoff with a [`RetryPolicy`], so the
//! delays can be reasoned about (and tested) independently of the
//! operation being retried.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How the delay grows between attempts
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay after every failure
    Fixed,
    /// `base * attempt`
    Linear,
    /// `base * multiplier^(attempt-1)`, capped at `max_delay_ms`
    Exponential { multiplier: f64, max_delay_ms: u64 },
}

/// Retry policy for a fallible operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay in milliseconds
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    #[serde(default = "default_backoff")]
    pub backoff: Backoff,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay() -> u64 {
    1000
}
fn default_backoff() -> Backoff {
    Backoff::Linear
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            backoff: default_backoff(),
        }
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay_ms: delay.as_millis() as u64,
            backoff: Backoff::Fixed,
        }
    }

    pub fn linear(max_attempts: u32, base: Duration) -> Self {
        Self {
            max_attempts,
            base_delay_ms: base.as_millis() as u64,
            backoff: Backoff::Linear,
        }
    }

    pub fn exponential(max_attempts: u32, base: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay_ms: base.as_millis() as u64,
            backoff: Backoff::Exponential {
                multiplier,
                max_delay_ms: max_delay.as_millis() as u64,
            },
        }
    }

    /// Delay to wait after the given (1-indexed) attempt failed
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let millis = match self.backoff {
            Backoff::Fixed => self.base_delay_ms,
            Backoff::Linear => self.base_delay_ms.saturating_mul(attempt as u64),
            Backoff::Exponential {
                multiplier,
                max_delay_ms,
            } => {
                let delay = self.base_delay_ms as f64 * multiplier.powi((attempt - 1) as i32);
                delay.min(max_delay_ms as f64) as u64
            }
        };
        Duration::from_millis(millis)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Run `op` until it succeeds, returns a non-retryable error, or the
/// policy is exhausted. The last error is returned on failure.
///
/// Backoff sleeps are cut short by `cancel`; a cancelled retry loop
/// returns the most recent error without trying again.
pub async fn retry<T, E, F, Fut, R>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    is_retryable: R,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !is_retryable(&err) || !policy.should_retry(attempt) {
                    return Err(err);
                }
                let delay = policy.delay_for_attempt(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying after failure");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(err),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
        }
    }
}

/// Blocking counterpart of [`retry`] for synchronous callers such as the
/// SQLite connection wrapper.
pub fn retry_blocking<T, E, F, R>(policy: &RetryPolicy, is_retryable: R, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Result<T, E>,
    R: Fn(&E) -> bool,
{
    let mut attempt = 1;
    loop {
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !is_retryable(&err) || !policy.should_retry(attempt) {
                    return Err(err);
                }
                std::thread::sleep(policy.delay_for_attempt(attempt));
                attempt += 1;
            }
        }
    }
}
