//! Retry policy for transient embedding failures.
//!
//! The policy is a plain value injected into [`crate::EmbeddingClient`] at
//! construction. The backoff schedule is exposed through
//! [`RetryPolicy::delay_for`] so it can be checked without sleeping.

use crate::error::{EmbedError, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Capped exponential backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one. At least 1.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay_ms: u64,
    /// Upper bound for any single delay.
    pub max_delay_ms: u64,
    /// Growth factor applied after every failed attempt.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 200,
            max_delay_ms: 5_000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(self, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..self
        }
    }

    pub fn with_delays(self, initial: Duration, max: Duration) -> Self {
        Self {
            initial_delay_ms: initial.as_millis() as u64,
            max_delay_ms: max.as_millis() as u64,
            ..self
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(EmbedError::invalid_config(
                "retry.max_attempts must be at least 1",
            ));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(EmbedError::invalid_config(format!(
                "retry.multiplier must be a finite number >= 1.0, got {}",
                self.multiplier
            )));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(EmbedError::invalid_config(format!(
                "retry.initial_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.initial_delay_ms, self.max_delay_ms
            )));
        }
        Ok(())
    }

    /// Delay to wait after the given failed attempt (1-based).
    ///
    /// Attempt 1 waits `initial_delay_ms`, each later attempt multiplies the delay
    /// by `multiplier`, and no delay exceeds `max_delay_ms`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let delay_ms = self.initial_delay_ms as f64 * self.multiplier.powi(exponent);
        let capped_ms = delay_ms.min(self.max_delay_ms as f64);
        Duration::from_millis(capped_ms as u64)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// Permanent errors are returned unchanged. When the final attempt fails with a
    /// transient error the result is [`EmbedError::Unavailable`] wrapping it.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) if attempt >= max_attempts => {
                    tracing::warn!("{} failed after {} attempt(s): {}", what, attempt, e);
                    return Err(EmbedError::Unavailable {
                        attempts: attempt,
                        last_error: Box::new(e),
                    });
                }
                Err(e) => {
                    let delay = self.delay_for(attempt);
                    tracing::debug!(
                        "{} attempt {}/{} failed ({}), retrying in {:?}",
                        what,
                        attempt,
                        max_attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
