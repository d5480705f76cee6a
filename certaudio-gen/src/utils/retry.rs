//! Retry policy for external calls
//!
//! Every collaborator call (catalog, search, narration, markup, speech, upload)
//! goes through [`with_retry`]: a bounded per-call timeout, a retryable-error
//! predicate ([`ExternalError::is_transient`]), exponential backoff and an
//! attempt ceiling.

use crate::error::ExternalError;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Retry schedule injected into each external call site
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Bounded timeout for a single attempt; elapsing counts as transient
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_millis(8000),
            multiplier: 2.0,
            call_timeout: Duration::from_secs(120),
        }
    }
}

impl RetryPolicy {
    /// Zero-delay policy for tests
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1.0,
            call_timeout: Duration::from_secs(30),
        }
    }

    /// Delay after the given failed attempt (1-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31) as i32;
        let millis = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_backoff.as_millis() as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

/// Final error of a retried call
#[derive(Debug, Clone, Error)]
#[error("{operation} failed after {attempts} attempt(s): {error}")]
pub struct RetryError {
    pub operation: String,
    pub attempts: u32,
    pub error: ExternalError,
}

/// Run `op` under `policy`
///
/// Non-transient errors are returned after the first attempt. Transient ones
/// are retried until `max_attempts` is reached.
pub async fn with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ExternalError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let result = match tokio::time::timeout(policy.call_timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(ExternalError::Timeout(policy.call_timeout)),
        };

        match result {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(operation, attempt, "External call succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) if error.is_transient() && attempt < max_attempts => {
                let mut delay = policy.backoff_for(attempt);
                if let ExternalError::RateLimited {
                    retry_after: Some(hint),
                } = &error
                {
                    delay = delay.max(*hint).min(policy.max_backoff);
                }

                tracing::warn!(
                    operation,
                    attempt,
                    max_attempts,
                    backoff_ms = delay.as_millis() as u64,
                    error = %error,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(error) => {
                if error.is_transient() {
                    tracing::error!(operation, attempt, error = %error, "Retry ceiling reached");
                } else {
                    tracing::warn!(operation, attempt, error = %error, "Non-retryable failure");
                }
                return Err(RetryError {
                    operation: operation.to_string(),
                    attempts: attempt,
                    error,
                });
            }
        }
    }
}
