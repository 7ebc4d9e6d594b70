//! Bounded retry with capped exponential back-off.
//!
//! The wrapper knows nothing about agents: it calls an async operation,
//! asks a caller-supplied predicate whether a failure is worth retrying, and
//! sleeps `base_delay * 2^retry_count` (capped at `max_delay`) in between.
//! The back-off sleep is cut short when the cancellation token fires.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Retry budget and back-off shape for one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts are `max_retries + 1`.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self { max_retries, base_delay, max_delay }
    }

    /// Back-off before retry number `retry_count + 1`.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        2u32.checked_pow(retry_count)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// Why [`execute_with_retry`] gave up.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Every attempt failed with a retryable error.
    #[error("retries exhausted after {attempts} attempt(s): {last_error}")]
    Exhausted { attempts: u32, last_error: E },

    /// A non-retryable error ended the loop early.
    #[error("attempt {attempts} failed permanently: {error}")]
    Aborted { attempts: u32, error: E },

    /// Cancellation arrived during a back-off sleep.
    #[error("cancelled after {attempts} attempt(s); last error: {last_error}")]
    Cancelled { attempts: u32, last_error: E },
}

impl<E> RetryError<E> {
    /// Number of times the operation was invoked.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. }
            | Self::Aborted { attempts, .. }
            | Self::Cancelled { attempts, .. } => *attempts,
        }
    }
}

/// Run `op` until it succeeds, fails permanently, runs out of retries, or
/// `cancel` fires during a back-off.
///
/// `op` receives the current retry count (0 on the first attempt).
pub async fn execute_with_retry<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    is_retryable: P,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: Display,
{
    let mut retry_count = 0u32;

    loop {
        let err = match op(retry_count).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        let attempts = retry_count + 1;

        if !is_retryable(&err) {
            return Err(RetryError::Aborted { attempts, error: err });
        }
        if retry_count >= policy.max_retries {
            return Err(RetryError::Exhausted { attempts, last_error: err });
        }

        let delay = policy.delay_for(retry_count);
        warn!(
            attempt = attempts,
            max_retries = policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            "retryable failure, backing off: {}",
            err
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(RetryError::Cancelled { attempts, last_error: err });
            }
            _ = tokio::time::sleep(delay) => {}
        }
        retry_count += 1;
    }
}
