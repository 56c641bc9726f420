//! Retry with linear backoff and cancellable waits.
//!
//! The n-th retry waits `delay * n`. Waits race a [`CancellationToken`], so a
//! caller shutting down never sits out a full delay.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use backon::BackoffBuilder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RpcClientConfig;

/// Linear backoff: `delay`, `2 * delay`, ... for at most `max_times` retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearBuilder {
    delay: Duration,
    max_times: usize,
}

impl Default for LinearBuilder {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(1),
            max_times: 3,
        }
    }
}

impl LinearBuilder {
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_max_times(mut self, max_times: usize) -> Self {
        self.max_times = max_times;
        self
    }
}

impl BackoffBuilder for LinearBuilder {
    type Backoff = LinearBackoff;

    fn build(self) -> Self::Backoff {
        LinearBackoff {
            delay: self.delay,
            max_times: self.max_times,
            attempt: 0,
        }
    }
}

/// Iterator of linear backoff delays.
#[derive(Debug, Clone)]
pub struct LinearBackoff {
    delay: Duration,
    max_times: usize,
    attempt: usize,
}

impl Iterator for LinearBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_times {
            return None;
        }
        self.attempt += 1;
        let factor = u32::try_from(self.attempt).unwrap_or(u32::MAX);
        Some(self.delay.saturating_mul(factor))
    }
}

/// Backoff for an RPC client's `with_retry`.
///
/// - Delay: `retry_delay * attempt`
/// - Max retries: `max_retries`
pub fn client_backoff(config: &RpcClientConfig) -> LinearBuilder {
    LinearBuilder::default()
        .with_delay(config.retry_delay())
        .with_max_times(config.max_retries as usize)
}

/// Why a retried operation gave up.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// Every attempt failed. Carries the last failure.
    #[error("max retries exceeded after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
    /// The token was cancelled while waiting between attempts.
    #[error("retry cancelled after {attempts} attempts")]
    Cancelled { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    /// Attempts made before giving up.
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } | RetryError::Cancelled { attempts, .. } => {
                *attempts
            }
        }
    }

    /// The failure of the last attempt.
    pub fn into_last(self) -> E {
        match self {
            RetryError::Exhausted { last, .. } | RetryError::Cancelled { last, .. } => last,
        }
    }
}

/// Run `f` until it succeeds, the backoff runs out, or `cancel` fires.
///
/// The first attempt runs immediately; each later attempt follows one delay
/// from `backoff`.
pub async fn retry_with_backoff<T, E, F, Fut, B>(
    operation: &str,
    backoff: B,
    cancel: &CancellationToken,
    mut f: F,
) -> std::result::Result<T, RetryError<E>>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    B: BackoffBuilder,
{
    let mut attempts: u32 = 1;
    let mut last = match f().await {
        Ok(value) => return Ok(value),
        Err(e) => e,
    };

    for delay in backoff.build() {
        warn!(
            operation,
            attempt = attempts,
            error = %last,
            delay_ms = delay.as_millis() as u64,
            "Attempt failed, retrying after backoff"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(operation, attempts, "Retry cancelled during backoff");
                return Err(RetryError::Cancelled { attempts, last });
            }
            _ = tokio::time::sleep(delay) => {}
        }

        attempts += 1;
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) => last = e,
        }
    }

    warn!(operation, attempts, error = %last, "Retries exhausted");
    Err(RetryError::Exhausted { attempts, last })
}

#[cfg(test)]
mod tests;
