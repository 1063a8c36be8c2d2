//! Retry with exponential backoff for playlist and segment requests

use crate::utils::error::{NetworkError, TransportError, VodError};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Per-request retry behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry; doubles each attempt
    pub base_delay: Duration,
    /// Cap on a single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// No retries at all
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Delay after the given 0-based attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Run `operation` until it succeeds, fails permanently, or runs out of
/// retries. The closure receives the 0-based attempt number and the error of
/// the previous attempt, if any.
///
/// Cancellation is checked before each attempt and during backoff, and wins
/// over any error.
pub async fn retry_with_backoff<F, Fut, T>(
    url: &str,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, VodError>
where
    F: FnMut(u32, Option<&TransportError>) -> Fut,
    Fut: Future<Output = Result<T, AttemptError>>,
{
    let mut last_error: Option<TransportError> = None;

    for attempt in 0..=policy.max_retries {
        if cancel.is_cancelled() {
            return Err(VodError::Cancelled);
        }

        let err = match operation(attempt, last_error.as_ref()).await {
            Ok(value) => return Ok(value),
            Err(AttemptError::Fatal(err)) => {
                return Err(if cancel.is_cancelled() {
                    VodError::Cancelled
                } else {
                    err
                })
            }
            Err(AttemptError::Transport(err)) => err,
        };

        if cancel.is_cancelled() {
            return Err(VodError::Cancelled);
        }

        if !err.is_transient() || attempt >= policy.max_retries {
            return Err(NetworkError {
                url: url.to_string(),
                attempts: attempt + 1,
                source: err,
            }
            .into());
        }

        let delay = policy.delay_for_attempt(attempt);
        warn!(
            "{} failed (attempt {}/{}): {}, retrying in {:?}",
            url,
            attempt + 1,
            policy.max_retries + 1,
            err,
            delay
        );
        last_error = Some(err);

        tokio::select! {
            _ = cancel.cancelled() => return Err(VodError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }

    // Every iteration returns on its last attempt
    Err(VodError::Cancelled)
}

/// Outcome of one failed attempt
#[derive(Debug)]
pub enum AttemptError {
    /// Network-level failure, classified by [`TransportError::is_transient`]
    Transport(TransportError),
    /// Local failure (disk, cancellation) that must not be retried
    Fatal(VodError),
}

impl From<TransportError> for AttemptError {
    fn from(err: TransportError) -> Self {
        AttemptError::Transport(err)
    }
}

impl From<std::io::Error> for AttemptError {
    fn from(err: std::io::Error) -> Self {
        AttemptError::Fatal(VodError::Io(err))
    }
}

impl From<VodError> for AttemptError {
    fn from(err: VodError) -> Self {
        AttemptError::Fatal(err)
    }
}
