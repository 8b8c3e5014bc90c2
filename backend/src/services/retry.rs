//! Bounded retry with exponential backoff for repository-server calls.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::services::pulp_client::RemoteError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total tries, including the first.
    pub attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base: Duration::from_secs(2),
            cap: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based).
    ///
    /// Formula: `min(cap, base * 2^retry)`.
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        std::cmp::min(self.cap, self.base.saturating_mul(factor))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RetryError {
    #[error("cancelled")]
    Cancelled,

    #[error("{error} (after {attempts} attempts)")]
    Failed { error: RemoteError, attempts: u32 },
}

/// Run `op` until it succeeds, fails permanently, or the policy's attempts
/// run out. Backoff sleeps stop early when `cancel` fires.
pub async fn retry_remote<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            result = op() => result,
        };
        let error = match result {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !error.is_transient() || attempt >= attempts {
            return Err(RetryError::Failed {
                error,
                attempts: attempt,
            });
        }

        let delay = policy.backoff_delay(attempt - 1);
        tracing::debug!(
            "Transient error on attempt {}/{}, retrying in {:?}: {}",
            attempt,
            attempts,
            delay,
            error
        );
        tokio::select! {
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
