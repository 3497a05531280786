//! Exponential backoff shared by fragment and key requests.

use std::future::Future;
use std::time::Duration;

use rand::RngExt;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::DownloadError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubled on each further retry.
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Add up to `base_delay / 2` of random delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    pub(crate) fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        let capped = self
            .base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay));
        if !self.jitter {
            return capped;
        }

        // Jitter never pushes the delay past `max_delay`.
        let headroom = self.max_delay.saturating_sub(capped);
        let spread = (self.base_delay / 2).min(headroom);
        let spread_ms = u64::try_from(spread.as_millis()).unwrap_or(u64::MAX);
        if spread_ms == 0 {
            return capped;
        }
        capped + Duration::from_millis(rand::rng().random_range(0..spread_ms))
    }
}

/// Outcome of one attempt.
pub enum RetryAction<T> {
    Success(T),
    Retry(DownloadError),
    Fail(DownloadError),
}

impl<T> RetryAction<T> {
    /// Retry when the error is transient, fail otherwise.
    pub fn from_result(result: Result<T, DownloadError>) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(e) if e.is_retryable() => Self::Retry(e),
            Err(e) => Self::Fail(e),
        }
    }
}

/// Run `operation` until it succeeds, fails permanently, runs out of retries
/// or `token` is cancelled. The closure receives the 0-based attempt number.
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    operation: F,
) -> Result<T, DownloadError>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = RetryAction<T>>,
{
    let mut attempt = 0;
    loop {
        if token.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        let err = match operation(attempt).await {
            RetryAction::Success(value) => return Ok(value),
            RetryAction::Fail(err) => return Err(err),
            RetryAction::Retry(err) if attempt >= policy.max_retries => return Err(err),
            RetryAction::Retry(err) => err,
        };

        let delay = policy.delay_for_attempt(attempt);
        attempt += 1;
        warn!(
            attempt,
            max = policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Retrying after transient error"
        );
        tokio::select! {
            _ = token.cancelled() => return Err(DownloadError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            jitter: false,
        }
    }

    fn transient() -> DownloadError {
        DownloadError::http_status(
            reqwest::StatusCode::SERVICE_UNAVAILABLE,
            "http://host/seg1.ts",
            "segment download",
        )
    }

    #[test]
    fn delay_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            jitter: false,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter: true,
        };
        for _ in 0..32 {
            let first = policy.delay_for_attempt(0);
            assert!(first >= Duration::from_millis(100) && first < Duration::from_millis(150));
            assert!(policy.delay_for_attempt(12) <= Duration::from_secs(1));
        }
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let token = CancellationToken::new();
        let attempts = AtomicU32::new(0);
        let value = retry_with_backoff(&fast(3), &token, |attempt| {
            attempts.fetch_add(1, Ordering::Relaxed);
            async move {
                if attempt < 2 {
                    RetryAction::Retry(transient())
                } else {
                    RetryAction::Success(attempt)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 2);
        assert_eq!(attempts.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let token = CancellationToken::new();
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff(&fast(2), &token, |_| {
            attempts.fetch_add(1, Ordering::Relaxed);
            async { RetryAction::Retry(transient()) }
        })
        .await;
        assert!(result.unwrap_err().is_retryable());
        assert_eq!(attempts.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn permanent_errors_fail_fast() {
        let token = CancellationToken::new();
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff(&fast(5), &token, |_| {
            attempts.fetch_add(1, Ordering::Relaxed);
            async {
                RetryAction::from_result(Err(DownloadError::not_found("http://host/seg3.ts")))
            }
        })
        .await;
        assert!(result.unwrap_err().is_not_found());
        assert_eq!(attempts.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn cancelled_token_stops_immediately() {
        let token = CancellationToken::new();
        token.cancel();
        let result: Result<u32, _> =
            retry_with_backoff(&fast(5), &token, |_| async { RetryAction::Success(1) }).await;
        assert!(matches!(result, Err(DownloadError::Cancelled)));
    }
}
