//! Bounded exponential backoff for transient failures.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{ApiError, ApiResponse};

/// Initial backoff delay in milliseconds.
const DEFAULT_BASE_DELAY_MS: u64 = 1000;

/// Upper bound on a single backoff delay in milliseconds.
const DEFAULT_MAX_DELAY_MS: u64 = 10_000;

/// Retries after the first attempt.
const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl RetryPolicy {
    /// Never retry
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (0-based): base * 2^retry, capped.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u64.checked_shl(retry).unwrap_or(u64::MAX);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }
}

/// Run `send` until it yields a non-transient outcome or retries run out.
///
/// A 5xx response or a transient error triggers a retry. Once retries are
/// exhausted the last outcome is returned as-is; 4xx responses come back
/// on the first attempt.
pub async fn send_with_backoff<F, Fut>(policy: &RetryPolicy, path: &str, mut send: F) -> Result<ApiResponse, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<ApiResponse, ApiError>>,
{
    let mut retry = 0;

    loop {
        let outcome = send().await;
        let transient = match &outcome {
            Ok(response) => response.status.is_server_error(),
            Err(e) => e.is_transient(),
        };

        if !transient || retry >= policy.max_retries {
            return outcome;
        }

        let delay = policy.delay_for(retry);
        retry += 1;
        warn!(
            path = path,
            retry = retry,
            delay_ms = delay.as_millis() as u64,
            "Transient failure, backing off"
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for(4), Duration::from_secs(10));
        assert_eq!(policy.delay_for(80), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_retries() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let start = tokio::time::Instant::now();

        let outcome = send_with_backoff(&RetryPolicy::default(), "/x", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(ApiResponse::new(StatusCode::BAD_GATEWAY, ""))
        })
        .await
        .unwrap();

        assert_eq!(outcome.status, StatusCode::BAD_GATEWAY);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        // 1s + 2s + 4s
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(7) && elapsed < Duration::from_millis(7100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_errors_are_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let outcome = send_with_backoff(&RetryPolicy::default(), "/x", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(ApiResponse::new(StatusCode::BAD_REQUEST, ""))
        })
        .await
        .unwrap();

        assert_eq!(outcome.status, StatusCode::BAD_REQUEST);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_timeouts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let outcome = send_with_backoff(&RetryPolicy::default(), "/x", move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ApiError::Timeout)
            } else {
                Ok(ApiResponse::new(StatusCode::OK, "{}"))
            }
        })
        .await
        .unwrap();

        assert_eq!(outcome.status, StatusCode::OK);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_no_retry_policy() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let outcome = send_with_backoff(&RetryPolicy::none(), "/x", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ApiError::Timeout)
        })
        .await;

        assert_eq!(outcome.unwrap_err(), ApiError::Timeout);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
