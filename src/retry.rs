//! Exponential backoff for object-level operations.

use crate::errors::{UploaderError, UploaderResult};
use serde::{Deserialize, Serialize};
use std::{future::Future, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RetryConfig {
    /// Attempts after the first one.
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 200,
            retry_max_delay_ms: 5_000,
        }
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or
/// exhausts `config.max_retries`. Sleeping between attempts is cut short by
/// `cancel`.
pub async fn with_backoff<T, F, Fut>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    label: &str,
    mut op: F,
) -> UploaderResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = UploaderResult<T>>,
{
    let mut delay_ms = config.retry_delay_ms;
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < config.max_retries => {
                attempt += 1;
                warn!(
                    "{label}: transient error (attempt {}/{}), retrying in {delay_ms} ms: {err}",
                    attempt, config.max_retries,
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return Err(UploaderError::Interrupted { operation: "retry backoff" });
                    }
                    _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                }
                delay_ms = delay_ms.saturating_mul(2).min(config.retry_max_delay_ms);
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::BackendError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            retry_delay_ms: 1,
            retry_max_delay_ms: 2,
        }
    }

    fn upload_error(status: u16) -> UploaderError {
        UploaderError::Upload {
            path: "c/b/f".into(),
            source: BackendError::Status {
                status,
                code: None,
                message: "boom".into(),
            },
        }
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_backoff(&fast(3), &CancellationToken::new(), "put", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(upload_error(503))
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_fail_immediately() {
        let calls = AtomicU32::new(0);
        let result: UploaderResult<()> =
            with_backoff(&fast(3), &CancellationToken::new(), "put", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(upload_error(400))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let result: UploaderResult<()> =
            with_backoff(&fast(2), &CancellationToken::new(), "put", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(upload_error(500))
            })
            .await;

        assert!(result.unwrap_err().is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancellation_stops_the_backoff() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let slow = RetryConfig {
            max_retries: 5,
            retry_delay_ms: 60_000,
            retry_max_delay_ms: 60_000,
        };
        let result: UploaderResult<()> =
            with_backoff(&slow, &cancel, "put", || async { Err(upload_error(500)) }).await;

        assert!(result.unwrap_err().is_interrupted());
    }
}
