//! Retry, backoff and error classification
//!
//! Every retrying loop in the crate (checkpoint flushes, storage adapters,
//! lease takeover and the shard scanner) goes through the same classifier and
//! backoff so the retry policy cannot drift between subsystems.

mod backoff;
mod classify;
mod error;

pub use backoff::{Backoff, ExponentialBackoff, ExponentialBackoffBuilder};
pub use classify::{classify, classify_code, classify_message, Classify, ErrorClass};
pub use error::RetryError;

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts (None retries until cancelled)
    pub max_retries: Option<u32>,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: Some(3),
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(300),
        }
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(self.initial_backoff, self.max_backoff)
    }
}

/// Helper for retrying recoverable failures with backoff
pub struct RetryHandle<B: Backoff> {
    config: RetryConfig,
    backoff: B,
    attempts: u32,
}

impl<B: Backoff> RetryHandle<B> {
    pub fn new(config: RetryConfig, backoff: B) -> Self {
        Self {
            config,
            backoff,
            attempts: 0,
        }
    }

    /// Run `operation` until it succeeds, fails fatally, runs out of
    /// attempts, or `cancel` fires
    pub async fn retry<F, Fut, T>(
        &mut self,
        mut operation: F,
        cancel: &CancellationToken,
    ) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        loop {
            self.attempts += 1;
            trace!(attempt = self.attempts, "Executing operation");

            let result = tokio::select! {
                result = operation() => result,
                _ = cancel.cancelled() => {
                    debug!("Operation interrupted by shutdown signal");
                    return Err(RetryError::Interrupted);
                }
            };

            let err = match result {
                Ok(value) => {
                    debug!(attempts = self.attempts, "Operation succeeded");
                    return Ok(value);
                }
                Err(e) => e,
            };

            if classify(&err) == ErrorClass::Fatal {
                warn!(attempts = self.attempts, error = %err, "Operation failed with non-retriable error");
                return Err(RetryError::Fatal(err));
            }

            if let Some(max) = self.config.max_retries {
                if self.attempts >= max {
                    warn!(
                        attempts = self.attempts,
                        error = %err,
                        "Maximum retry attempts exceeded"
                    );
                    return Err(RetryError::MaxRetriesExceeded(self.attempts, err.to_string()));
                }
            }

            warn!(
                attempt = self.attempts,
                delay_ms = ?self.backoff.next_delay(self.attempts).as_millis(),
                error = %err,
                "Operation failed, retrying after delay"
            );

            self.backoff.wait(self.attempts, cancel).await?;
        }
    }

    /// Reset the retry counter
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Get the current attempt count
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::KinesisClientError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config(max_retries: Option<u32>) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn test_retry_success() -> anyhow::Result<()> {
        let config = fast_config(Some(3));
        let mut retry = RetryHandle::new(config.clone(), config.backoff());
        let cancel = CancellationToken::new();

        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = retry
            .retry(
                || {
                    let value = counter_clone.clone();
                    async move {
                        let attempts = value.fetch_add(1, Ordering::SeqCst);
                        if attempts < 2 {
                            Err(KinesisClientError::ThroughputExceeded.into())
                        } else {
                            Ok("success")
                        }
                    }
                },
                &cancel,
            )
            .await;

        assert_eq!(result?, "success");
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(retry.attempts(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_retry_max_attempts() -> anyhow::Result<()> {
        let config = fast_config(Some(2));
        let mut retry = RetryHandle::new(config.clone(), config.backoff());
        let cancel = CancellationToken::new();

        let result: Result<(), _> = retry
            .retry(
                || async { Err(anyhow::anyhow!("service unavailable")) },
                &cancel,
            )
            .await;

        assert!(matches!(result, Err(RetryError::MaxRetriesExceeded(2, _))));
        Ok(())
    }

    #[tokio::test]
    async fn test_fatal_errors_are_not_retried() -> anyhow::Result<()> {
        let config = fast_config(None);
        let mut retry = RetryHandle::new(config.clone(), config.backoff());
        let cancel = CancellationToken::new();

        let result: Result<(), _> = retry
            .retry(
                || async { Err(KinesisClientError::AccessDenied.into()) },
                &cancel,
            )
            .await;

        assert!(matches!(result, Err(RetryError::Fatal(_))));
        assert_eq!(retry.attempts(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_retry_shutdown() -> anyhow::Result<()> {
        let config = fast_config(None);
        let mut retry = RetryHandle::new(config.clone(), config.backoff());
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            retry
                .retry(
                    || async {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        Err::<(), _>(anyhow::anyhow!("throttled"))
                    },
                    &token,
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let result = handle.await?;
        assert!(matches!(result, Err(RetryError::Interrupted)));
        Ok(())
    }

    #[tokio::test]
    async fn test_retry_with_backoff() -> anyhow::Result<()> {
        let config = fast_config(Some(3));
        let mut retry = RetryHandle::new(config.clone(), config.backoff());
        let cancel = CancellationToken::new();

        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();
        let start = std::time::Instant::now();

        let result: Result<(), RetryError> = retry
            .retry(
                || {
                    let attempts = attempts_clone.clone();
                    async move {
                        if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err(anyhow::anyhow!("connection reset by peer"))
                        } else {
                            Ok(())
                        }
                    }
                },
                &cancel,
            )
            .await;

        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        // 20ms + 40ms of backoff
        assert!(start.elapsed() >= Duration::from_millis(60));
        Ok(())
    }
}
