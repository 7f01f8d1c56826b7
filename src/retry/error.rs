use crate::ConsumerError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RetryError {
    #[error("Maximum retries ({0}) exceeded: {1}")]
    MaxRetriesExceeded(u32, String),

    #[error("Retry interrupted by shutdown signal")]
    Interrupted,

    #[error("Non-retriable failure: {0:#}")]
    Fatal(#[source] anyhow::Error),
}

impl From<RetryError> for ConsumerError {
    fn from(err: RetryError) -> Self {
        match err {
            RetryError::MaxRetriesExceeded(attempts, msg) => {
                ConsumerError::MaxRetriesExceeded(format!("After {} attempts: {}", attempts, msg))
            }
            RetryError::Interrupted => ConsumerError::Shutdown,
            RetryError::Fatal(e) => ConsumerError::Other(e),
        }
    }
}
