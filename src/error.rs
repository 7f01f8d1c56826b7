//! Error types for the consumer

use thiserror::Error;
use tokio::task::JoinError;

use crate::client::KinesisClientError;
use crate::lease::LeaseError;
use crate::retry::{Classify, ErrorClass};

/// Main error type for consumer operations
#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("Failed to get iterator for shard {shard_id}: {source}")]
    GetIteratorFailed {
        shard_id: String,
        #[source]
        source: KinesisClientError,
    },

    #[error("Failed to get records for shard {shard_id}: {source}")]
    GetRecordsFailed {
        shard_id: String,
        #[source]
        source: KinesisClientError,
    },

    #[error("Failed to list shards: {0}")]
    ListShardsFailed(#[source] KinesisClientError),

    #[error("Maximum retry attempts reached: {0}")]
    MaxRetriesExceeded(String),

    #[error("Checkpoint error for shard {shard_id}: {message}")]
    CheckpointError { shard_id: String, message: String },

    #[error("Lease error: {0}")]
    Lease(#[from] LeaseError),

    #[error("Record processing failed on shard {shard_id} at {sequence_number}: {source}")]
    Processing {
        shard_id: String,
        sequence_number: String,
        #[source]
        source: ProcessingError,
    },

    #[error("Shard closed callback failed for {shard_id}: {source}")]
    ShardClosedCallback {
        shard_id: String,
        #[source]
        source: ProcessingError,
    },

    #[error("Worker pool is stopped")]
    PoolStopped,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Shutdown requested")]
    Shutdown,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Classify for ConsumerError {
    fn class(&self) -> ErrorClass {
        match self {
            ConsumerError::GetIteratorFailed { source, .. }
            | ConsumerError::GetRecordsFailed { source, .. }
            | ConsumerError::ListShardsFailed(source) => source.class(),
            ConsumerError::Lease(e) => e.class(),
            ConsumerError::Other(e) => crate::retry::classify(e),
            _ => ErrorClass::Fatal,
        }
    }
}

impl From<JoinError> for ConsumerError {
    fn from(err: JoinError) -> Self {
        ConsumerError::Other(err.into())
    }
}

/// Result type for consumer operations
pub type Result<T> = std::result::Result<T, ConsumerError>;

/// Error type for checkpoint operations
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint sequence number must not be empty")]
    EmptyToken,

    #[error("Checkpoints failed to flush: {0}")]
    FlushFailed(String),
}

impl Classify for CheckpointError {
    fn class(&self) -> ErrorClass {
        match self {
            CheckpointError::FlushFailed(msg) => crate::retry::classify_message(msg),
            CheckpointError::EmptyToken => ErrorClass::Fatal,
        }
    }
}

/// Failure returned by application record callbacks
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("Soft failure (retriable): {0}")]
    SoftFailure(#[source] anyhow::Error),

    #[error("Hard failure (non-retriable): {0}")]
    HardFailure(#[source] anyhow::Error),
}

impl ProcessingError {
    pub fn soft(err: impl Into<anyhow::Error>) -> Self {
        ProcessingError::SoftFailure(err.into())
    }

    pub fn hard(err: impl Into<anyhow::Error>) -> Self {
        ProcessingError::HardFailure(err.into())
    }
}
