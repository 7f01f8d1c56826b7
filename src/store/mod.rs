//! Checkpoint storage for the consumer
//!
//! Checkpoints are keyed by `(namespace, shard)`. Every store carries the
//! application name it was built for and derives the namespace as
//! `"{app}:{stream}"`, so several applications can share one backend.

use async_trait::async_trait;
use std::sync::Arc;

pub mod batched;
#[cfg(feature = "dynamodb-store")]
pub mod dynamodb;
pub mod memory;

use crate::error::CheckpointError;

/// Trait for checkpoint storage implementations
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Retrieve the checkpoint for a shard; `None` if never set
    async fn get_checkpoint(&self, stream_name: &str, shard_id: &str) -> anyhow::Result<Option<String>>;

    /// Record `sequence_number` as the last processed record of a shard.
    ///
    /// Fails with [`CheckpointError::EmptyToken`] for an empty sequence number.
    async fn set_checkpoint(&self, stream_name: &str, shard_id: &str, sequence_number: &str) -> anyhow::Result<()>;

    /// Write a buffered checkpoint of one shard through to the backing
    /// store. Called before the shard is handed back.
    async fn flush_shard(&self, _stream_name: &str, _shard_id: &str) -> anyhow::Result<()> {
        Ok(())
    }

    /// Flush anything buffered. Calling it twice must not corrupt state.
    async fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl<T: CheckpointStore + ?Sized> CheckpointStore for Arc<T> {
    async fn get_checkpoint(&self, stream_name: &str, shard_id: &str) -> anyhow::Result<Option<String>> {
        (**self).get_checkpoint(stream_name, shard_id).await
    }

    async fn set_checkpoint(&self, stream_name: &str, shard_id: &str, sequence_number: &str) -> anyhow::Result<()> {
        (**self).set_checkpoint(stream_name, shard_id, sequence_number).await
    }

    async fn flush_shard(&self, stream_name: &str, shard_id: &str) -> anyhow::Result<()> {
        (**self).flush_shard(stream_name, shard_id).await
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        (**self).shutdown().await
    }
}

/// Namespace a store files checkpoints under
pub fn namespace(app_name: &str, stream_name: &str) -> String {
    format!("{}:{}", app_name, stream_name)
}

pub(crate) fn validate_token(sequence_number: &str) -> Result<(), CheckpointError> {
    if sequence_number.is_empty() {
        Err(CheckpointError::EmptyToken)
    } else {
        Ok(())
    }
}

pub use batched::{BatchConfig, BatchedCheckpointStore};
#[cfg(feature = "dynamodb-store")]
pub use dynamodb::DynamoDbCheckpointStore;
pub use memory::InMemoryCheckpointStore;
