use crate::store::{namespace, validate_token, CheckpointStore};
use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;
use tracing::{debug, instrument, trace};

/// In-memory implementation of checkpoint storage
#[derive(Debug, Clone)]
pub struct InMemoryCheckpointStore {
    app_name: String,
    checkpoints: Arc<RwLock<HashMap<(String, String), String>>>,
}

impl Default for InMemoryCheckpointStore {
    fn default() -> Self {
        Self::new("default")
    }
}

impl InMemoryCheckpointStore {
    pub fn new(app_name: impl Into<String>) -> Self {
        debug!("Initializing in-memory checkpoint store");
        Self {
            app_name: app_name.into(),
            checkpoints: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Snapshot of every stored checkpoint, keyed by `(namespace, shard)`
    pub async fn all_checkpoints(&self) -> HashMap<(String, String), String> {
        self.checkpoints.read().await.clone()
    }

    fn key(&self, stream_name: &str, shard_id: &str) -> (String, String) {
        (namespace(&self.app_name, stream_name), shard_id.to_string())
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    #[instrument(skip(self), fields(app = %self.app_name))]
    async fn get_checkpoint(&self, stream_name: &str, shard_id: &str) -> anyhow::Result<Option<String>> {
        let checkpoint = self
            .checkpoints
            .read()
            .await
            .get(&self.key(stream_name, shard_id))
            .cloned();

        trace!(checkpoint = ?checkpoint, "Retrieved checkpoint from memory");
        Ok(checkpoint)
    }

    #[instrument(skip(self), fields(app = %self.app_name))]
    async fn set_checkpoint(&self, stream_name: &str, shard_id: &str, sequence_number: &str) -> anyhow::Result<()> {
        validate_token(sequence_number)?;

        self.checkpoints
            .write()
            .await
            .insert(self.key(stream_name, shard_id), sequence_number.to_string());

        trace!("Checkpoint saved to memory");
        Ok(())
    }
}
