//! Write-behind checkpoint batching
//!
//! [`BatchedCheckpointStore`] keeps the latest sequence number per shard in
//! memory and writes them to a backing store on a fixed interval and on
//! [`CheckpointStore::shutdown`]. Checkpoints set after the last successful
//! flush are lost if the process dies, so processing is at-least-once.

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::error::CheckpointError;
use crate::lease::LeaseError;
use crate::retry::{RetryConfig, RetryError, RetryHandle};
use crate::sequence;
use crate::store::{validate_token, CheckpointStore};

/// Configuration for checkpoint batching
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// How often buffered checkpoints are written to the backing store
    pub flush_interval: Duration,
    /// Retry policy for each flushed checkpoint
    pub retry: RetryConfig,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(60),
            retry: RetryConfig::default(),
        }
    }
}

type ShardKey = (String, String);

#[derive(Debug, Clone)]
struct Entry {
    sequence_number: String,
    dirty: bool,
}

struct Inner<B> {
    backend: B,
    config: BatchConfig,
    checkpoints: Mutex<HashMap<ShardKey, Entry>>,
}

/// Checkpoint store that buffers writes in memory and flushes periodically
pub struct BatchedCheckpointStore<B: CheckpointStore + 'static> {
    inner: Arc<Inner<B>>,
    cancel: CancellationToken,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl<B: CheckpointStore + 'static> BatchedCheckpointStore<B> {
    /// Wrap `backend`. When called inside a Tokio runtime a background task
    /// flushes every `flush_interval`; otherwise only explicit flushes and
    /// shutdown write through.
    pub fn new(backend: B, config: BatchConfig) -> Self {
        let inner = Arc::new(Inner {
            backend,
            config,
            checkpoints: Mutex::new(HashMap::new()),
        });
        let cancel = CancellationToken::new();

        let flusher = match tokio::runtime::Handle::try_current() {
            Ok(handle) => Some(handle.spawn(Self::flush_loop(inner.clone(), cancel.clone()))),
            Err(_) => {
                warn!("No Tokio runtime available, checkpoints flush only on shutdown");
                None
            }
        };

        Self {
            inner,
            cancel,
            flusher: Mutex::new(flusher),
        }
    }

    async fn flush_loop(inner: Arc<Inner<B>>, cancel: CancellationToken) {
        let period = inner.config.flush_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Checkpoint flush loop stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = Self::flush_inner(&inner).await {
                        error!(error = %e, "Periodic checkpoint flush failed");
                    }
                }
            }
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.inner.config
    }

    /// Write every dirty checkpoint to the backing store now
    pub async fn flush(&self) -> anyhow::Result<()> {
        Self::flush_inner(&self.inner).await
    }

    /// Number of checkpoints not yet written to the backing store
    pub fn pending(&self) -> usize {
        self.inner.checkpoints.lock().values().filter(|e| e.dirty).count()
    }

    async fn flush_inner(inner: &Inner<B>) -> anyhow::Result<()> {
        let dirty: Vec<(ShardKey, String)> = inner
            .checkpoints
            .lock()
            .iter()
            .filter(|(_, entry)| entry.dirty)
            .map(|(key, entry)| (key.clone(), entry.sequence_number.clone()))
            .collect();

        if dirty.is_empty() {
            trace!("No checkpoints to flush");
            return Ok(());
        }

        debug!(count = dirty.len(), "Flushing checkpoints");
        Self::write_all(inner, dirty).await
    }

    async fn write_all(inner: &Inner<B>, dirty: Vec<(ShardKey, String)>) -> anyhow::Result<()> {
        let writes = dirty.into_iter().map(|((stream_name, shard_id), sequence_number)| async move {
            // flushes run to completion even while the consumer shuts down
            let never = CancellationToken::new();
            let mut retry = RetryHandle::new(inner.config.retry.clone(), inner.config.retry.backoff());
            let result = retry
                .retry(
                    || inner.backend.set_checkpoint(&stream_name, &shard_id, &sequence_number),
                    &never,
                )
                .await;
            ((stream_name, shard_id), sequence_number, result)
        });

        let mut failures = Vec::new();
        for (key, sequence_number, result) in join_all(writes).await {
            match result {
                Ok(()) => {
                    let mut checkpoints = inner.checkpoints.lock();
                    if let Some(entry) = checkpoints.get_mut(&key) {
                        // a newer Set may have landed while we were writing
                        if entry.sequence_number == sequence_number {
                            entry.dirty = false;
                        }
                    }
                }
                Err(RetryError::Fatal(e)) if e.downcast_ref::<LeaseError>().is_some_and(LeaseError::is_conflict) => {
                    // the shard belongs to another owner now, which resumes from its own checkpoint
                    warn!(
                        stream = %key.0,
                        shard_id = %key.1,
                        sequence = %sequence_number,
                        "Lease lost, dropping buffered checkpoint"
                    );
                    inner.checkpoints.lock().remove(&key);
                }
                Err(e) => {
                    warn!(
                        stream = %key.0,
                        shard_id = %key.1,
                        sequence = %sequence_number,
                        error = %e,
                        "Failed to flush checkpoint"
                    );
                    failures.push(format!("{}/{}: {}", key.0, key.1, e));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(CheckpointError::FlushFailed(failures.join("; ")).into())
        }
    }
}

#[async_trait]
impl<B: CheckpointStore + 'static> CheckpointStore for BatchedCheckpointStore<B> {
    async fn get_checkpoint(&self, stream_name: &str, shard_id: &str) -> anyhow::Result<Option<String>> {
        let key = (stream_name.to_string(), shard_id.to_string());
        let buffered = self
            .inner
            .checkpoints
            .lock()
            .get(&key)
            .map(|entry| entry.sequence_number.clone());
        if buffered.is_some() {
            return Ok(buffered);
        }

        self.inner.backend.get_checkpoint(stream_name, shard_id).await
    }

    async fn set_checkpoint(&self, stream_name: &str, shard_id: &str, sequence_number: &str) -> anyhow::Result<()> {
        validate_token(sequence_number)?;

        let key = (stream_name.to_string(), shard_id.to_string());
        let mut checkpoints = self.inner.checkpoints.lock();
        match checkpoints.get_mut(&key) {
            Some(entry) if sequence::is_after(&entry.sequence_number, sequence_number) => {
                debug!(
                    shard_id = %shard_id,
                    current = %entry.sequence_number,
                    ignored = %sequence_number,
                    "Ignoring checkpoint older than the buffered one"
                );
            }
            Some(entry) => {
                if entry.sequence_number != sequence_number {
                    entry.sequence_number = sequence_number.to_string();
                    entry.dirty = true;
                }
            }
            None => {
                checkpoints.insert(
                    key,
                    Entry {
                        sequence_number: sequence_number.to_string(),
                        dirty: true,
                    },
                );
            }
        }

        Ok(())
    }

    async fn flush_shard(&self, stream_name: &str, shard_id: &str) -> anyhow::Result<()> {
        let key = (stream_name.to_string(), shard_id.to_string());
        let dirty = self
            .inner
            .checkpoints
            .lock()
            .get(&key)
            .filter(|entry| entry.dirty)
            .map(|entry| entry.sequence_number.clone());

        match dirty {
            Some(sequence_number) => {
                debug!(shard_id = %shard_id, sequence = %sequence_number, "Flushing shard checkpoint");
                Self::write_all(&self.inner, vec![(key, sequence_number)]).await
            }
            None => Ok(()),
        }
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        self.cancel.cancel();
        let flusher = self.flusher.lock().take();
        if let Some(handle) = flusher {
            if let Err(e) = handle.await {
                warn!(error = %e, "Checkpoint flush task ended abnormally");
            }
        }

        let result = self.flush().await;
        match &result {
            Ok(()) => info!("Checkpoints flushed on shutdown"),
            Err(e) => error!(error = %e, pending = self.pending(), "Checkpoints could not be flushed on shutdown"),
        }
        result?;

        self.inner.backend.shutdown().await
    }
}

impl<B: CheckpointStore + 'static> Drop for BatchedCheckpointStore<B> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_utils::verify_checkpoint;
    use crate::test::mocks::MockCheckpointStore;
    use pretty_assertions::assert_eq;

    fn fast_config(flush_interval: Duration) -> BatchConfig {
        BatchConfig {
            flush_interval,
            retry: RetryConfig {
                max_retries: Some(2),
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
            },
        }
    }

    #[tokio::test]
    async fn test_buffers_until_flush() -> anyhow::Result<()> {
        let backend = MockCheckpointStore::new();
        let store = BatchedCheckpointStore::new(backend.clone(), fast_config(Duration::from_secs(3600)));

        store.set_checkpoint("stream", "shard-1", "1").await?;
        store.set_checkpoint("stream", "shard-1", "2").await?;
        verify_checkpoint(&store, "stream", "shard-1", Some("2")).await?;
        assert_eq!(backend.get_save_count().await, 0);
        assert_eq!(store.pending(), 1);

        store.flush().await?;
        assert_eq!(backend.get_save_count().await, 1);
        assert_eq!(store.pending(), 0);
        verify_checkpoint(&backend, "stream", "shard-1", Some("2")).await?;

        // nothing new to write
        store.flush().await?;
        assert_eq!(backend.get_save_count().await, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_periodic_flush() -> anyhow::Result<()> {
        let backend = MockCheckpointStore::new();
        let store = BatchedCheckpointStore::new(backend.clone(), fast_config(Duration::from_millis(20)));

        store.set_checkpoint("stream", "shard-1", "5").await?;
        tokio::time::sleep(Duration::from_millis(100)).await;

        verify_checkpoint(&backend, "stream", "shard-1", Some("5")).await?;
        store.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_falls_through_to_backend() -> anyhow::Result<()> {
        let backend = MockCheckpointStore::new();
        backend.set_checkpoint("stream", "shard-1", "99").await?;
        let store = BatchedCheckpointStore::new(backend, fast_config(Duration::from_secs(3600)));

        verify_checkpoint(&store, "stream", "shard-1", Some("99")).await?;
        verify_checkpoint(&store, "stream", "shard-2", None).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_stale_tokens_are_ignored() -> anyhow::Result<()> {
        let store = BatchedCheckpointStore::new(MockCheckpointStore::new(), fast_config(Duration::from_secs(3600)));

        store.set_checkpoint("stream", "shard-1", "10").await?;
        store.set_checkpoint("stream", "shard-1", "9").await?;
        verify_checkpoint(&store, "stream", "shard-1", Some("10")).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_token_rejected() -> anyhow::Result<()> {
        let store = BatchedCheckpointStore::new(MockCheckpointStore::new(), fast_config(Duration::from_secs(3600)));

        let err = store.set_checkpoint("stream", "shard-1", "").await.unwrap_err();
        assert!(matches!(err.downcast_ref::<CheckpointError>(), Some(CheckpointError::EmptyToken)));
        assert_eq!(store.pending(), 0);
        verify_checkpoint(&store, "stream", "shard-1", None).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_recoverable_flush_failure_is_retried() -> anyhow::Result<()> {
        let backend = MockCheckpointStore::new();
        backend.mock_save_checkpoint(Err(anyhow::anyhow!("ThrottlingException: slow down"))).await;
        let store = BatchedCheckpointStore::new(backend.clone(), fast_config(Duration::from_secs(3600)));

        store.set_checkpoint("stream", "shard-1", "3").await?;
        store.flush().await?;

        verify_checkpoint(&backend, "stream", "shard-1", Some("3")).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_flush_shard_writes_only_that_shard() -> anyhow::Result<()> {
        let backend = MockCheckpointStore::new();
        let store = BatchedCheckpointStore::new(backend.clone(), fast_config(Duration::from_secs(3600)));
        store.set_checkpoint("stream", "shard-1", "3").await?;
        store.set_checkpoint("stream", "shard-2", "8").await?;

        store.flush_shard("stream", "shard-1").await?;
        verify_checkpoint(&backend, "stream", "shard-1", Some("3")).await?;
        verify_checkpoint(&backend, "stream", "shard-2", None).await?;
        assert_eq!(store.pending(), 1);

        // already clean
        store.flush_shard("stream", "shard-1").await?;
        assert_eq!(backend.get_save_count().await, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_lost_lease_drops_buffered_checkpoint() -> anyhow::Result<()> {
        let backend = MockCheckpointStore::new();
        let store = BatchedCheckpointStore::new(backend.clone(), fast_config(Duration::from_secs(3600)));
        store.set_checkpoint("stream", "shard-1", "3").await?;

        backend
            .mock_save_checkpoint(Err(LeaseError::Conflict { key: "shard-1".into() }.into()))
            .await;
        store.flush_shard("stream", "shard-1").await?;

        assert_eq!(store.pending(), 0);
        verify_checkpoint(&backend, "stream", "shard-1", None).await?;
        store.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_persistent_failure_surfaces_on_shutdown() -> anyhow::Result<()> {
        let backend = MockCheckpointStore::new();
        let store = BatchedCheckpointStore::new(backend.clone(), fast_config(Duration::from_secs(3600)));
        store.set_checkpoint("stream", "shard-1", "3").await?;

        backend.mock_save_checkpoint(Err(anyhow::anyhow!("access denied"))).await;
        let err = store.shutdown().await.expect_err("fatal flush failure must surface");
        assert!(matches!(err.downcast_ref::<CheckpointError>(), Some(CheckpointError::FlushFailed(_))));
        assert_eq!(store.pending(), 1);

        // a second shutdown retries the write and succeeds
        store.shutdown().await?;
        assert_eq!(store.pending(), 0);
        verify_checkpoint(&backend, "stream", "shard-1", Some("3")).await?;
        Ok(())
    }
}
