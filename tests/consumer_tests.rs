use anyhow::Result;
use aws_sdk_kinesis::types::ShardIteratorType;
use kinesis_lease_consumer::store::{BatchConfig, BatchedCheckpointStore, InMemoryCheckpointStore};
use kinesis_lease_consumer::{CheckpointStore, Consumer, ConsumerError};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

mod common;

use common::{CollectingProcessor, ScriptedClient, ShardEnd};

#[tokio::test]
async fn test_pooled_consumer_flushes_batched_checkpoints_on_shutdown() -> Result<()> {
    common::init_logging();

    let client = ScriptedClient::new();
    client
        .add_shard("shard-1", vec![vec!["1", "2", "3"], vec!["4"]], ShardEnd::Closed)
        .await;
    client
        .add_shard("shard-2", vec![vec!["10", "11"]], ShardEnd::Open)
        .await;

    let backend = Arc::new(InMemoryCheckpointStore::new("billing"));
    let store = BatchedCheckpointStore::new(
        backend.clone(),
        BatchConfig {
            flush_interval: Duration::from_secs(3600),
            ..Default::default()
        },
    );
    let processor = CollectingProcessor::default();

    let consumer = Consumer::builder(client, store, processor.clone())
        .with_config(common::test_config("billing"))
        .with_worker_count(3)
        .build()?;

    let cancel = CancellationToken::new();
    let handle = {
        let cancel = cancel.clone();
        tokio::spawn(async move { consumer.run(cancel).await })
    };

    common::wait_for(
        || {
            let processor = processor.clone();
            async move { processor.seen().await.len() == 6 && processor.closed().await.len() == 1 }
        },
        Duration::from_secs(5),
    )
    .await?;

    // nothing reaches the backend before the flush
    assert_eq!(backend.get_checkpoint("test-stream", "shard-1").await?, None);

    cancel.cancel();
    handle.await??;

    assert_eq!(
        backend.get_checkpoint("test-stream", "shard-1").await?,
        Some("4".to_string())
    );
    assert_eq!(
        backend.get_checkpoint("test-stream", "shard-2").await?,
        Some("11".to_string())
    );
    assert_eq!(processor.closed().await, vec!["shard-1"]);
    Ok(())
}

#[tokio::test]
async fn test_restart_resumes_after_checkpoint() -> Result<()> {
    common::init_logging();

    let store = InMemoryCheckpointStore::new("billing");
    store.set_checkpoint("test-stream", "shard-1", "2").await?;

    let client = ScriptedClient::new();
    client.add_shard("shard-1", vec![vec!["3"]], ShardEnd::Closed).await;
    let processor = CollectingProcessor::default();

    let consumer = Consumer::builder(client.clone(), store.clone(), processor.clone())
        .with_config(common::test_config("billing"))
        .build()?;

    let cancel = CancellationToken::new();
    let handle = {
        let cancel = cancel.clone();
        tokio::spawn(async move { consumer.run(cancel).await })
    };

    common::wait_for(
        || {
            let processor = processor.clone();
            async move { !processor.closed().await.is_empty() }
        },
        Duration::from_secs(5),
    )
    .await?;
    cancel.cancel();
    handle.await??;

    assert_eq!(
        client.iterator_requests().await,
        vec![(
            "shard-1".to_string(),
            ShardIteratorType::AfterSequenceNumber,
            Some("2".to_string())
        )]
    );
    assert_eq!(processor.seen().await, vec!["3"]);
    assert_eq!(
        store.get_checkpoint("test-stream", "shard-1").await?,
        Some("3".to_string())
    );
    Ok(())
}

#[tokio::test]
async fn test_invalid_config_is_rejected_at_build() {
    let result = Consumer::builder(
        ScriptedClient::new(),
        InMemoryCheckpointStore::new("billing"),
        CollectingProcessor::default(),
    )
    .with_app_name("billing")
    .with_stream_name("test-stream")
    .with_worker_count(0)
    .build();

    assert!(matches!(result, Err(ConsumerError::ConfigError(_))));
}
