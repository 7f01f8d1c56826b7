// tests/common/mod.rs
#![allow(dead_code)]

use async_trait::async_trait;
use aws_sdk_kinesis::types::{Record, Shard, ShardIteratorType};
use chrono::{DateTime, Utc};
use kinesis_lease_consumer::{
    ConsumerConfig, KinesisClientError, KinesisClientTrait, ProcessingError, RecordBatch, RecordProcessor,
    ScanStatus,
};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::sync::Mutex;

static INIT: Once = Once::new();

pub fn init_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("kinesis_lease_consumer=debug".parse().expect("valid directive")),
            )
            .with_test_writer()
            .with_thread_ids(true)
            .try_init()
            .ok();
    });
}

pub fn test_config(app_name: &str) -> ConsumerConfig {
    ConsumerConfig {
        app_name: app_name.to_string(),
        stream_name: "test-stream".to_string(),
        scan_interval: Duration::from_millis(20),
        ..Default::default()
    }
}

pub fn record(sequence_number: &str) -> Record {
    Record::builder()
        .sequence_number(sequence_number)
        .data(aws_smithy_types::Blob::new(sequence_number.as_bytes().to_vec()))
        .partition_key("test-partition-key")
        .build()
        .expect("Failed to build test record")
}

fn shard(shard_id: &str) -> Shard {
    Shard::builder()
        .shard_id(shard_id)
        .build()
        .expect("Failed to build test shard")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardEnd {
    /// Report the shard closed once its batches are served
    Closed,
    /// Keep answering with caught-up empty batches
    Open,
}

/// Stream client serving scripted batches per shard
#[derive(Debug, Clone, Default)]
pub struct ScriptedClient {
    shards: Arc<Mutex<Vec<String>>>,
    batches: Arc<Mutex<HashMap<String, (VecDeque<Vec<Record>>, ShardEnd)>>>,
    iterator_requests: Arc<Mutex<Vec<(String, ShardIteratorType, Option<String>)>>>,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_shard(&self, shard_id: &str, batches: Vec<Vec<&str>>, end: ShardEnd) {
        self.shards.lock().await.push(shard_id.to_string());
        let batches = batches
            .into_iter()
            .map(|batch| batch.into_iter().map(record).collect())
            .collect();
        self.batches
            .lock()
            .await
            .insert(shard_id.to_string(), (batches, end));
    }

    pub async fn iterator_requests(&self) -> Vec<(String, ShardIteratorType, Option<String>)> {
        self.iterator_requests.lock().await.clone()
    }
}

#[async_trait]
impl KinesisClientTrait for ScriptedClient {
    async fn list_shards(
        &self,
        _stream_name: &str,
        _next_token: Option<&str>,
    ) -> Result<(Vec<Shard>, Option<String>), KinesisClientError> {
        let shards = self.shards.lock().await.iter().map(|id| shard(id)).collect();
        Ok((shards, None))
    }

    async fn get_shard_iterator(
        &self,
        _stream_name: &str,
        shard_id: &str,
        iterator_type: ShardIteratorType,
        sequence_number: Option<&str>,
        _timestamp: Option<&DateTime<Utc>>,
    ) -> Result<String, KinesisClientError> {
        self.iterator_requests.lock().await.push((
            shard_id.to_string(),
            iterator_type,
            sequence_number.map(String::from),
        ));
        Ok(format!("{}:0", shard_id))
    }

    async fn get_records(&self, iterator: &str, _limit: i32) -> Result<RecordBatch, KinesisClientError> {
        let (shard_id, position) = iterator
            .split_once(':')
            .ok_or_else(|| KinesisClientError::InvalidArgument(iterator.to_string()))?;
        let position: usize = position
            .parse()
            .map_err(|_| KinesisClientError::InvalidArgument(iterator.to_string()))?;

        let mut batches = self.batches.lock().await;
        let (queue, end) = batches
            .get_mut(shard_id)
            .ok_or_else(|| KinesisClientError::ResourceNotFound(shard_id.to_string()))?;

        match queue.pop_front() {
            Some(records) => Ok(RecordBatch {
                records,
                next_iterator: Some(format!("{}:{}", shard_id, position + 1)),
                millis_behind_latest: Some(1000),
            }),
            None if *end == ShardEnd::Closed => Ok(RecordBatch::default()),
            None => Ok(RecordBatch {
                records: vec![],
                next_iterator: Some(iterator.to_string()),
                millis_behind_latest: Some(0),
            }),
        }
    }
}

/// Processor that remembers which records it saw
#[derive(Debug, Clone, Default)]
pub struct CollectingProcessor {
    seen: Arc<Mutex<Vec<String>>>,
    closed: Arc<Mutex<Vec<String>>>,
}

impl CollectingProcessor {
    pub async fn seen(&self) -> Vec<String> {
        self.seen.lock().await.clone()
    }

    pub async fn closed(&self) -> Vec<String> {
        self.closed.lock().await.clone()
    }
}

#[async_trait]
impl RecordProcessor for CollectingProcessor {
    async fn process_record(&self, record: &Record) -> Result<ScanStatus, ProcessingError> {
        self.seen.lock().await.push(record.sequence_number().to_string());
        Ok(ScanStatus::Continue)
    }

    async fn shard_closed(&self, _stream_name: &str, shard_id: &str) -> Result<(), ProcessingError> {
        self.closed.lock().await.push(shard_id.to_string());
        Ok(())
    }
}

pub async fn wait_for<F, Fut>(mut check: F, timeout: Duration) -> anyhow::Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while !check().await {
        if start.elapsed() > timeout {
            anyhow::bail!("Condition not met within {:?}", timeout);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}
