//! Kinesis Lease Consumer - a partitioned AWS Kinesis stream consumer
//!
//! The consumer discovers shards, scans each one from its last checkpoint
//! and hands every record to a [`RecordProcessor`]. Several processes can
//! share a stream by coordinating through fenced shard leases; a single
//! process can simply scan every shard.
//!
//! ```no_run
//! use kinesis_lease_consumer::{
//!     store::InMemoryCheckpointStore, Consumer, ProcessingError, RecordProcessor, ScanStatus,
//! };
//! use aws_sdk_kinesis::types::Record;
//! use tokio_util::sync::CancellationToken;
//!
//! struct Printer;
//!
//! #[async_trait::async_trait]
//! impl RecordProcessor for Printer {
//!     async fn process_record(&self, record: &Record) -> Result<ScanStatus, ProcessingError> {
//!         println!("{}", record.sequence_number());
//!         Ok(ScanStatus::Continue)
//!     }
//! }
//!
//! # async fn run(client: aws_sdk_kinesis::Client) -> anyhow::Result<()> {
//! let consumer = Consumer::builder(client, InMemoryCheckpointStore::new("printer"), Printer)
//!     .with_app_name("printer")
//!     .with_stream_name("orders")
//!     .build()?;
//!
//! consumer.run(CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod consumer;
pub mod error;
pub mod lease;
pub mod pool;
pub mod retry;
pub mod scanner;
pub mod sequence;
pub mod shards;
pub mod store;

// Make test utilities available for integration tests
#[cfg(any(test, feature = "test-utils"))]
pub mod test;

pub use client::{KinesisClientError, KinesisClientTrait, RecordBatch};
pub use consumer::{
    AllShardsGroup, Assignment, Consumer, ConsumerBuilder, ConsumerConfig, LeaseGroup, ShardFailure, ShardGroup,
};
pub use error::{CheckpointError, ConsumerError, ProcessingError, Result};
pub use retry::{Backoff, Classify, ErrorClass, ExponentialBackoff, RetryConfig};
pub use scanner::{InitialPosition, RecordProcessor, ScanOutcome, ScanStatus, ShardScanner};

// Re-export main traits
pub use crate::lease::LeaseStorage;
pub use crate::store::CheckpointStore;

// Re-export implementations
pub use crate::lease::{InMemoryLeaseStorage, LeaseConfig, LeaseManager};
pub use crate::pool::WorkerPool;
pub use crate::shards::ShardTracker;
pub use crate::store::{BatchedCheckpointStore, InMemoryCheckpointStore};

#[cfg(feature = "dynamodb-store")]
pub use crate::lease::DynamoDbLeaseStorage;
#[cfg(feature = "dynamodb-store")]
pub use crate::store::DynamoDbCheckpointStore;
