//! Test utilities and mock implementations for exercising the consumer


use aws_sdk_kinesis::types::{Record, Shard};
use std::future::Future;
use std::sync::Once;
use std::time::Duration;

static INIT: Once = Once::new();

/// Install a test-writer tracing subscriber once per process. `RUST_LOG`
/// overrides the default filter.
pub fn init_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("kinesis_lease_consumer=debug")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Helper functions for creating test data
pub struct TestUtils;

impl TestUtils {
    /// Create a test record with given sequence number and data
    pub fn create_test_record(sequence_number: &str, data: &[u8]) -> Record {
        Record::builder()
            .sequence_number(sequence_number)
            .data(aws_smithy_types::Blob::new(data.to_vec()))
            .partition_key("test-partition-key")
            .build()
            .expect("Failed to build test record")
    }

    /// Create a test shard with given ID
    pub fn create_test_shard(shard_id: &str) -> Shard {
        Shard::builder()
            .shard_id(shard_id)
            .build()
            .expect("Failed to build test shard")
    }

    /// Records with sequence numbers `sequence-0` up to `sequence-{count-1}`
    pub fn create_test_records(count: usize) -> Vec<Record> {
        (0..count)
            .map(|i| {
                Self::create_test_record(
                    &format!("sequence-{}", i),
                    format!("data-{}", i).as_bytes(),
                )
            })
            .collect()
    }
}

/// Poll `check` every 10ms until it holds or `timeout` elapses
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_test_record() {
        let record = TestUtils::create_test_record("seq-1", b"test-data");
        assert_eq!(record.sequence_number(), "seq-1");
        assert_eq!(record.data().as_ref(), b"test-data");
        assert_eq!(record.partition_key(), "test-partition-key");
    }

    #[test]
    fn test_create_test_records() {
        let records = TestUtils::create_test_records(3);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].sequence_number(), "sequence-0");
        assert_eq!(records[2].sequence_number(), "sequence-2");
    }

    #[tokio::test]
    async fn test_wait_for_times_out() {
        init_logging();
        let result = wait_for(|| async { false }, Duration::from_millis(30)).await;
        assert!(result.is_err());
        assert!(wait_for(|| async { true }, Duration::from_millis(30)).await.is_ok());
    }
}
