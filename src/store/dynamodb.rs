use anyhow::Context;
use async_trait::async_trait;
use aws_sdk_dynamodb::{types::AttributeValue, Client as DynamoClient};
use aws_smithy_types::error::display::DisplayErrorContext;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};

use crate::retry::{ExponentialBackoff, RetryConfig, RetryHandle};
use crate::store::{namespace, validate_token, CheckpointStore};

/// Convert an SDK error into an `anyhow` error whose message keeps the AWS
/// error code, which the retry classifier relies on
pub(crate) fn describe_sdk_error<E>(err: E) -> anyhow::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    anyhow::anyhow!(DisplayErrorContext(&err).to_string())
}

/// Checkpoints in a DynamoDB table keyed by `namespace` (hash) and `shard_id` (range)
#[derive(Debug, Clone)]
pub struct DynamoDbCheckpointStore {
    client: DynamoClient,
    table_name: String,
    app_name: String,
    retry_config: RetryConfig,
    backoff: ExponentialBackoff,
}

impl DynamoDbCheckpointStore {
    pub fn builder() -> DynamoDbCheckpointStoreBuilder {
        DynamoDbCheckpointStoreBuilder::new()
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    fn key(&self, stream_name: &str, shard_id: &str) -> [(String, AttributeValue); 2] {
        [
            (
                "namespace".to_string(),
                AttributeValue::S(namespace(&self.app_name, stream_name)),
            ),
            ("shard_id".to_string(), AttributeValue::S(shard_id.to_string())),
        ]
    }
}

#[async_trait]
impl CheckpointStore for DynamoDbCheckpointStore {
    #[instrument(skip(self), fields(table = %self.table_name, app = %self.app_name))]
    async fn get_checkpoint(&self, stream_name: &str, shard_id: &str) -> anyhow::Result<Option<String>> {
        let mut retry = RetryHandle::new(self.retry_config.clone(), self.backoff.clone());

        trace!("Getting checkpoint from DynamoDB");

        let checkpoint = retry
            .retry(
                || async {
                    let response = self
                        .client
                        .get_item()
                        .table_name(&self.table_name)
                        .set_key(Some(self.key(stream_name, shard_id).into_iter().collect()))
                        .consistent_read(true)
                        .send()
                        .await
                        .map_err(describe_sdk_error)
                        .context("Failed to get checkpoint from DynamoDB")?;

                    let checkpoint = response
                        .item
                        .and_then(|item| item.get("sequence_number").cloned())
                        .and_then(|attr| attr.as_s().ok().map(|s| s.to_string()));

                    Ok::<Option<String>, anyhow::Error>(checkpoint)
                },
                &CancellationToken::new(),
            )
            .await?;

        debug!(checkpoint = ?checkpoint, "Retrieved checkpoint from DynamoDB");

        Ok(checkpoint)
    }

    #[instrument(skip(self), fields(table = %self.table_name, app = %self.app_name))]
    async fn set_checkpoint(&self, stream_name: &str, shard_id: &str, sequence_number: &str) -> anyhow::Result<()> {
        validate_token(sequence_number)?;
        let mut retry = RetryHandle::new(self.retry_config.clone(), self.backoff.clone());

        retry
            .retry(
                || async {
                    let [namespace_attr, shard_attr] = self.key(stream_name, shard_id);
                    self.client
                        .put_item()
                        .table_name(&self.table_name)
                        .item(namespace_attr.0, namespace_attr.1)
                        .item(shard_attr.0, shard_attr.1)
                        .item("sequence_number", AttributeValue::S(sequence_number.to_string()))
                        .send()
                        .await
                        .map_err(describe_sdk_error)
                        .context("Failed to save checkpoint to DynamoDB")?;

                    Ok::<(), anyhow::Error>(())
                },
                &CancellationToken::new(),
            )
            .await?;

        debug!("Saved checkpoint to DynamoDB");
        Ok(())
    }
}

#[derive(Debug)]
pub struct DynamoDbCheckpointStoreBuilder {
    client: Option<DynamoClient>,
    table_name: Option<String>,
    app_name: Option<String>,
    retry_config: RetryConfig,
    backoff: Option<ExponentialBackoff>,
}

impl Default for DynamoDbCheckpointStoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DynamoDbCheckpointStoreBuilder {
    pub fn new() -> Self {
        Self {
            client: None,
            table_name: None,
            app_name: None,
            retry_config: RetryConfig::default(),
            backoff: None,
        }
    }

    pub fn with_client(mut self, client: DynamoClient) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_table_name(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = Some(table_name.into());
        self
    }

    pub fn with_app_name(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = Some(app_name.into());
        self
    }

    pub fn with_retry_config(mut self, config: RetryConfig) -> Self {
        self.retry_config = config;
        self
    }

    pub fn with_backoff(mut self, backoff: ExponentialBackoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn build(self) -> anyhow::Result<DynamoDbCheckpointStore> {
        let backoff = self.backoff.unwrap_or_else(|| self.retry_config.backoff());
        Ok(DynamoDbCheckpointStore {
            client: self.client.ok_or_else(|| anyhow::anyhow!("DynamoDB client is required"))?,
            table_name: self.table_name.ok_or_else(|| anyhow::anyhow!("Table name is required"))?,
            app_name: self.app_name.ok_or_else(|| anyhow::anyhow!("Application name is required"))?,
            retry_config: self.retry_config,
            backoff,
        })
    }
}
