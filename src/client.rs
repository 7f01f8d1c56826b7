//! Stream client seam
//!
//! The consumer only needs three calls from the stream service. They are
//! expressed here as a trait so the AWS SDK client and test doubles are
//! interchangeable.

use async_trait::async_trait;
use aws_sdk_kinesis::{
    error::{ProvideErrorMetadata, SdkError},
    types::{Record, Shard, ShardIteratorType},
    Client,
};
use aws_smithy_types::error::display::DisplayErrorContext;
use chrono::{DateTime, Utc};
use std::time::SystemTime;
use thiserror::Error;
use tracing::trace;

use crate::retry::{classify_code, Classify, ErrorClass};

/// Errors surfaced by the stream client
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KinesisClientError {
    #[error("Iterator expired")]
    ExpiredIterator,

    #[error("Provisioned throughput exceeded")]
    ThroughputExceeded,

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Internal failure: {0}")]
    InternalFailure(String),

    #[error("Access denied")]
    AccessDenied,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("KMS error: {0}")]
    KmsError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("{0}")]
    Other(String),
}

impl Classify for KinesisClientError {
    fn class(&self) -> ErrorClass {
        match self {
            KinesisClientError::ExpiredIterator
            | KinesisClientError::ThroughputExceeded
            | KinesisClientError::ServiceUnavailable(_)
            | KinesisClientError::InternalFailure(_)
            | KinesisClientError::Timeout(_)
            | KinesisClientError::ConnectionError(_) => ErrorClass::Recoverable,
            KinesisClientError::AccessDenied
            | KinesisClientError::InvalidArgument(_)
            | KinesisClientError::ResourceNotFound(_)
            | KinesisClientError::KmsError(_) => ErrorClass::Fatal,
            KinesisClientError::Other(msg) => crate::retry::classify_message(msg),
        }
    }
}

impl KinesisClientError {
    /// Map an AWS SDK error onto the client error taxonomy
    pub fn from_sdk<E, R>(err: SdkError<E, R>) -> Self
    where
        E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
        R: std::fmt::Debug + Send + Sync + 'static,
    {
        match err {
            SdkError::TimeoutError(_) => KinesisClientError::Timeout("request timed out".to_string()),
            SdkError::DispatchFailure(failure) => {
                KinesisClientError::ConnectionError(format!("{:?}", failure))
            }
            SdkError::ServiceError(context) => {
                let service_err = context.err();
                let message = service_err.message().unwrap_or_default().to_string();
                match service_err.code() {
                    Some(code) => Self::from_code(code, message),
                    None => KinesisClientError::Other(DisplayErrorContext(service_err).to_string()),
                }
            }
            other => KinesisClientError::Other(DisplayErrorContext(&other).to_string()),
        }
    }

    fn from_code(code: &str, message: String) -> Self {
        match code {
            "ExpiredIteratorException" => KinesisClientError::ExpiredIterator,
            "ProvisionedThroughputExceededException"
            | "LimitExceededException"
            | "ThrottlingException"
            | "KMSThrottlingException" => KinesisClientError::ThroughputExceeded,
            "ServiceUnavailable" | "ServiceUnavailableException" => {
                KinesisClientError::ServiceUnavailable(message)
            }
            "InternalFailure" | "InternalFailureException" | "InternalServerError" => {
                KinesisClientError::InternalFailure(message)
            }
            "AccessDeniedException" => KinesisClientError::AccessDenied,
            "InvalidArgumentException" => KinesisClientError::InvalidArgument(message),
            "ResourceNotFoundException" => KinesisClientError::ResourceNotFound(message),
            c if c.starts_with("KMS") => KinesisClientError::KmsError(message),
            c => match classify_code(c) {
                ErrorClass::Recoverable => KinesisClientError::ServiceUnavailable(format!("{}: {}", c, message)),
                ErrorClass::Fatal => KinesisClientError::Other(format!("{}: {}", c, message)),
            },
        }
    }
}

/// One GetRecords response
#[derive(Debug, Clone, Default)]
pub struct RecordBatch {
    pub records: Vec<Record>,
    /// `None` means the shard is closed and fully read
    pub next_iterator: Option<String>,
    /// `Some(0)` when the iterator is at the tip of the shard
    pub millis_behind_latest: Option<i64>,
}

#[async_trait]
pub trait KinesisClientTrait: Send + Sync {
    /// List one page of shards, continuing from `next_token` when given
    async fn list_shards(
        &self,
        stream_name: &str,
        next_token: Option<&str>,
    ) -> Result<(Vec<Shard>, Option<String>), KinesisClientError>;

    async fn get_shard_iterator(
        &self,
        stream_name: &str,
        shard_id: &str,
        iterator_type: ShardIteratorType,
        sequence_number: Option<&str>,
        timestamp: Option<&DateTime<Utc>>,
    ) -> Result<String, KinesisClientError>;

    async fn get_records(&self, iterator: &str, limit: i32) -> Result<RecordBatch, KinesisClientError>;
}

#[async_trait]
impl<T: KinesisClientTrait + ?Sized> KinesisClientTrait for std::sync::Arc<T> {
    async fn list_shards(
        &self,
        stream_name: &str,
        next_token: Option<&str>,
    ) -> Result<(Vec<Shard>, Option<String>), KinesisClientError> {
        (**self).list_shards(stream_name, next_token).await
    }

    async fn get_shard_iterator(
        &self,
        stream_name: &str,
        shard_id: &str,
        iterator_type: ShardIteratorType,
        sequence_number: Option<&str>,
        timestamp: Option<&DateTime<Utc>>,
    ) -> Result<String, KinesisClientError> {
        (**self)
            .get_shard_iterator(stream_name, shard_id, iterator_type, sequence_number, timestamp)
            .await
    }

    async fn get_records(&self, iterator: &str, limit: i32) -> Result<RecordBatch, KinesisClientError> {
        (**self).get_records(iterator, limit).await
    }
}

#[async_trait]
impl KinesisClientTrait for Client {
    async fn list_shards(
        &self,
        stream_name: &str,
        next_token: Option<&str>,
    ) -> Result<(Vec<Shard>, Option<String>), KinesisClientError> {
        // ListShards rejects StreamName together with NextToken
        let req = match next_token {
            Some(token) => self.list_shards().next_token(token),
            None => self.list_shards().stream_name(stream_name),
        };

        let response = req.send().await.map_err(KinesisClientError::from_sdk)?;
        let next = response.next_token().map(String::from);
        Ok((response.shards.unwrap_or_default(), next))
    }

    async fn get_shard_iterator(
        &self,
        stream_name: &str,
        shard_id: &str,
        iterator_type: ShardIteratorType,
        sequence_number: Option<&str>,
        timestamp: Option<&DateTime<Utc>>,
    ) -> Result<String, KinesisClientError> {
        let mut req = self
            .get_shard_iterator()
            .stream_name(stream_name)
            .shard_id(shard_id)
            .shard_iterator_type(iterator_type);

        if let Some(seq) = sequence_number {
            req = req.starting_sequence_number(seq);
        }

        if let Some(ts) = timestamp {
            let system_time: SystemTime = (*ts).into();
            req = req.timestamp(aws_smithy_types::DateTime::from(system_time));
        }

        let response = req.send().await.map_err(KinesisClientError::from_sdk)?;
        response
            .shard_iterator
            .ok_or_else(|| KinesisClientError::Other(format!("no iterator returned for shard {}", shard_id)))
    }

    async fn get_records(&self, iterator: &str, limit: i32) -> Result<RecordBatch, KinesisClientError> {
        let response = self
            .get_records()
            .shard_iterator(iterator)
            .limit(limit)
            .send()
            .await
            .map_err(KinesisClientError::from_sdk)?;

        trace!(
            records = response.records().len(),
            millis_behind = ?response.millis_behind_latest(),
            "GetRecords returned"
        );

        Ok(RecordBatch {
            records: response.records().to_vec(),
            next_iterator: response.next_shard_iterator().map(String::from),
            millis_behind_latest: response.millis_behind_latest(),
        })
    }
}
