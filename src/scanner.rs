//! Per-shard scan loop
//!
//! A [`ShardScanner`] owns one shard's iterator. It resumes after the stored
//! checkpoint (or at the configured initial position when there is none),
//! pulls batches, hands each record to the application either directly or
//! through a shared [`crate::pool::WorkerPool`], and writes one checkpoint
//! per batch.
//!
//! Recoverable fetch failures re-derive the iterator from the last stored
//! checkpoint rather than reusing the failed one, after an attempt-indexed
//! backoff. The attempt counter resets on every successful fetch.

use async_trait::async_trait;
use aws_sdk_kinesis::types::{Record, ShardIteratorType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::client::KinesisClientTrait;
use crate::consumer::ConsumerConfig;
use crate::error::{ConsumerError, ProcessingError, Result};
use crate::lease::LeaseError;
use crate::pool::{Job, Submitter, WorkResult};
use crate::retry::{Backoff, Classify, ExponentialBackoff};
use crate::sequence;
use crate::store::CheckpointStore;

/// Where to start reading a shard that has no checkpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum InitialPosition {
    /// Oldest record still retained
    #[default]
    TrimHorizon,
    /// Only records written after the iterator is created
    Latest,
    AtTimestamp(DateTime<Utc>),
}

/// Returned by the record callback to keep going or end the scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStatus {
    Continue,
    Stop,
}

/// How a scan ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    /// The shard was read to its end
    Closed,
    /// The callback asked to stop
    Stopped,
    Cancelled,
}

/// Application logic invoked for every record
///
/// # Examples
///
/// ```rust
/// use kinesis_lease_consumer::{ProcessingError, RecordProcessor, ScanStatus};
/// use aws_sdk_kinesis::types::Record;
///
/// struct Printer;
///
/// #[async_trait::async_trait]
/// impl RecordProcessor for Printer {
///     async fn process_record(&self, record: &Record) -> Result<ScanStatus, ProcessingError> {
///         println!("{} bytes at {}", record.data().as_ref().len(), record.sequence_number());
///         Ok(ScanStatus::Continue)
///     }
/// }
/// ```
#[async_trait]
pub trait RecordProcessor: Send + Sync {
    /// Handle one record. An error stops this shard and is reported to the
    /// consumer; records before it stay checkpointed.
    async fn process_record(&self, record: &Record) -> std::result::Result<ScanStatus, ProcessingError>;

    /// Called once a shard has been read to its end. An error aborts the
    /// whole consumer.
    async fn shard_closed(&self, _stream_name: &str, _shard_id: &str) -> std::result::Result<(), ProcessingError> {
        Ok(())
    }
}

#[async_trait]
impl<T: RecordProcessor + ?Sized> RecordProcessor for Arc<T> {
    async fn process_record(&self, record: &Record) -> std::result::Result<ScanStatus, ProcessingError> {
        (**self).process_record(record).await
    }

    async fn shard_closed(&self, stream_name: &str, shard_id: &str) -> std::result::Result<(), ProcessingError> {
        (**self).shard_closed(stream_name, shard_id).await
    }
}

/// How dispatching one batch ended
enum BatchEnd {
    Completed,
    Stopped,
    Cancelled,
    Failed(ConsumerError),
}

/// Highest checkpointable record of a batch plus how the batch ended
struct BatchProgress {
    last: Option<String>,
    end: BatchEnd,
}

impl BatchProgress {
    fn new(last: Option<String>, end: BatchEnd) -> Self {
        Self { last, end }
    }
}

pub struct ShardScanner<C, S, P> {
    client: C,
    store: S,
    processor: Arc<P>,
    config: Arc<ConsumerConfig>,
    backoff: ExponentialBackoff,
    pool: Option<Submitter>,
    shard_id: String,
}

impl<C, S, P> ShardScanner<C, S, P>
where
    C: KinesisClientTrait,
    S: CheckpointStore,
    P: RecordProcessor + 'static,
{
    pub fn new(
        client: C,
        store: S,
        processor: Arc<P>,
        config: Arc<ConsumerConfig>,
        shard_id: impl Into<String>,
    ) -> Self {
        let backoff = config.retry.backoff();
        Self {
            client,
            store,
            processor,
            config,
            backoff,
            pool: None,
            shard_id: shard_id.into(),
        }
    }

    pub fn with_backoff(mut self, backoff: ExponentialBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Process records on a shared worker pool instead of inline
    pub fn with_pool(mut self, pool: Submitter) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn shard_id(&self) -> &str {
        &self.shard_id
    }

    /// Scan the shard until it closes, the callback stops, `cancel` fires or
    /// a fatal error occurs
    pub async fn run(&self, cancel: &CancellationToken) -> Result<ScanOutcome> {
        if cancel.is_cancelled() {
            debug!(shard_id = %self.shard_id, "Cancelled before scanning started");
            return Ok(ScanOutcome::Cancelled);
        }

        info!(shard_id = %self.shard_id, "Starting shard scan");

        let outcome = self.scan(cancel).await;

        match &outcome {
            Ok(outcome) => info!(shard_id = %self.shard_id, outcome = ?outcome, "Shard scan finished"),
            Err(e) => warn!(shard_id = %self.shard_id, error = %e, "Shard scan failed"),
        }
        outcome
    }

    async fn scan(&self, cancel: &CancellationToken) -> Result<ScanOutcome> {
        let mut checkpointed = self.stored_checkpoint().await?;
        let Some(mut iterator) = self.fresh_iterator(checkpointed.as_deref(), cancel).await? else {
            return Ok(ScanOutcome::Cancelled);
        };
        let mut attempt: u32 = 0;

        loop {
            let fetched = tokio::select! {
                _ = cancel.cancelled() => return Ok(ScanOutcome::Cancelled),
                fetched = self.client.get_records(&iterator, self.config.batch_size) => fetched,
            };

            let batch = match fetched {
                Ok(batch) => {
                    attempt = 0;
                    batch
                }
                Err(e) if e.is_recoverable() => {
                    attempt += 1;
                    warn!(
                        shard_id = %self.shard_id,
                        attempt,
                        error = %e,
                        "Fetching records failed, re-deriving iterator from checkpoint"
                    );
                    if self.backoff.wait(attempt, cancel).await.is_err() {
                        return Ok(ScanOutcome::Cancelled);
                    }
                    match self.fresh_iterator(checkpointed.as_deref(), cancel).await? {
                        Some(fresh) => iterator = fresh,
                        None => return Ok(ScanOutcome::Cancelled),
                    }
                    continue;
                }
                Err(e) => {
                    return Err(ConsumerError::GetRecordsFailed {
                        shard_id: self.shard_id.clone(),
                        source: e,
                    })
                }
            };

            trace!(
                shard_id = %self.shard_id,
                records = batch.records.len(),
                millis_behind_latest = ?batch.millis_behind_latest,
                "Fetched batch"
            );

            if !batch.records.is_empty() {
                let progress = match &self.pool {
                    Some(pool) => self.dispatch_pooled(pool, &batch.records, cancel).await,
                    None => self.dispatch(&batch.records, cancel).await,
                };

                if let Some(last) = progress.last {
                    let advances = checkpointed
                        .as_deref()
                        .map_or(true, |current| sequence::is_after(&last, current));
                    if advances {
                        self.checkpoint(&last).await?;
                        checkpointed = Some(last);
                    }
                }

                match progress.end {
                    BatchEnd::Completed => {}
                    BatchEnd::Stopped => return Ok(ScanOutcome::Stopped),
                    BatchEnd::Cancelled => return Ok(ScanOutcome::Cancelled),
                    BatchEnd::Failed(e) => return Err(e),
                }
            }

            let Some(next) = batch.next_iterator else {
                info!(shard_id = %self.shard_id, checkpoint = ?checkpointed, "Shard closed");
                return Ok(ScanOutcome::Closed);
            };

            let idle = batch.records.is_empty() && (next == iterator || batch.millis_behind_latest == Some(0));
            iterator = next;

            if idle {
                trace!(shard_id = %self.shard_id, "Caught up, waiting for new records");
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(ScanOutcome::Cancelled),
                    _ = tokio::time::sleep(self.config.scan_interval) => {}
                }
            }
        }
    }

    /// Hand records to the callback one at a time, in order
    async fn dispatch(&self, records: &[Record], cancel: &CancellationToken) -> BatchProgress {
        let mut last = None;

        for record in records {
            if cancel.is_cancelled() {
                return BatchProgress::new(last, BatchEnd::Cancelled);
            }

            let sequence_number = record.sequence_number();
            match self.processor.process_record(record).await {
                Ok(ScanStatus::Continue) => last = Some(sequence_number.to_string()),
                Ok(ScanStatus::Stop) => {
                    debug!(shard_id = %self.shard_id, sequence_number, "Callback stopped the scan");
                    return BatchProgress::new(Some(sequence_number.to_string()), BatchEnd::Stopped);
                }
                Err(e) => {
                    let failure = self.processing_failure(sequence_number, e);
                    return BatchProgress::new(last, BatchEnd::Failed(failure));
                }
            }
        }

        BatchProgress::new(last, BatchEnd::Completed)
    }

    /// Feed records through the pool while collecting results, then
    /// checkpoint only the longest prefix of the batch whose records have
    /// all completed. Records finishing out of order never move the
    /// checkpoint past an unfinished one.
    async fn dispatch_pooled(&self, pool: &Submitter, records: &[Record], cancel: &CancellationToken) -> BatchProgress {
        // sized so workers never wait on this scanner
        let (reply, mut results) = mpsc::channel::<WorkResult>(records.len().max(1));
        let mut done: HashMap<String, std::result::Result<ScanStatus, ProcessingError>> = HashMap::new();
        let mut queue = records.iter();
        let mut next = queue.next();
        let mut outstanding = 0usize;
        let mut halted = false;
        let mut cancelled = false;

        while outstanding > 0 || (next.is_some() && !halted) {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                result = results.recv(), if outstanding > 0 => {
                    let Some(result) = result else { break };
                    outstanding -= 1;
                    if !matches!(result.outcome, Ok(ScanStatus::Continue)) {
                        halted = true;
                    }
                    trace!(shard_id = %self.shard_id, worker_id = result.worker_id, "Worker finished record");
                    done.insert(result.record.sequence_number().to_string(), result.outcome);
                }
                permit = pool.reserve(), if next.is_some() && !halted => {
                    let Ok(permit) = permit else { break };
                    if let Some(record) = next.take() {
                        permit.send(Job {
                            record: record.clone(),
                            reply: reply.clone(),
                            cancel: cancel.clone(),
                        });
                        outstanding += 1;
                        next = queue.next();
                    }
                }
            }
        }

        // workers finish what they already took; jobs still queued for a
        // cancelled scan are dropped, which closes the channel
        drop(reply);
        while outstanding > 0 {
            let Some(result) = results.recv().await else { break };
            outstanding -= 1;
            done.insert(result.record.sequence_number().to_string(), result.outcome);
        }

        let mut last = None;
        for record in records {
            let sequence_number = record.sequence_number();
            match done.remove(sequence_number) {
                Some(Ok(ScanStatus::Continue)) => last = Some(sequence_number.to_string()),
                Some(Ok(ScanStatus::Stop)) => {
                    return BatchProgress::new(Some(sequence_number.to_string()), BatchEnd::Stopped);
                }
                Some(Err(e)) => {
                    let failure = self.processing_failure(sequence_number, e);
                    return BatchProgress::new(last, BatchEnd::Failed(failure));
                }
                None if cancelled => return BatchProgress::new(last, BatchEnd::Cancelled),
                None => return BatchProgress::new(last, BatchEnd::Failed(ConsumerError::PoolStopped)),
            }
        }

        let end = if cancelled { BatchEnd::Cancelled } else { BatchEnd::Completed };
        BatchProgress::new(last, end)
    }

    fn processing_failure(&self, sequence_number: &str, source: ProcessingError) -> ConsumerError {
        warn!(shard_id = %self.shard_id, sequence_number, error = %source, "Record processing failed");
        ConsumerError::Processing {
            shard_id: self.shard_id.clone(),
            sequence_number: sequence_number.to_string(),
            source,
        }
    }

    async fn stored_checkpoint(&self) -> Result<Option<String>> {
        let checkpoint = self
            .store
            .get_checkpoint(&self.config.stream_name, &self.shard_id)
            .await
            .map_err(|e| self.checkpoint_failure(e))?
            .filter(|checkpoint| !checkpoint.is_empty());

        match &checkpoint {
            Some(sequence_number) => {
                info!(shard_id = %self.shard_id, checkpoint = %sequence_number, "Resuming after checkpoint")
            }
            None => info!(
                shard_id = %self.shard_id,
                position = ?self.config.initial_position,
                "No checkpoint, starting at initial position"
            ),
        }
        Ok(checkpoint)
    }

    async fn checkpoint(&self, sequence_number: &str) -> Result<()> {
        self.store
            .set_checkpoint(&self.config.stream_name, &self.shard_id, sequence_number)
            .await
            .map_err(|e| self.checkpoint_failure(e))?;

        debug!(shard_id = %self.shard_id, sequence_number, "Checkpointed");
        Ok(())
    }

    /// Lease errors keep their type so a lost lease can be told apart from a
    /// storage failure
    fn checkpoint_failure(&self, err: anyhow::Error) -> ConsumerError {
        match err.downcast::<LeaseError>() {
            Ok(lease) => ConsumerError::Lease(lease),
            Err(err) => ConsumerError::CheckpointError {
                shard_id: self.shard_id.clone(),
                message: format!("{:#}", err),
            },
        }
    }

    /// Iterator positioned after `checkpoint`, or at the initial position.
    /// `None` when cancelled while retrying.
    async fn fresh_iterator(&self, checkpoint: Option<&str>, cancel: &CancellationToken) -> Result<Option<String>> {
        let (iterator_type, timestamp) = match (checkpoint, &self.config.initial_position) {
            (Some(_), _) => (ShardIteratorType::AfterSequenceNumber, None),
            (None, InitialPosition::TrimHorizon) => (ShardIteratorType::TrimHorizon, None),
            (None, InitialPosition::Latest) => (ShardIteratorType::Latest, None),
            (None, InitialPosition::AtTimestamp(at)) => (ShardIteratorType::AtTimestamp, Some(at)),
        };

        let mut attempt: u32 = 0;
        loop {
            let requested = tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                requested = self.client.get_shard_iterator(
                    &self.config.stream_name,
                    &self.shard_id,
                    iterator_type.clone(),
                    checkpoint,
                    timestamp,
                ) => requested,
            };

            match requested {
                Ok(iterator) => {
                    trace!(shard_id = %self.shard_id, iterator_type = ?iterator_type, "Acquired iterator");
                    return Ok(Some(iterator));
                }
                Err(e) if e.is_recoverable() => {
                    attempt += 1;
                    warn!(shard_id = %self.shard_id, attempt, error = %e, "Getting iterator failed, retrying");
                    if self.backoff.wait(attempt, cancel).await.is_err() {
                        return Ok(None);
                    }
                }
                Err(e) => {
                    return Err(ConsumerError::GetIteratorFailed {
                        shard_id: self.shard_id.clone(),
                        source: e,
                    })
                }
            }
        }
    }
}
