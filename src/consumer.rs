//! Consumer orchestration
//!
//! A [`Consumer`] ties the pieces together: a [`ShardTracker`] discovers
//! shards, a [`ShardGroup`] decides which of them this process scans, and
//! one [`ShardScanner`] task runs per assigned shard. With `worker_count`
//! set, every scanner feeds the same [`WorkerPool`]. Cancelling the token
//! passed to [`Consumer::run`] is the only shutdown signal.
//!
//! A fatal error in one shard stops only that shard. It is reported to the
//! optional error sink and the first one is returned once the consumer
//! exits. A failing shard-closed callback or a fatal discovery or lease
//! error stops the whole consumer.

use async_trait::async_trait;
use aws_sdk_kinesis::types::Shard;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::client::KinesisClientTrait;
use crate::error::{ConsumerError, Result};
use crate::lease::{LeaseConfig, LeaseManager, LeaseStorage};
use crate::pool::{Submitter, WorkerPool};
use crate::retry::{Classify, RetryConfig};
use crate::scanner::{InitialPosition, RecordProcessor, ScanOutcome, ShardScanner};
use crate::shards::{ShardTracker, DEFAULT_SHARD_POLL_INTERVAL};
use crate::store::{BatchConfig, BatchedCheckpointStore, CheckpointStore};

/// Largest `batch_size` GetRecords accepts
pub const MAX_BATCH_SIZE: i32 = 10_000;

/// Consumer configuration
///
/// Every field has a default, so a config file only needs the names:
///
/// ```rust
/// use kinesis_lease_consumer::ConsumerConfig;
///
/// let config: ConsumerConfig = serde_json::from_str(
///     r#"{ "app_name": "billing", "stream_name": "orders", "worker_count": 4 }"#,
/// ).unwrap();
/// assert_eq!(config.worker_count, Some(4));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Application name; scopes checkpoints and leases
    pub app_name: String,
    pub stream_name: String,
    /// Maximum records requested per GetRecords call
    pub batch_size: i32,
    /// Where shards without a checkpoint start
    pub initial_position: InitialPosition,
    /// Pause between polls of a shard that has caught up
    pub scan_interval: Duration,
    /// Time between shard listings
    pub shard_poll_interval: Duration,
    /// Workers shared by every shard; `None` calls the processor inline
    pub worker_count: Option<usize>,
    /// Capacity of the worker pool's input queue
    pub worker_queue_size: usize,
    /// Backoff for recoverable stream errors. `max_retries` is not applied
    /// to the scan loop, which retries until cancelled.
    pub retry: RetryConfig,
    /// Used by [`ConsumerBuilder::leased`] and [`ConsumerConfig::lease_manager`]
    pub lease: LeaseConfig,
    /// Used by [`ConsumerBuilder::with_batched_checkpoints`]
    pub checkpoint: BatchConfig,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            app_name: String::new(),
            stream_name: String::new(),
            batch_size: 100,
            initial_position: InitialPosition::TrimHorizon,
            scan_interval: Duration::from_millis(250),
            shard_poll_interval: DEFAULT_SHARD_POLL_INTERVAL,
            worker_count: None,
            worker_queue_size: 100,
            retry: RetryConfig::default(),
            lease: LeaseConfig::default(),
            checkpoint: BatchConfig::default(),
        }
    }
}

impl ConsumerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.stream_name.is_empty() {
            return Err(ConsumerError::ConfigError("stream_name is required".into()));
        }
        if self.app_name.is_empty() {
            return Err(ConsumerError::ConfigError("app_name is required".into()));
        }
        if !(1..=MAX_BATCH_SIZE).contains(&self.batch_size) {
            return Err(ConsumerError::ConfigError(format!(
                "batch_size must be between 1 and {}, got {}",
                MAX_BATCH_SIZE, self.batch_size
            )));
        }
        if self.worker_count == Some(0) {
            return Err(ConsumerError::ConfigError("worker_count must be at least 1".into()));
        }
        if self.shard_poll_interval.is_zero() {
            return Err(ConsumerError::ConfigError(
                "shard_poll_interval must be greater than zero".into(),
            ));
        }
        if self.checkpoint.flush_interval.is_zero() {
            return Err(ConsumerError::ConfigError(
                "checkpoint.flush_interval must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Lease manager over `storage` with this config's lease settings
    pub fn lease_manager<L: LeaseStorage + 'static>(&self, storage: L) -> Result<LeaseManager<L>> {
        LeaseManager::new(storage, self.lease.clone())
    }

    /// Wrap `backend` so checkpoints flush on this config's interval
    pub fn batched_store<B: CheckpointStore + 'static>(&self, backend: B) -> BatchedCheckpointStore<B> {
        BatchedCheckpointStore::new(backend, self.checkpoint.clone())
    }
}

/// A shard this process should scan, with the token that stops its scanner
#[derive(Debug, Clone)]
pub struct Assignment {
    pub shard_id: String,
    pub cancel: CancellationToken,
}

/// A shard that stopped on a fatal error, as sent to the error sink
#[derive(Debug, Clone)]
pub struct ShardFailure {
    pub shard_id: String,
    pub message: String,
}

/// Decides which discovered shards this process scans
#[async_trait]
pub trait ShardGroup: Send + Sync {
    /// Turn discovered shards into assignments until `cancel` fires. An
    /// error stops the consumer.
    async fn run(
        &self,
        shards: mpsc::Receiver<Shard>,
        assignments: mpsc::Sender<Assignment>,
        cancel: CancellationToken,
    ) -> Result<()>;

    /// Called after the scanner of an assigned shard has returned
    async fn finished(&self, shard_id: &str, outcome: &Result<ScanOutcome>);

    /// Called once every scanner has returned
    async fn shutdown(&self) {}
}

/// Scans every shard in the stream. For a single process.
#[derive(Debug, Default, Clone)]
pub struct AllShardsGroup;

#[async_trait]
impl ShardGroup for AllShardsGroup {
    async fn run(
        &self,
        mut shards: mpsc::Receiver<Shard>,
        assignments: mpsc::Sender<Assignment>,
        cancel: CancellationToken,
    ) -> Result<()> {
        loop {
            let shard = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                shard = shards.recv() => shard,
            };
            let Some(shard) = shard else { return Ok(()) };

            let assignment = Assignment {
                shard_id: shard.shard_id().to_string(),
                cancel: cancel.child_token(),
            };
            if assignments.send(assignment).await.is_err() {
                return Ok(());
            }
        }
    }

    async fn finished(&self, _shard_id: &str, _outcome: &Result<ScanOutcome>) {}
}

/// Scans only the shards whose lease this process holds
pub struct LeaseGroup<S> {
    manager: LeaseManager<S>,
}

impl<S: LeaseStorage + 'static> LeaseGroup<S> {
    pub fn new(manager: LeaseManager<S>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &LeaseManager<S> {
        &self.manager
    }
}

#[async_trait]
impl<S: LeaseStorage + 'static> ShardGroup for LeaseGroup<S> {
    /// Tries to acquire leases whenever new shards arrive and once per lease
    /// duration. Each acquired lease gets a heartbeat bound to its
    /// assignment token, so losing the lease stops the scanner.
    async fn run(
        &self,
        mut shards: mpsc::Receiver<Shard>,
        assignments: mpsc::Sender<Assignment>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut known: Vec<String> = Vec::new();
        let mut ticker = tokio::time::interval(self.manager.config().lease_duration);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shards_open = true;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                shard = shards.recv(), if shards_open => match shard {
                    Some(shard) => {
                        known.push(shard.shard_id().to_string());
                        while let Ok(more) = shards.try_recv() {
                            known.push(more.shard_id().to_string());
                        }
                    }
                    None => {
                        shards_open = false;
                        continue;
                    }
                },
                _ = ticker.tick() => {}
            }

            let leases = match self.manager.acquire(&known).await {
                Ok(leases) => leases,
                Err(e) if e.is_recoverable() => {
                    warn!(error = %e, "Lease acquisition failed, retrying next tick");
                    continue;
                }
                Err(e) => return Err(ConsumerError::Lease(e)),
            };

            for lease in leases {
                let token = cancel.child_token();
                self.manager.spawn_heartbeat(&lease.key, token.clone());

                let assignment = Assignment {
                    shard_id: lease.key.clone(),
                    cancel: token,
                };
                if assignments.send(assignment).await.is_err() {
                    return Ok(());
                }
            }
        }
    }

    async fn finished(&self, shard_id: &str, outcome: &Result<ScanOutcome>) {
        match outcome {
            Ok(ScanOutcome::Closed) => {
                if let Err(e) = self.manager.mark_shard_end(shard_id).await {
                    warn!(shard_id, error = %e, "Failed to mark shard end on lease");
                    self.manager.release(shard_id);
                }
            }
            _ => self.manager.release(shard_id),
        }
    }

    async fn shutdown(&self) {
        self.manager.release_all();
    }
}

/// Partitioned stream consumer
pub struct Consumer<C, S, P, G> {
    client: Arc<C>,
    store: Arc<S>,
    processor: Arc<P>,
    group: Arc<G>,
    config: Arc<ConsumerConfig>,
    error_sink: Option<mpsc::UnboundedSender<ShardFailure>>,
}

impl<C, S, P> Consumer<C, S, P, AllShardsGroup>
where
    C: KinesisClientTrait + 'static,
    S: CheckpointStore + 'static,
    P: RecordProcessor + 'static,
{
    pub fn builder(client: C, store: S, processor: P) -> ConsumerBuilder<C, S, P, AllShardsGroup> {
        ConsumerBuilder::new(client, store, processor)
    }
}

impl<C, S, P, G> Consumer<C, S, P, G>
where
    C: KinesisClientTrait + 'static,
    S: CheckpointStore + 'static,
    P: RecordProcessor + 'static,
    G: ShardGroup + 'static,
{
    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Run until `cancel` fires or a consumer-level error occurs.
    ///
    /// Waits for every scanner to return and shuts the checkpoint store down
    /// before returning. Returns the first fatal error seen, if any.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let span = info_span!("consumer", app = %self.config.app_name, stream = %self.config.stream_name);
        self.run_inner(cancel).instrument(span).await
    }

    async fn run_inner(&self, cancel: CancellationToken) -> Result<()> {
        info!("Starting consumer");

        let stop = cancel.child_token();

        let mut pool = self.config.worker_count.map(|workers| {
            let mut pool = WorkerPool::new(self.processor.clone(), workers, self.config.worker_queue_size);
            pool.start(stop.clone());
            pool
        });
        let submitter = pool.as_ref().map(WorkerPool::submitter).transpose()?;

        let (shard_tx, shard_rx) = mpsc::channel(64);
        let (assignment_tx, mut assignment_rx) = mpsc::channel(64);

        let tracker = ShardTracker::new(
            self.client.clone(),
            self.config.stream_name.clone(),
            self.config.shard_poll_interval,
        );
        let mut tracker_task = tokio::spawn(tracker.run(shard_tx, stop.clone()).in_current_span());

        let group = self.group.clone();
        let group_stop = stop.clone();
        let mut group_task =
            tokio::spawn(async move { group.run(shard_rx, assignment_tx, group_stop).await }.in_current_span());

        let mut scanners: JoinSet<(String, Result<ScanOutcome>)> = JoinSet::new();
        let mut first_error: Option<ConsumerError> = None;
        let mut tracker_done = false;
        let mut group_done = false;
        let mut assignments_open = true;

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                assignment = assignment_rx.recv(), if assignments_open => match assignment {
                    Some(assignment) => self.spawn_scanner(&mut scanners, assignment, submitter.as_ref()),
                    None => assignments_open = false,
                },
                Some(joined) = scanners.join_next() => {
                    if let Some(fatal) = self.scanner_finished(joined, &mut first_error).await {
                        first_error.get_or_insert(fatal);
                        stop.cancel();
                    }
                }
                finished = &mut tracker_task, if !tracker_done => {
                    tracker_done = true;
                    if let Err(e) = finished.map_err(ConsumerError::from).and_then(|result| result) {
                        error!(error = %e, "Shard discovery failed");
                        first_error.get_or_insert(e);
                        stop.cancel();
                    }
                }
                finished = &mut group_task, if !group_done => {
                    group_done = true;
                    if let Err(e) = finished.map_err(ConsumerError::from).and_then(|result| result) {
                        error!(error = %e, "Shard assignment failed");
                        first_error.get_or_insert(e);
                        stop.cancel();
                    }
                }
            }
        }

        debug!(running = scanners.len(), "Stopping consumer, waiting for scanners");
        stop.cancel();
        drop(assignment_rx);
        while let Some(joined) = scanners.join_next().await {
            if let Some(fatal) = self.scanner_finished(joined, &mut first_error).await {
                first_error.get_or_insert(fatal);
            }
        }

        for (done, task) in [(tracker_done, tracker_task), (group_done, group_task)] {
            if !done {
                if let Err(e) = task.await.map_err(ConsumerError::from).and_then(|result| result) {
                    first_error.get_or_insert(e);
                }
            }
        }

        drop(submitter);
        if let Some(pool) = pool.take() {
            if let Err(e) = pool.join().await {
                first_error.get_or_insert(e);
            }
        }

        // buffered checkpoints must land while the leases are still held
        if let Err(e) = self.store.shutdown().await {
            error!(error = %e, "Checkpoint store shutdown failed");
            first_error.get_or_insert(ConsumerError::Other(e.context("Checkpoint store shutdown failed")));
        }

        self.group.shutdown().await;

        info!(failed = first_error.is_some(), "Consumer stopped");
        first_error.map_or(Ok(()), Err)
    }

    fn spawn_scanner(
        &self,
        scanners: &mut JoinSet<(String, Result<ScanOutcome>)>,
        assignment: Assignment,
        pool: Option<&Submitter>,
    ) {
        let Assignment { shard_id, cancel } = assignment;
        let mut scanner = ShardScanner::new(
            self.client.clone(),
            self.store.clone(),
            self.processor.clone(),
            self.config.clone(),
            shard_id.clone(),
        );
        if let Some(pool) = pool {
            scanner = scanner.with_pool(pool.clone());
        }
        let processor = self.processor.clone();
        let stream_name = self.config.stream_name.clone();
        let span = info_span!("shard", shard_id = %shard_id);

        scanners.spawn(
            async move {
                let outcome = match scanner.run(&cancel).await {
                    Ok(ScanOutcome::Closed) => processor
                        .shard_closed(&stream_name, &shard_id)
                        .await
                        .map(|()| ScanOutcome::Closed)
                        .map_err(|source| ConsumerError::ShardClosedCallback {
                            shard_id: shard_id.clone(),
                            source,
                        }),
                    other => other,
                };
                (shard_id, outcome)
            }
            .instrument(span),
        );
    }

    /// Settle a finished scanner: flush its checkpoint, then hand the shard
    /// back to the group. Returns an error that must stop the whole
    /// consumer; shard-level failures are recorded and reported here.
    async fn scanner_finished(
        &self,
        joined: std::result::Result<(String, Result<ScanOutcome>), tokio::task::JoinError>,
        first_error: &mut Option<ConsumerError>,
    ) -> Option<ConsumerError> {
        let (shard_id, outcome) = match joined {
            Ok(finished) => finished,
            Err(e) => {
                error!(error = %e, "Scanner task panicked");
                return Some(e.into());
            }
        };

        if let Err(e) = self.store.flush_shard(&self.config.stream_name, &shard_id).await {
            error!(shard_id = %shard_id, error = %e, "Failed to flush shard checkpoint");
            first_error.get_or_insert(ConsumerError::CheckpointError {
                shard_id: shard_id.clone(),
                message: format!("{:#}", e),
            });
        }
        self.group.finished(&shard_id, &outcome).await;

        match outcome {
            Ok(outcome) => {
                debug!(shard_id = %shard_id, outcome = ?outcome, "Scanner finished");
                None
            }
            Err(ConsumerError::Lease(e)) if e.is_conflict() => {
                info!(shard_id = %shard_id, "Lease lost, scanner stopped");
                None
            }
            Err(e @ ConsumerError::ShardClosedCallback { .. }) => {
                error!(shard_id = %shard_id, error = %e, "Shard closed callback failed");
                Some(e)
            }
            Err(e) => {
                error!(shard_id = %shard_id, error = %e, "Shard stopped on fatal error");
                if let Some(sink) = &self.error_sink {
                    let _ = sink.send(ShardFailure {
                        shard_id: shard_id.clone(),
                        message: e.to_string(),
                    });
                }
                first_error.get_or_insert(e);
                None
            }
        }
    }
}

/// Builder for [`Consumer`]
pub struct ConsumerBuilder<C, S, P, G = AllShardsGroup> {
    client: C,
    store: S,
    processor: P,
    group: G,
    config: ConsumerConfig,
    error_sink: Option<mpsc::UnboundedSender<ShardFailure>>,
}

impl<C, S, P> ConsumerBuilder<C, S, P, AllShardsGroup> {
    pub fn new(client: C, store: S, processor: P) -> Self {
        Self {
            client,
            store,
            processor,
            group: AllShardsGroup,
            config: ConsumerConfig::default(),
            error_sink: None,
        }
    }
}

impl<C, L, P> ConsumerBuilder<C, LeaseManager<L>, P, LeaseGroup<L>>
where
    C: KinesisClientTrait + 'static,
    L: LeaseStorage + 'static,
    P: RecordProcessor + 'static,
{
    /// Share the stream with peers through `storage`. Leases are built from
    /// `config.lease` here, and checkpoints live in the lease records.
    pub fn leased(client: C, storage: L, processor: P, config: ConsumerConfig) -> Result<Self> {
        let manager = config.lease_manager(storage)?;
        Ok(Self {
            client,
            store: manager.clone(),
            processor,
            group: LeaseGroup::new(manager),
            config,
            error_sink: None,
        })
    }
}

impl<C, S, P, G> ConsumerBuilder<C, S, P, G>
where
    C: KinesisClientTrait + 'static,
    S: CheckpointStore + 'static,
    P: RecordProcessor + 'static,
    G: ShardGroup + 'static,
{
    /// Buffer checkpoints in memory and flush them every
    /// `config.checkpoint.flush_interval`, when a shard is handed back, and
    /// on shutdown. Call after the config is final.
    pub fn with_batched_checkpoints(self) -> ConsumerBuilder<C, BatchedCheckpointStore<S>, P, G> {
        ConsumerBuilder {
            store: self.config.batched_store(self.store),
            client: self.client,
            processor: self.processor,
            group: self.group,
            config: self.config,
            error_sink: self.error_sink,
        }
    }

    pub fn with_config(mut self, config: ConsumerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_app_name(mut self, app_name: impl Into<String>) -> Self {
        self.config.app_name = app_name.into();
        self
    }

    pub fn with_stream_name(mut self, stream_name: impl Into<String>) -> Self {
        self.config.stream_name = stream_name.into();
        self
    }

    pub fn with_worker_count(mut self, workers: usize) -> Self {
        self.config.worker_count = Some(workers);
        self
    }

    pub fn with_scan_interval(mut self, interval: Duration) -> Self {
        self.config.scan_interval = interval;
        self
    }

    /// Receive a report for every shard that stops on a fatal error
    pub fn with_error_sink(mut self, sink: mpsc::UnboundedSender<ShardFailure>) -> Self {
        self.error_sink = Some(sink);
        self
    }

    /// Use `group` to decide which shards this process scans
    pub fn with_group<G2: ShardGroup + 'static>(self, group: G2) -> ConsumerBuilder<C, S, P, G2> {
        ConsumerBuilder {
            client: self.client,
            store: self.store,
            processor: self.processor,
            group,
            config: self.config,
            error_sink: self.error_sink,
        }
    }

    pub fn build(self) -> Result<Consumer<C, S, P, G>> {
        self.config.validate()?;

        Ok(Consumer {
            client: Arc::new(self.client),
            store: Arc::new(self.store),
            processor: Arc::new(self.processor),
            group: Arc::new(self.group),
            config: Arc::new(self.config),
            error_sink: self.error_sink,
        })
    }
}
