//! Bounded worker pool for parallel record processing
//!
//! One pool of N workers serves every shard of a consumer. Workers share one
//! bounded input queue; a full queue blocks the submitter, which is the
//! pool's only backpressure. Each [`Job`] carries the channel its
//! [`WorkResult`] goes back on, so results reach the scanner that submitted
//! them. Every job a worker takes yields exactly one result, including
//! when the callback panics.
//!
//! A job whose token has fired by the time a worker takes it is dropped
//! unprocessed. Dropping a job drops its reply sender, so a scanner waiting
//! on its results sees the channel close instead of hanging.

use aws_sdk_kinesis::types::Record;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc::{self, Permit};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::error::{ConsumerError, ProcessingError};
use crate::scanner::{RecordProcessor, ScanStatus};

/// Outcome of one record, tagged with the worker that processed it
#[derive(Debug)]
pub struct WorkResult {
    pub record: Record,
    pub worker_id: usize,
    pub outcome: Result<ScanStatus, ProcessingError>,
}

/// A record queued for processing
#[derive(Debug)]
pub struct Job {
    pub record: Record,
    /// Where the result is sent
    pub reply: mpsc::Sender<WorkResult>,
    /// Cancellation of the scan that submitted the record
    pub cancel: CancellationToken,
}

/// Cloneable handle for feeding jobs into a pool
#[derive(Debug, Clone)]
pub struct Submitter {
    tx: mpsc::Sender<Job>,
}

impl Submitter {
    /// Enqueue `job`, waiting while the input queue is full
    pub async fn submit(&self, job: Job) -> Result<(), ConsumerError> {
        self.tx.send(job).await.map_err(|_| ConsumerError::PoolStopped)
    }

    /// Wait for queue space without giving up a job. Safe to use as a
    /// `select!` branch.
    pub async fn reserve(&self) -> Result<Permit<'_, Job>, ConsumerError> {
        self.tx.reserve().await.map_err(|_| ConsumerError::PoolStopped)
    }
}

pub struct WorkerPool<P> {
    processor: Arc<P>,
    workers: usize,
    input_tx: Option<mpsc::Sender<Job>>,
    input_rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    handles: Vec<JoinHandle<()>>,
}

impl<P: RecordProcessor + 'static> WorkerPool<P> {
    /// A pool of `workers` workers with an input queue of `queue_size`. Both
    /// are clamped to at least one.
    pub fn new(processor: Arc<P>, workers: usize, queue_size: usize) -> Self {
        let workers = workers.max(1);
        let (input_tx, input_rx) = mpsc::channel(queue_size.max(1));

        Self {
            processor,
            workers,
            input_tx: Some(input_tx),
            input_rx: Arc::new(Mutex::new(input_rx)),
            handles: Vec::new(),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Launch the workers. Each exits when the input queue closes or `cancel`
    /// fires, whichever comes first; on cancel, jobs still queued are
    /// dropped. Calling this twice has no effect.
    pub fn start(&mut self, cancel: CancellationToken) {
        if !self.handles.is_empty() {
            return;
        }

        for worker_id in 0..self.workers {
            let input = self.input_rx.clone();
            let processor = self.processor.clone();
            let cancel = cancel.clone();

            self.handles.push(tokio::spawn(async move {
                trace!(worker_id, "Worker started");
                loop {
                    let next = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        job = async { input.lock().await.recv().await } => job,
                    };
                    let Some(job) = next else { break };
                    run_job(processor.as_ref(), worker_id, job).await;
                }

                if cancel.is_cancelled() {
                    let mut input = input.lock().await;
                    input.close();
                    while input.try_recv().is_ok() {}
                }
                trace!(worker_id, "Worker stopped");
            }));
        }

        debug!(workers = self.workers, "Worker pool started");
    }

    pub fn submitter(&self) -> Result<Submitter, ConsumerError> {
        self.input_tx
            .clone()
            .map(|tx| Submitter { tx })
            .ok_or(ConsumerError::PoolStopped)
    }

    pub async fn submit(&self, job: Job) -> Result<(), ConsumerError> {
        self.submitter()?.submit(job).await
    }

    /// Drop the pool's own handle on the input queue. The queue closes once
    /// every [`Submitter`] is gone too; workers drain what is queued and exit.
    pub fn stop(&mut self) {
        self.input_tx = None;
        debug!("Worker pool stopped");
    }

    /// Stop and wait for every worker to exit. Returns the first worker that
    /// ended abnormally.
    pub async fn join(mut self) -> Result<(), ConsumerError> {
        self.stop();
        let mut first_error = None;
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker ended abnormally");
                first_error.get_or_insert(ConsumerError::from(e));
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

async fn run_job<P: RecordProcessor>(processor: &P, worker_id: usize, job: Job) {
    let Job { record, reply, cancel } = job;
    let sequence_number = record.sequence_number().to_string();

    if cancel.is_cancelled() {
        trace!(worker_id, sequence_number = %sequence_number, "Scan cancelled, dropping job");
        return;
    }

    let outcome = AssertUnwindSafe(processor.process_record(&record))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
            let message = panic_message(panic.as_ref());
            error!(worker_id, sequence_number = %sequence_number, panic = %message, "Record callback panicked");
            Err(ProcessingError::hard(anyhow::anyhow!(
                "record callback panicked: {}",
                message
            )))
        });

    let result = WorkResult {
        record,
        worker_id,
        outcome,
    };
    if reply.send(result).await.is_err() {
        trace!(worker_id, sequence_number = %sequence_number, "Result receiver gone");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
