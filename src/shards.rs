//! Shard discovery
//!
//! The tracker polls `ListShards` on a fixed cadence and reports every shard
//! id exactly once over its lifetime, however many listings return it.

use aws_sdk_kinesis::types::Shard;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::client::{KinesisClientError, KinesisClientTrait};
use crate::error::{ConsumerError, Result};
use crate::retry::Classify;

/// Default time between shard listings
pub const DEFAULT_SHARD_POLL_INTERVAL: Duration = Duration::from_secs(30);

pub struct ShardTracker<C> {
    client: C,
    stream_name: String,
    poll_interval: Duration,
    known: HashSet<String>,
}

impl<C: KinesisClientTrait> ShardTracker<C> {
    pub fn new(client: C, stream_name: impl Into<String>, poll_interval: Duration) -> Self {
        Self {
            client,
            stream_name: stream_name.into(),
            poll_interval,
            known: HashSet::new(),
        }
    }

    pub fn known_shards(&self) -> usize {
        self.known.len()
    }

    pub fn is_known(&self, shard_id: &str) -> bool {
        self.known.contains(shard_id)
    }

    /// List every shard, paging until no continuation token remains, and
    /// return the ones not seen before in listing order.
    ///
    /// The known set only changes once the whole listing has succeeded, so a
    /// failure halfway through pagination loses nothing.
    pub async fn poll(&mut self) -> std::result::Result<Vec<Shard>, KinesisClientError> {
        let mut listed = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let (page, token) = self
                .client
                .list_shards(&self.stream_name, next_token.as_deref())
                .await?;
            trace!(stream = %self.stream_name, count = page.len(), "Listed shard page");
            listed.extend(page);

            match token {
                Some(token) if !token.is_empty() => next_token = Some(token),
                _ => break,
            }
        }

        let discovered: Vec<Shard> = listed
            .into_iter()
            .filter(|shard| self.known.insert(shard.shard_id().to_string()))
            .collect();

        if !discovered.is_empty() {
            info!(
                stream = %self.stream_name,
                new_shards = discovered.len(),
                known_shards = self.known.len(),
                "Discovered shards"
            );
        }

        Ok(discovered)
    }

    /// Poll immediately and then every poll interval, sending new shards on
    /// `shards` until cancelled or the receiver goes away.
    ///
    /// Recoverable listing failures are logged and retried on the next tick;
    /// anything else ends the tracker with an error.
    pub async fn run(mut self, shards: mpsc::Sender<Shard>, cancel: CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(stream = %self.stream_name, "Shard tracker cancelled");
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }

            let discovered = match self.poll().await {
                Ok(discovered) => discovered,
                Err(e) if e.is_recoverable() => {
                    warn!(stream = %self.stream_name, error = %e, "Shard listing failed, retrying next tick");
                    continue;
                }
                Err(e) => return Err(ConsumerError::ListShardsFailed(e)),
            };

            for shard in discovered {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    sent = shards.send(shard) => {
                        if sent.is_err() {
                            debug!(stream = %self.stream_name, "Shard receiver closed, stopping tracker");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}
