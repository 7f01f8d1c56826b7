use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

use super::{Lease, LeaseError, LeaseStorage, SHARD_END};
use crate::error::ConsumerError;
use crate::retry::{classify, Backoff, Classify, ErrorClass, ExponentialBackoff, RetryConfig};
use crate::store::{validate_token, CheckpointStore};

/// Lease timing and identity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// Identity written into every lease this process holds
    pub owner_id: String,
    /// How long a lease may go without a new heartbeat before peers take it over
    pub lease_duration: Duration,
    pub heartbeat_interval: Duration,
    /// Upper bound on leases held at once; `None` takes whatever is free
    pub max_leases: Option<usize>,
    /// Policy for recoverable lease table failures
    pub retry: RetryConfig,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            owner_id: Uuid::new_v4().to_string(),
            lease_duration: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            max_leases: None,
            retry: RetryConfig::default(),
        }
    }
}

impl LeaseConfig {
    pub fn validate(&self) -> Result<(), ConsumerError> {
        if self.owner_id.is_empty() {
            return Err(ConsumerError::ConfigError("Lease owner id must not be empty".into()));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConsumerError::ConfigError(
                "Heartbeat interval must be greater than zero".into(),
            ));
        }
        if self.lease_duration <= self.heartbeat_interval * 2 {
            return Err(ConsumerError::ConfigError(format!(
                "Lease duration {:?} must exceed twice the heartbeat interval {:?}",
                self.lease_duration, self.heartbeat_interval
            )));
        }
        if self.max_leases == Some(0) {
            return Err(ConsumerError::ConfigError("max_leases must be at least 1".into()));
        }
        Ok(())
    }
}

/// A lease this process currently owns
struct Held {
    lease: Arc<AsyncMutex<Lease>>,
    /// Stops the heartbeat task
    heartbeat: CancellationToken,
    /// Cancelled when ownership is lost so the shard's scanner stops
    scanner: Option<CancellationToken>,
}

struct Inner<S> {
    storage: S,
    config: LeaseConfig,
    backoff: ExponentialBackoff,
    /// Lease table as of the last scan, with local first-seen times
    observed: Mutex<HashMap<String, Lease>>,
    held: Mutex<HashMap<String, Held>>,
    closing: CancellationToken,
}

/// Acquires, heartbeats and releases shard leases for one process.
///
/// Each held lease sits behind its own async mutex, held across the
/// conditional write for that lease. This serializes the heartbeat and
/// checkpoint writes of one shard: both compare against the same last
/// observed record, so running them concurrently would fail one of them
/// as a conflict and drop a live lease. Nothing else waits on that mutex,
/// and the table-wide `parking_lot` maps are never held across an await.
/// The manager is cheap to clone; clones share state.
pub struct LeaseManager<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for LeaseManager<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: LeaseStorage + 'static> LeaseManager<S> {
    pub fn new(storage: S, config: LeaseConfig) -> Result<Self, ConsumerError> {
        config.validate()?;
        let backoff = config.retry.backoff();

        debug!(owner = %config.owner_id, "Initializing lease manager");
        Ok(Self {
            inner: Arc::new(Inner {
                storage,
                config,
                backoff,
                observed: Mutex::new(HashMap::new()),
                held: Mutex::new(HashMap::new()),
                closing: CancellationToken::new(),
            }),
        })
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.inner.config
    }

    pub fn owner_id(&self) -> &str {
        &self.inner.config.owner_id
    }

    pub fn held_count(&self) -> usize {
        self.inner.held.lock().len()
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.inner.held.lock().contains_key(key)
    }

    /// Snapshot of every lease this process holds
    pub async fn owned_leases(&self) -> Vec<Lease> {
        let handles: Vec<_> = self
            .inner
            .held
            .lock()
            .values()
            .map(|held| held.lease.clone())
            .collect();

        let mut leases = Vec::with_capacity(handles.len());
        for handle in handles {
            leases.push(handle.lock().await.clone());
        }
        leases.sort_by(|a, b| a.key.cmp(&b.key));
        leases
    }

    /// One acquisition tick over the currently known `shards`.
    ///
    /// Shards with no lease record are claimed first. Only when every known
    /// shard has a record are expired leases taken over. Losing a conditional
    /// write to a peer is not an error; that shard is skipped for this tick.
    #[instrument(skip(self, shards), fields(owner = %self.inner.config.owner_id, shards = shards.len()))]
    pub async fn acquire(&self, shards: &[String]) -> Result<Vec<Lease>, LeaseError> {
        let capacity = self.capacity();
        if capacity == 0 {
            trace!("At lease capacity, skipping acquisition");
            return Ok(Vec::new());
        }

        let table = self.observe().await?;
        let owner = self.inner.config.owner_id.as_str();
        let mut acquired = Vec::new();

        let unleased: Vec<&String> = shards.iter().filter(|shard| !table.contains_key(*shard)).collect();
        if !unleased.is_empty() {
            for shard in unleased {
                if acquired.len() >= capacity {
                    break;
                }

                let lease = Lease::new(shard.as_str(), owner);
                match self.with_retry(|| self.inner.storage.create_lease(&lease)).await {
                    Ok(()) => {
                        info!(shard_id = %shard, "Created lease");
                        self.hold(lease.clone());
                        acquired.push(lease);
                    }
                    Err(e) if e.is_conflict() => {
                        debug!(shard_id = %shard, "Peer created lease first");
                    }
                    Err(e) => return self.partial(acquired, e),
                }
            }
            return Ok(acquired);
        }

        let known: HashSet<&str> = shards.iter().map(String::as_str).collect();
        let now = Instant::now();
        let mut expired: Vec<&Lease> = table
            .values()
            .filter(|lease| {
                known.contains(lease.key.as_str())
                    && !lease.is_shard_end()
                    && !self.is_held(&lease.key)
                    && self.is_expired(lease, now)
            })
            .collect();
        expired.sort_by(|a, b| a.key.cmp(&b.key));

        for observed in expired {
            if acquired.len() >= capacity {
                break;
            }

            let desired = observed.takeover(owner);
            match self
                .with_retry(|| self.inner.storage.update_lease(observed, &desired))
                .await
            {
                Ok(()) => {
                    info!(
                        shard_id = %observed.key,
                        previous_owner = %observed.owner_id,
                        fencing_counter = desired.fencing_counter,
                        "Took over expired lease"
                    );
                    self.hold(desired.clone());
                    acquired.push(desired);
                }
                Err(e) if e.is_conflict() => {
                    debug!(shard_id = %observed.key, "Takeover aborted, lease changed");
                }
                Err(e) => return self.partial(acquired, e),
            }
        }

        Ok(acquired)
    }

    /// Start heartbeating a held lease. `scanner` is cancelled if the lease
    /// is lost; cancelling it also stops the heartbeat.
    pub fn spawn_heartbeat(&self, key: &str, scanner: CancellationToken) -> Option<JoinHandle<()>> {
        let (lease, stop) = {
            let mut held = self.inner.held.lock();
            let entry = held.get_mut(key)?;
            entry.scanner = Some(scanner.clone());
            (entry.lease.clone(), entry.heartbeat.clone())
        };

        let manager = self.clone();
        let key = key.to_string();
        let interval = self.inner.config.heartbeat_interval;

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = scanner.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                // per-lease serialization with checkpoint writes
                let mut current = lease.lock().await;
                let desired = current.heartbeat();
                match manager.inner.storage.update_lease(&current, &desired).await {
                    Ok(()) => {
                        trace!(shard_id = %key, "Heartbeat written");
                        *current = desired;
                    }
                    Err(e) if e.is_recoverable() => {
                        warn!(shard_id = %key, error = %e, "Heartbeat failed, retrying next tick");
                    }
                    Err(e) => {
                        drop(current);
                        warn!(shard_id = %key, error = %e, "Lease lost");
                        manager.lose(&key);
                        break;
                    }
                }
            }

            trace!(shard_id = %key, "Heartbeat stopped");
        }))
    }

    /// Stop heartbeating `key` and forget it. The record stays in the table
    /// and becomes available to peers once it expires.
    pub fn release(&self, key: &str) {
        if let Some(held) = self.inner.held.lock().remove(key) {
            held.heartbeat.cancel();
            info!(shard_id = %key, "Released lease");
        }
    }

    /// Record that `key` has been read to its end, then release it.
    /// A finished lease is never acquired again.
    #[instrument(skip(self), fields(owner = %self.inner.config.owner_id))]
    pub async fn mark_shard_end(&self, key: &str) -> Result<(), LeaseError> {
        let lease = self.held_lease(key).ok_or_else(|| LeaseError::NotFound {
            key: key.to_string(),
        })?;

        self.write_checkpoint(key, &lease, SHARD_END).await?;
        self.release(key);
        Ok(())
    }

    /// Release every held lease and interrupt pending retries
    pub fn release_all(&self) {
        self.inner.closing.cancel();
        let drained: Vec<(String, Held)> = self.inner.held.lock().drain().collect();
        for (key, held) in drained {
            held.heartbeat.cancel();
            debug!(shard_id = %key, "Released lease on shutdown");
        }
    }

    fn capacity(&self) -> usize {
        let held = self.held_count();
        match self.inner.config.max_leases {
            Some(max) => max.saturating_sub(held),
            None => usize::MAX,
        }
    }

    fn is_expired(&self, lease: &Lease, now: Instant) -> bool {
        lease
            .last_update
            .is_some_and(|seen| now.duration_since(seen) > self.inner.config.lease_duration)
    }

    /// Scan the lease table, carrying forward the first-seen time of every
    /// lease whose heartbeat has not changed since the previous scan
    async fn observe(&self) -> Result<HashMap<String, Lease>, LeaseError> {
        let current = self.with_retry(|| self.inner.storage.get_all_leases()).await?;
        let now = Instant::now();

        let mut observed = self.inner.observed.lock();
        let refreshed: HashMap<String, Lease> = current
            .into_iter()
            .map(|(key, mut lease)| {
                lease.last_update = match observed.get(&key) {
                    Some(previous)
                        if previous.heartbeat_id == lease.heartbeat_id
                            && previous.owner_id == lease.owner_id =>
                    {
                        previous.last_update
                    }
                    _ => Some(now),
                };
                (key, lease)
            })
            .collect();

        *observed = refreshed.clone();
        Ok(refreshed)
    }

    fn hold(&self, lease: Lease) {
        self.inner.held.lock().insert(
            lease.key.clone(),
            Held {
                lease: Arc::new(AsyncMutex::new(lease)),
                heartbeat: CancellationToken::new(),
                scanner: None,
            },
        );
    }

    fn held_lease(&self, key: &str) -> Option<Arc<AsyncMutex<Lease>>> {
        self.inner.held.lock().get(key).map(|held| held.lease.clone())
    }

    /// Drop ownership of `key` after a lost write, stopping its scanner
    fn lose(&self, key: &str) {
        if let Some(held) = self.inner.held.lock().remove(key) {
            held.heartbeat.cancel();
            if let Some(scanner) = held.scanner {
                scanner.cancel();
            }
        }
    }

    /// Conditional write of `checkpoint` under the lease's mutex, which stays
    /// locked until the write settles
    async fn write_checkpoint(
        &self,
        key: &str,
        lease: &AsyncMutex<Lease>,
        checkpoint: &str,
    ) -> Result<(), LeaseError> {
        let mut current = lease.lock().await;
        if current.checkpoint == checkpoint {
            return Ok(());
        }

        let desired = current.with_checkpoint(checkpoint);
        let expected = current.clone();
        match self
            .with_retry(|| self.inner.storage.update_lease(&expected, &desired))
            .await
        {
            Ok(()) => {
                trace!(shard_id = %key, checkpoint, "Checkpoint written to lease");
                *current = desired;
                Ok(())
            }
            Err(e) => {
                drop(current);
                if e.is_conflict() {
                    warn!(shard_id = %key, "Lease lost while checkpointing");
                    self.lose(key);
                }
                Err(e)
            }
        }
    }

    fn partial(&self, acquired: Vec<Lease>, err: LeaseError) -> Result<Vec<Lease>, LeaseError> {
        if acquired.is_empty() {
            return Err(err);
        }
        warn!(
            acquired = acquired.len(),
            error = %err,
            "Lease acquisition stopped early"
        );
        Ok(acquired)
    }

    async fn with_retry<T, F, Fut>(&self, mut operation: F) -> Result<T, LeaseError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LeaseError>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Err(LeaseError::Storage(e))
                    if classify(&e) == ErrorClass::Recoverable
                        && self.inner.config.retry.max_retries.map_or(true, |max| attempt < max) =>
                {
                    attempt += 1;
                    warn!(attempt, error = %e, "Lease table call failed, retrying");
                    self.inner
                        .backoff
                        .wait(attempt, &self.inner.closing)
                        .await
                        .map_err(|interrupted| LeaseError::Storage(interrupted.into()))?;
                }
                result => return result,
            }
        }
    }
}

/// Checkpoints stored in the lease record's checkpoint column. The lease
/// table is scoped to one application and stream, so the stream name is not
/// part of the key.
#[async_trait]
impl<S: LeaseStorage + 'static> CheckpointStore for LeaseManager<S> {
    async fn get_checkpoint(&self, _stream_name: &str, shard_id: &str) -> anyhow::Result<Option<String>> {
        let checkpoint = match self.held_lease(shard_id) {
            Some(lease) => lease.lock().await.checkpoint.clone(),
            None => self
                .inner
                .storage
                .get_lease(shard_id)
                .await?
                .map(|lease| lease.checkpoint)
                .unwrap_or_default(),
        };

        Ok(Some(checkpoint).filter(|c| !c.is_empty() && c != SHARD_END))
    }

    async fn set_checkpoint(&self, _stream_name: &str, shard_id: &str, sequence_number: &str) -> anyhow::Result<()> {
        validate_token(sequence_number)?;

        let lease = self.held_lease(shard_id).ok_or_else(|| LeaseError::Conflict {
            key: shard_id.to_string(),
        })?;
        self.write_checkpoint(shard_id, &lease, sequence_number).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CheckpointError;
    use crate::lease::InMemoryLeaseStorage;
    use pretty_assertions::assert_eq;

    fn config(owner: &str) -> LeaseConfig {
        LeaseConfig {
            owner_id: owner.to_string(),
            lease_duration: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            max_leases: None,
            retry: RetryConfig::default(),
        }
    }

    fn shards(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_config_validation() {
        assert!(config("a").validate().is_ok());

        let tight = LeaseConfig {
            lease_duration: Duration::from_secs(20),
            ..config("a")
        };
        assert!(matches!(tight.validate(), Err(ConsumerError::ConfigError(_))));

        let anonymous = config("");
        assert!(LeaseManager::new(InMemoryLeaseStorage::new(), anonymous).is_err());
    }

    #[tokio::test]
    async fn test_racing_creates_have_one_owner() -> anyhow::Result<()> {
        let storage = InMemoryLeaseStorage::new();
        let a = LeaseManager::new(storage.clone(), config("a"))?;
        let b = LeaseManager::new(storage.clone(), config("b"))?;
        let shard = shards(&["shard-p"]);

        let (from_a, from_b) = tokio::join!(a.acquire(&shard), b.acquire(&shard));
        let total = from_a?.len() + from_b?.len();
        assert_eq!(total, 1);

        let stored = storage.get_lease("shard-p").await?.expect("lease created");
        assert_eq!(stored.fencing_counter, 1);

        // the loser sees the shard leased and does not retry it
        let (winner, loser) = if a.is_held("shard-p") { (a, b) } else { (b, a) };
        assert!(loser.acquire(&shard).await?.is_empty());
        assert_eq!(winner.owned_leases().await.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_max_leases_limits_acquisition() -> anyhow::Result<()> {
        let manager = LeaseManager::new(
            InMemoryLeaseStorage::new(),
            LeaseConfig {
                max_leases: Some(1),
                ..config("a")
            },
        )?;

        let acquired = manager.acquire(&shards(&["s1", "s2"])).await?;
        assert_eq!(acquired.len(), 1);
        assert!(manager.acquire(&shards(&["s1", "s2"])).await?.is_empty());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_takeover_only_after_heartbeats_stop() -> anyhow::Result<()> {
        let storage = InMemoryLeaseStorage::new();
        let a = LeaseManager::new(storage.clone(), config("a"))?;
        let b = LeaseManager::new(storage.clone(), config("b"))?;
        let shard = shards(&["s1"]);

        assert_eq!(a.acquire(&shard).await?.len(), 1);
        let heartbeat = a.spawn_heartbeat("s1", CancellationToken::new()).expect("held");

        assert!(b.acquire(&shard).await?.is_empty());
        tokio::time::sleep(Duration::from_secs(35)).await;
        assert!(b.acquire(&shard).await?.is_empty(), "live owner must keep its lease");

        a.release("s1");
        heartbeat.await?;
        tokio::time::sleep(Duration::from_secs(35)).await;

        let taken = b.acquire(&shard).await?;
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].owner_id, "b");
        assert_eq!(taken[0].fencing_counter, 2);

        // the previous owner can no longer checkpoint
        assert!(a.set_checkpoint("stream", "s1", "5").await.is_err());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_stolen_lease_cancels_scanner() -> anyhow::Result<()> {
        let storage = InMemoryLeaseStorage::new();
        let manager = LeaseManager::new(storage.clone(), config("a"))?;
        manager.acquire(&shards(&["s1"])).await?;

        let scanner = CancellationToken::new();
        let heartbeat = manager.spawn_heartbeat("s1", scanner.clone()).expect("held");

        let stored = storage.get_lease("s1").await?.expect("lease exists");
        storage.update_lease(&stored, &stored.takeover("intruder")).await?;

        tokio::time::sleep(Duration::from_secs(11)).await;
        heartbeat.await?;

        assert!(scanner.is_cancelled());
        assert!(!manager.is_held("s1"));
        Ok(())
    }

    #[tokio::test]
    async fn test_checkpoints_live_in_lease() -> anyhow::Result<()> {
        let storage = InMemoryLeaseStorage::new();
        let manager = LeaseManager::new(storage.clone(), config("a"))?;
        manager.acquire(&shards(&["s1"])).await?;

        assert_eq!(manager.get_checkpoint("stream", "s1").await?, None);
        manager.set_checkpoint("stream", "s1", "17").await?;
        assert_eq!(manager.get_checkpoint("stream", "s1").await?, Some("17".to_string()));
        assert_eq!(storage.get_lease("s1").await?.map(|l| l.checkpoint), Some("17".to_string()));

        let err = manager.set_checkpoint("stream", "s1", "").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CheckpointError>(),
            Some(CheckpointError::EmptyToken)
        ));
        assert_eq!(manager.get_checkpoint("stream", "s1").await?, Some("17".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn test_heartbeats_and_checkpoints_do_not_conflict() -> anyhow::Result<()> {
        let storage = InMemoryLeaseStorage::new();
        let manager = LeaseManager::new(
            storage.clone(),
            LeaseConfig {
                lease_duration: Duration::from_millis(100),
                heartbeat_interval: Duration::from_millis(1),
                ..config("a")
            },
        )?;
        manager.acquire(&shards(&["s1"])).await?;

        let scanner = CancellationToken::new();
        let heartbeat = manager.spawn_heartbeat("s1", scanner.clone()).expect("held");

        let writers = (1..=4).map(|writer| {
            let manager = manager.clone();
            tokio::spawn(async move {
                for i in 0..25 {
                    let sequence = format!("{}", writer * 100 + i);
                    manager.set_checkpoint("stream", "s1", &sequence).await?;
                    tokio::task::yield_now().await;
                }
                Ok::<(), anyhow::Error>(())
            })
        });
        for writer in futures::future::join_all(writers).await {
            writer??;
        }

        assert!(manager.is_held("s1"));
        assert!(!scanner.is_cancelled());
        let local = manager.owned_leases().await;
        let stored = storage.get_lease("s1").await?.expect("lease exists");
        assert_eq!(local[0].checkpoint, stored.checkpoint);
        assert_eq!(local[0].heartbeat_id, stored.heartbeat_id);

        scanner.cancel();
        heartbeat.await?;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_shard_is_never_reacquired() -> anyhow::Result<()> {
        let storage = InMemoryLeaseStorage::new();
        let a = LeaseManager::new(storage.clone(), config("a"))?;
        let b = LeaseManager::new(storage.clone(), config("b"))?;
        let shard = shards(&["s1"]);

        a.acquire(&shard).await?;
        a.mark_shard_end("s1").await?;
        assert!(!a.is_held("s1"));

        b.acquire(&shard).await?;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(b.acquire(&shard).await?.is_empty());
        assert!(storage.get_lease("s1").await?.is_some_and(|l| l.is_shard_end()));
        Ok(())
    }
}
