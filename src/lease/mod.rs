//! Distributed shard leases
//!
//! A lease is a fenced ownership claim over one shard, stored in a table
//! shared by every consumer process of an application. Writes are
//! conditional on the full `(key, checkpoint, fencing_counter, owner_id,
//! heartbeat_id)` tuple last observed by the writer, so at most one process
//! can successfully act on a given lease version.
//!
//! Liveness is inferred, not stored: a lease whose heartbeat id has not
//! changed for longer than the lease duration, as seen by another process's
//! local clock, is presumed abandoned and may be taken over. The table is
//! scanned in full on every acquisition tick, which is fine for tens to low
//! hundreds of shards.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

#[cfg(feature = "dynamodb-store")]
pub mod dynamodb;
pub mod manager;
pub mod memory;

#[cfg(feature = "dynamodb-store")]
pub use dynamodb::DynamoDbLeaseStorage;
pub use manager::{LeaseConfig, LeaseManager};
pub use memory::InMemoryLeaseStorage;

use crate::retry::{Classify, ErrorClass};

/// Checkpoint value marking a shard that has been read to its end
pub const SHARD_END: &str = "SHARD_END";

/// Ownership record for one shard
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    /// Shard id
    pub key: String,
    /// Last checkpointed sequence number, empty when none
    pub checkpoint: String,
    pub fencing_counter: i64,
    pub owner_id: String,
    pub heartbeat_id: String,
    /// Local time the current heartbeat id was first observed, never persisted
    #[serde(skip)]
    pub last_update: Option<Instant>,
}

impl Lease {
    /// A first-generation lease for an unleased shard
    pub fn new(key: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            checkpoint: String::new(),
            fencing_counter: 1,
            owner_id: owner_id.into(),
            heartbeat_id: new_heartbeat_id(),
            last_update: Some(Instant::now()),
        }
    }

    /// True when both leases describe the same stored version.
    ///
    /// `last_update` is local bookkeeping and is not compared.
    pub fn same_version(&self, other: &Lease) -> bool {
        self.key == other.key
            && self.checkpoint == other.checkpoint
            && self.fencing_counter == other.fencing_counter
            && self.owner_id == other.owner_id
            && self.heartbeat_id == other.heartbeat_id
    }

    /// The same lease with a fresh heartbeat
    pub fn heartbeat(&self) -> Self {
        Self {
            heartbeat_id: new_heartbeat_id(),
            last_update: Some(Instant::now()),
            ..self.clone()
        }
    }

    /// The lease as it looks after `owner_id` takes it over
    pub fn takeover(&self, owner_id: &str) -> Self {
        Self {
            fencing_counter: self.fencing_counter + 1,
            owner_id: owner_id.to_string(),
            heartbeat_id: new_heartbeat_id(),
            last_update: Some(Instant::now()),
            ..self.clone()
        }
    }

    pub fn with_checkpoint(&self, checkpoint: &str) -> Self {
        Self {
            checkpoint: checkpoint.to_string(),
            ..self.clone()
        }
    }

    pub fn is_shard_end(&self) -> bool {
        self.checkpoint == SHARD_END
    }
}

pub fn new_heartbeat_id() -> String {
    Uuid::new_v4().to_string()
}

/// Errors from lease storage
#[derive(Debug, Error)]
pub enum LeaseError {
    /// The conditional write lost a race; another process changed the lease
    #[error("Lease {key} was modified concurrently")]
    Conflict { key: String },

    #[error("Lease {key} not found")]
    NotFound { key: String },

    #[error("Lease storage failure: {0:#}")]
    Storage(#[source] anyhow::Error),
}

impl LeaseError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, LeaseError::Conflict { .. })
    }
}

impl Classify for LeaseError {
    fn class(&self) -> ErrorClass {
        match self {
            LeaseError::Conflict { .. } | LeaseError::NotFound { .. } => ErrorClass::Fatal,
            LeaseError::Storage(e) => crate::retry::classify(e),
        }
    }
}

/// Durable lease table
#[async_trait]
pub trait LeaseStorage: Send + Sync {
    /// Insert `lease`; [`LeaseError::Conflict`] if a record for the key exists
    async fn create_lease(&self, lease: &Lease) -> Result<(), LeaseError>;

    /// Replace `expected` with `desired`; [`LeaseError::Conflict`] unless the
    /// stored record is still exactly `expected`
    async fn update_lease(&self, expected: &Lease, desired: &Lease) -> Result<(), LeaseError>;

    async fn get_lease(&self, key: &str) -> Result<Option<Lease>, LeaseError>;

    async fn get_all_leases(&self) -> Result<HashMap<String, Lease>, LeaseError>;
}

#[async_trait]
impl<T: LeaseStorage + ?Sized> LeaseStorage for Arc<T> {
    async fn create_lease(&self, lease: &Lease) -> Result<(), LeaseError> {
        (**self).create_lease(lease).await
    }

    async fn update_lease(&self, expected: &Lease, desired: &Lease) -> Result<(), LeaseError> {
        (**self).update_lease(expected, desired).await
    }

    async fn get_lease(&self, key: &str) -> Result<Option<Lease>, LeaseError> {
        (**self).get_lease(key).await
    }

    async fn get_all_leases(&self) -> Result<HashMap<String, Lease>, LeaseError> {
        (**self).get_all_leases().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_takeover_bumps_fencing_counter() {
        let lease = Lease::new("shard-1", "owner-a").with_checkpoint("42");
        let taken = lease.takeover("owner-b");

        assert_eq!(taken.fencing_counter, 2);
        assert_eq!(taken.owner_id, "owner-b");
        assert_eq!(taken.checkpoint, "42");
        assert_ne!(taken.heartbeat_id, lease.heartbeat_id);
        assert!(!taken.same_version(&lease));
    }

    #[test]
    fn test_same_version_ignores_local_clock() {
        let lease = Lease::new("shard-1", "owner-a");
        let mut observed = lease.clone();
        observed.last_update = None;
        assert!(lease.same_version(&observed));
        assert!(!lease.same_version(&lease.heartbeat()));
    }

    #[test]
    fn test_lease_serialization_skips_local_clock() -> anyhow::Result<()> {
        let lease = Lease::new("shard-1", "owner-a");
        let json = serde_json::to_value(&lease)?;

        assert_eq!(json["fencingCounter"], 1);
        assert_eq!(json["ownerId"], "owner-a");
        assert!(json.get("lastUpdate").is_none());

        let decoded: Lease = serde_json::from_value(json)?;
        assert!(decoded.same_version(&lease));
        assert!(decoded.last_update.is_none());
        Ok(())
    }

    #[test]
    fn test_lease_error_classes() {
        assert!(!LeaseError::Conflict { key: "k".into() }.is_recoverable());
        assert!(LeaseError::Storage(anyhow::anyhow!("ThrottlingException")).is_recoverable());
        assert!(!LeaseError::Storage(anyhow::anyhow!("no such table")).is_recoverable());
    }
}
