use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

use super::{Lease, LeaseError, LeaseStorage};

/// Lease table held in process memory.
///
/// Every conditional write is a compare-and-set under one mutex, which gives
/// the same guarantees as a conditional put in a real table. Useful for tests
/// and for several consumers sharing one process.
#[derive(Debug, Default, Clone)]
pub struct InMemoryLeaseStorage {
    leases: Arc<Mutex<HashMap<String, Lease>>>,
}

impl InMemoryLeaseStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeaseStorage for InMemoryLeaseStorage {
    async fn create_lease(&self, lease: &Lease) -> Result<(), LeaseError> {
        let mut leases = self.leases.lock();
        if leases.contains_key(&lease.key) {
            trace!(key = %lease.key, "Create rejected, lease exists");
            return Err(LeaseError::Conflict {
                key: lease.key.clone(),
            });
        }

        leases.insert(lease.key.clone(), lease.clone());
        Ok(())
    }

    async fn update_lease(&self, expected: &Lease, desired: &Lease) -> Result<(), LeaseError> {
        let mut leases = self.leases.lock();
        match leases.get(&expected.key) {
            Some(current) if current.same_version(expected) && expected.key == desired.key => {
                leases.insert(desired.key.clone(), desired.clone());
                Ok(())
            }
            _ => {
                trace!(key = %expected.key, "Update rejected, stored lease differs");
                Err(LeaseError::Conflict {
                    key: expected.key.clone(),
                })
            }
        }
    }

    async fn get_lease(&self, key: &str) -> Result<Option<Lease>, LeaseError> {
        Ok(self.leases.lock().get(key).cloned())
    }

    async fn get_all_leases(&self) -> Result<HashMap<String, Lease>, LeaseError> {
        Ok(self.leases.lock().clone())
    }
}
