use anyhow::{anyhow, Context};
use async_trait::async_trait;
use aws_sdk_dynamodb::{types::AttributeValue, Client as DynamoClient};
use std::collections::HashMap;
use tracing::{debug, instrument, trace};

use super::{Lease, LeaseError, LeaseStorage};
use crate::store::dynamodb::describe_sdk_error;

type Item = HashMap<String, AttributeValue>;

const KEY: &str = "key";
const CHECKPOINT: &str = "checkpoint";
const FENCING_COUNTER: &str = "fencing_counter";
const OWNER_ID: &str = "owner_id";
const HEARTBEAT_ID: &str = "heartbeat_id";

/// Leases in a DynamoDB table with a string hash key named `key`.
///
/// Creation is conditional on the key being absent and updates are
/// conditional on every stored attribute matching the expected lease.
#[derive(Debug, Clone)]
pub struct DynamoDbLeaseStorage {
    client: DynamoClient,
    table_name: String,
}

impl DynamoDbLeaseStorage {
    pub fn new(client: DynamoClient, table_name: impl Into<String>) -> Self {
        Self {
            client,
            table_name: table_name.into(),
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }
}

fn to_item(lease: &Lease) -> Item {
    HashMap::from([
        (KEY.to_string(), AttributeValue::S(lease.key.clone())),
        (CHECKPOINT.to_string(), AttributeValue::S(lease.checkpoint.clone())),
        (
            FENCING_COUNTER.to_string(),
            AttributeValue::N(lease.fencing_counter.to_string()),
        ),
        (OWNER_ID.to_string(), AttributeValue::S(lease.owner_id.clone())),
        (HEARTBEAT_ID.to_string(), AttributeValue::S(lease.heartbeat_id.clone())),
    ])
}

fn string_attr(item: &Item, name: &str) -> anyhow::Result<String> {
    item.get(name)
        .and_then(|value| value.as_s().ok())
        .cloned()
        .ok_or_else(|| anyhow!("Lease item is missing string attribute {}", name))
}

fn from_item(item: &Item) -> anyhow::Result<Lease> {
    let fencing_counter = item
        .get(FENCING_COUNTER)
        .and_then(|value| value.as_n().ok())
        .ok_or_else(|| anyhow!("Lease item is missing numeric attribute {}", FENCING_COUNTER))?
        .parse::<i64>()
        .context("Invalid fencing counter")?;

    Ok(Lease {
        key: string_attr(item, KEY)?,
        // an empty checkpoint may come back absent from older writers
        checkpoint: string_attr(item, CHECKPOINT).unwrap_or_default(),
        fencing_counter,
        owner_id: string_attr(item, OWNER_ID)?,
        heartbeat_id: string_attr(item, HEARTBEAT_ID)?,
        last_update: None,
    })
}

/// Values bound to the full-tuple update condition
fn expected_values(expected: &Lease) -> Item {
    HashMap::from([
        (":key".to_string(), AttributeValue::S(expected.key.clone())),
        (":checkpoint".to_string(), AttributeValue::S(expected.checkpoint.clone())),
        (
            ":fencing_counter".to_string(),
            AttributeValue::N(expected.fencing_counter.to_string()),
        ),
        (":owner_id".to_string(), AttributeValue::S(expected.owner_id.clone())),
        (":heartbeat_id".to_string(), AttributeValue::S(expected.heartbeat_id.clone())),
    ])
}

const UPDATE_CONDITION: &str = "#key = :key AND checkpoint = :checkpoint \
    AND fencing_counter = :fencing_counter AND owner_id = :owner_id \
    AND heartbeat_id = :heartbeat_id";

/// Same tuple, but a stored item with no checkpoint attribute also matches
const UPDATE_CONDITION_NO_CHECKPOINT: &str = "#key = :key \
    AND (attribute_not_exists(checkpoint) OR checkpoint = :checkpoint) \
    AND fencing_counter = :fencing_counter AND owner_id = :owner_id \
    AND heartbeat_id = :heartbeat_id";

/// Condition for an update expecting `expected`. Items without a checkpoint
/// decode as an empty one, so an empty expectation accepts either form.
fn update_condition(expected: &Lease) -> &'static str {
    if expected.checkpoint.is_empty() {
        UPDATE_CONDITION_NO_CHECKPOINT
    } else {
        UPDATE_CONDITION
    }
}

#[async_trait]
impl LeaseStorage for DynamoDbLeaseStorage {
    #[instrument(skip(self, lease), fields(table = %self.table_name, key = %lease.key))]
    async fn create_lease(&self, lease: &Lease) -> Result<(), LeaseError> {
        let result = self
            .client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(to_item(lease)))
            .condition_expression("attribute_not_exists(#key)")
            .expression_attribute_names("#key", KEY)
            .send()
            .await;

        match result {
            Ok(_) => {
                debug!(fencing_counter = lease.fencing_counter, "Created lease");
                Ok(())
            }
            Err(e)
                if e
                    .as_service_error()
                    .is_some_and(|se| se.is_conditional_check_failed_exception()) =>
            {
                trace!("Lease already exists");
                Err(LeaseError::Conflict {
                    key: lease.key.clone(),
                })
            }
            Err(e) => Err(LeaseError::Storage(
                describe_sdk_error(e).context("Failed to create lease"),
            )),
        }
    }

    #[instrument(skip(self, expected, desired), fields(table = %self.table_name, key = %expected.key))]
    async fn update_lease(&self, expected: &Lease, desired: &Lease) -> Result<(), LeaseError> {
        if expected.key != desired.key {
            return Err(LeaseError::Storage(anyhow!(
                "Cannot move lease {} to key {}",
                expected.key,
                desired.key
            )));
        }

        let result = self
            .client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(to_item(desired)))
            .condition_expression(update_condition(expected))
            .expression_attribute_names("#key", KEY)
            .set_expression_attribute_values(Some(expected_values(expected)))
            .send()
            .await;

        match result {
            Ok(_) => {
                trace!(
                    fencing_counter = desired.fencing_counter,
                    owner = %desired.owner_id,
                    "Updated lease"
                );
                Ok(())
            }
            Err(e)
                if e
                    .as_service_error()
                    .is_some_and(|se| se.is_conditional_check_failed_exception()) =>
            {
                debug!("Lease changed since it was read");
                Err(LeaseError::Conflict {
                    key: expected.key.clone(),
                })
            }
            Err(e) => Err(LeaseError::Storage(
                describe_sdk_error(e).context("Failed to update lease"),
            )),
        }
    }

    #[instrument(skip(self), fields(table = %self.table_name))]
    async fn get_lease(&self, key: &str) -> Result<Option<Lease>, LeaseError> {
        let response = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key(KEY, AttributeValue::S(key.to_string()))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| LeaseError::Storage(describe_sdk_error(e).context("Failed to get lease")))?;

        response
            .item
            .as_ref()
            .map(from_item)
            .transpose()
            .map_err(LeaseError::Storage)
    }

    #[instrument(skip(self), fields(table = %self.table_name))]
    async fn get_all_leases(&self) -> Result<HashMap<String, Lease>, LeaseError> {
        let mut leases = HashMap::new();
        let mut start_key: Option<Item> = None;

        loop {
            let response = self
                .client
                .scan()
                .table_name(&self.table_name)
                .consistent_read(true)
                .set_exclusive_start_key(start_key.take())
                .send()
                .await
                .map_err(|e| LeaseError::Storage(describe_sdk_error(e).context("Failed to scan leases")))?;

            for item in response.items.unwrap_or_default() {
                let lease = from_item(&item).map_err(LeaseError::Storage)?;
                leases.insert(lease.key.clone(), lease);
            }

            match response.last_evaluated_key {
                Some(key) if !key.is_empty() => start_key = Some(key),
                _ => break,
            }
        }

        trace!(count = leases.len(), "Scanned lease table");
        Ok(leases)
    }
}
