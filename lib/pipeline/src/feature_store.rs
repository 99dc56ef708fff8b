//! Feature-store contract.
//!
//! The scheduler relies on two operations only: an append that is
//! idempotent per `(entity_id, timestamp)` and an as-of read returning the
//! latest record at or before a point in time. The storage engine behind
//! them is someone else's concern.

use crate::error::FeatureStoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

/// One stored payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRecord {
    pub entity_id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: JsonValue,
}

/// Result of an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Inserted,
    /// A record already existed for this key and was left untouched.
    Duplicate,
}

#[async_trait]
pub trait FeatureStore: Send + Sync {
    /// Stores `payload` under `(entity_id, timestamp)`.
    ///
    /// Appending an existing key is a no-op that reports
    /// [`AppendOutcome::Duplicate`].
    async fn append(
        &self,
        entity_id: &str,
        timestamp: DateTime<Utc>,
        payload: JsonValue,
    ) -> Result<AppendOutcome, FeatureStoreError>;

    /// Returns the latest record for `entity_id` at or before `as_of`.
    async fn read(
        &self,
        entity_id: &str,
        as_of: DateTime<Utc>,
    ) -> Result<Option<FeatureRecord>, FeatureStoreError>;
}

/// Process-local feature store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryFeatureStore {
    entities: Arc<RwLock<HashMap<String, BTreeMap<DateTime<Utc>, JsonValue>>>>,
}

impl InMemoryFeatureStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records stored for `entity_id`.
    pub async fn len(&self, entity_id: &str) -> usize {
        self.entities
            .read()
            .await
            .get(entity_id)
            .map_or(0, BTreeMap::len)
    }
}

#[async_trait]
impl FeatureStore for InMemoryFeatureStore {
    async fn append(
        &self,
        entity_id: &str,
        timestamp: DateTime<Utc>,
        payload: JsonValue,
    ) -> Result<AppendOutcome, FeatureStoreError> {
        let mut entities = self.entities.write().await;
        let records = entities.entry(entity_id.to_string()).or_default();
        if records.contains_key(&timestamp) {
            return Ok(AppendOutcome::Duplicate);
        }
        records.insert(timestamp, payload);
        Ok(AppendOutcome::Inserted)
    }

    async fn read(
        &self,
        entity_id: &str,
        as_of: DateTime<Utc>,
    ) -> Result<Option<FeatureRecord>, FeatureStoreError> {
        let entities = self.entities.read().await;
        let record = entities.get(entity_id).and_then(|records| {
            records
                .range(..=as_of)
                .next_back()
                .map(|(timestamp, payload)| FeatureRecord {
                    entity_id: entity_id.to_string(),
                    timestamp: *timestamp,
                    payload: payload.clone(),
                })
        });
        Ok(record)
    }
}
