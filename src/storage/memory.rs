//! In-memory storage implementations for standalone runs and tests.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::interfaces::aggregate_store::Result;
use crate::interfaces::{
    AggregateHandle, AggregateRepository, AggregateStorage, PublishedVersionStore,
};

/// Key type for published versions: (processor, aggregate type, aggregate id).
type VersionKey = (String, String, String);

/// Published-version store that keeps cursors in memory.
///
/// Updates never move a cursor backwards.
#[derive(Default)]
pub struct MemoryPublishedVersionStore {
    versions: RwLock<HashMap<VersionKey, u64>>,
}

impl MemoryPublishedVersionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PublishedVersionStore for MemoryPublishedVersionStore {
    async fn get(
        &self,
        processor_name: &str,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Result<u64> {
        let key = (
            processor_name.to_string(),
            aggregate_type.to_string(),
            aggregate_id.to_string(),
        );
        Ok(self.versions.read().await.get(&key).copied().unwrap_or(0))
    }

    async fn update(
        &self,
        processor_name: &str,
        aggregate_type: &str,
        aggregate_id: &str,
        version: u64,
    ) -> Result<()> {
        let key = (
            processor_name.to_string(),
            aggregate_type.to_string(),
            aggregate_id.to_string(),
        );
        let mut versions = self.versions.write().await;
        let current = versions.entry(key).or_insert(0);
        *current = (*current).max(version);
        Ok(())
    }
}

/// Aggregate store holding live handles keyed by (type, id).
///
/// Serves as both the read-through cache and the authoritative storage
/// when no event store is wired in.
#[derive(Default)]
pub struct MemoryAggregateStore {
    aggregates: RwLock<HashMap<(String, String), AggregateHandle>>,
}

impl MemoryAggregateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an aggregate.
    pub async fn put(&self, aggregate: AggregateHandle) {
        let key = (
            aggregate.type_name().to_string(),
            aggregate.unique_id().to_string(),
        );
        self.aggregates.write().await.insert(key, aggregate);
    }

    async fn lookup(&self, aggregate_type: &str, id: &str) -> Option<AggregateHandle> {
        self.aggregates
            .read()
            .await
            .get(&(aggregate_type.to_string(), id.to_string()))
            .cloned()
    }
}

#[async_trait]
impl AggregateRepository for MemoryAggregateStore {
    async fn get(&self, aggregate_type: &str, id: &str) -> Result<Option<AggregateHandle>> {
        Ok(self.lookup(aggregate_type, id).await)
    }
}

#[async_trait]
impl AggregateStorage for MemoryAggregateStore {
    async fn get(&self, aggregate_type: &str, id: &str) -> Result<Option<AggregateHandle>> {
        Ok(self.lookup(aggregate_type, id).await)
    }
}
