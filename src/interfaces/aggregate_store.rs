//! Aggregate and aggregate storage interfaces.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;

use crate::messages::DomainEvent;
use crate::utils::retry::Retryable;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors raised by storage collaborators.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Storage invariant violated: {0}")]
    Invariant(String),

    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl Retryable for StorageError {
    fn is_retryable(&self) -> bool {
        match self {
            StorageError::Unavailable(_) => true,
            StorageError::Invariant(_) => false,
            #[cfg(feature = "sqlite")]
            StorageError::Database(_) => true,
        }
    }
}

/// A consistency boundary identified by a unique id.
///
/// Aggregates are shared as `Arc` handles while a command executes, so
/// implementations keep mutable state behind their own interior lock.
pub trait AggregateRoot: Any + Send + Sync {
    /// Unique id of this aggregate instance.
    fn unique_id(&self) -> &str;

    /// Aggregate type name, used to key published versions.
    fn type_name(&self) -> &str;

    /// Version of the last committed event stream (0 for a new aggregate).
    fn version(&self) -> u64;

    /// Events applied since the aggregate was loaded or created.
    fn changes(&self) -> Vec<DomainEvent>;

    /// Upcast for typed lookups.
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Shared handle to a type-erased aggregate.
pub type AggregateHandle = Arc<dyn AggregateRoot>;

/// Fast, possibly stale, read-through cache of aggregates.
#[async_trait]
pub trait AggregateRepository: Send + Sync {
    /// Returns `None` when the aggregate does not exist.
    async fn get(&self, aggregate_type: &str, id: &str) -> Result<Option<AggregateHandle>>;
}

/// Authoritative aggregate storage, rebuilt from the event store.
#[async_trait]
pub trait AggregateStorage: Send + Sync {
    /// Returns `None` when the aggregate does not exist.
    async fn get(&self, aggregate_type: &str, id: &str) -> Result<Option<AggregateHandle>>;
}
