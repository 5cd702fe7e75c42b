//! Storage implementations.

use std::sync::Arc;

use tracing::info;

use crate::config::{StorageConfig, StorageType};
use crate::interfaces::{PublishedVersionStore, StorageError};

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod schema;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::{MemoryAggregateStore, MemoryPublishedVersionStore};
#[cfg(feature = "sqlite")]
pub use sqlite::SqlitePublishedVersionStore;

/// Initialize the published-version store based on configuration.
pub async fn init_published_version_store(
    config: &StorageConfig,
) -> Result<Arc<dyn PublishedVersionStore>, StorageError> {
    match config.storage_type {
        StorageType::Memory => {
            info!(storage_type = "memory", "Published version store initialized");
            Ok(Arc::new(MemoryPublishedVersionStore::new()))
        }
        StorageType::Sqlite => {
            #[cfg(feature = "sqlite")]
            {
                let store = SqlitePublishedVersionStore::connect(&config.sqlite.path).await?;
                info!(
                    storage_type = "sqlite",
                    path = %config.sqlite.path,
                    "Published version store initialized"
                );
                Ok(Arc::new(store))
            }

            #[cfg(not(feature = "sqlite"))]
            {
                Err(StorageError::Unavailable(
                    "SQLite support requires the 'sqlite' feature. Rebuild with --features sqlite"
                        .to_string(),
                ))
            }
        }
    }
}
