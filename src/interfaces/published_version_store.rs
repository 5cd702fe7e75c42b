//! PublishedVersionStore trait definition.

use async_trait::async_trait;

use super::aggregate_store::Result;

/// Interface for published-version cursors.
///
/// Tracks the version of the last event stream fully dispatched per
/// processor/aggregate type/aggregate id. The dispatch engine reads the
/// cursor before dispatching a stream and advances it afterwards.
///
/// # Key
///
/// Cursors are keyed by `(processor_name, aggregate_type, aggregate_id)`:
/// - `processor_name`: name of the subscriber dispatching the events
/// - `aggregate_type`: aggregate type name
/// - `aggregate_id`: aggregate unique id
///
/// # Implementations
///
/// - `SqlitePublishedVersionStore`: SQLite storage
/// - `MemoryPublishedVersionStore`: In-memory store for tests and local runs
#[async_trait]
pub trait PublishedVersionStore: Send + Sync {
    /// Get the published version. Returns 0 if nothing has been published.
    async fn get(&self, processor_name: &str, aggregate_type: &str, aggregate_id: &str)
        -> Result<u64>;

    /// Store the published version.
    ///
    /// Upserts: creates the cursor if it doesn't exist, advances it if it
    /// does. A version lower than the stored one is ignored.
    async fn update(
        &self,
        processor_name: &str,
        aggregate_type: &str,
        aggregate_id: &str,
        version: u64,
    ) -> Result<()>;
}
