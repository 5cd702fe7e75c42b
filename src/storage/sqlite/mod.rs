//! SQLite implementations of storage interfaces.

mod published_version_store;

pub use published_version_store::SqlitePublishedVersionStore;
