//! Abstract interfaces for causeway collaborators.
//!
//! These traits define the contracts for:
//! - Aggregates and their read-through cache / authoritative storage
//! - Published-version cursors (durable dispatch progress)
//! - Event dispatch to downstream handlers
//! - Message acknowledgement and reply/command transports

pub mod aggregate_store;
pub mod event_dispatcher;
pub mod published_version_store;
pub mod transport;

pub use aggregate_store::{
    AggregateHandle, AggregateRepository, AggregateRoot, AggregateStorage, StorageError,
};
pub use event_dispatcher::{DispatchError, EventDispatcher};
pub use published_version_store::PublishedVersionStore;
pub use transport::{CommandSender, MessageContext, ReplySender, TransportError};
