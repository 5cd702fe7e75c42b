//! Event dispatcher interface.

use async_trait::async_trait;

use crate::messages::{ApplicationMessage, DomainEvent};
use crate::utils::retry::Retryable;

/// Result type for dispatch operations.
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Errors that can occur while delivering messages to downstream handlers.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// A downstream handler failed; the engine retries.
    #[error("Handler '{name}' failed: {message}")]
    HandlerFailed { name: String, message: String },

    /// The dispatcher reached a state it cannot recover from by retrying.
    #[error("Dispatch invariant violated: {0}")]
    Invariant(String),
}

impl Retryable for DispatchError {
    fn is_retryable(&self) -> bool {
        matches!(self, DispatchError::HandlerFailed { .. })
    }
}

/// Delivers messages to every registered downstream handler.
///
/// Dispatchers do not retry; failures are retried by the caller.
#[async_trait]
pub trait EventDispatcher: Send + Sync {
    /// Deliver an ordered sequence of events.
    async fn dispatch_events(&self, events: &[DomainEvent]) -> Result<()>;

    /// Deliver a message without ordering requirements.
    async fn dispatch_message(&self, message: &ApplicationMessage) -> Result<()>;
}
