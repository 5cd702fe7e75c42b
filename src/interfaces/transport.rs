//! Transport-facing interfaces: acknowledgement, replies, and command sends.

use async_trait::async_trait;

use crate::messages::{CommandMessage, QueueMessage, Reply};

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Connection to {address} failed: {message}")]
    Connection { address: String, message: String },
}

/// Acknowledges inbound queue messages so the transport stops redelivering.
pub trait MessageContext: Send + Sync {
    fn on_message_handled(&self, message: &QueueMessage);
}

/// Best-effort send of a reply to a caller-supplied address.
#[async_trait]
pub trait ReplySender: Send + Sync {
    async fn send_reply(&self, reply: Reply, address: &str) -> Result<()>;
}

/// Publishes commands to the command consumer.
#[async_trait]
pub trait CommandSender: Send + Sync {
    async fn send(&self, command: &CommandMessage) -> Result<()>;
}
