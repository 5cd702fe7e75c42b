//! Message types exchanged between command handlers, the dispatch engine,
//! and the reply correlator.
//!
//! Everything here is plain data with serde derives; the TCP reply transport
//! and external brokers encode these as JSON.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Generate a fresh message identifier.
pub fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}

/// A single domain event produced by an aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub id: String,
    pub event_type: String,
    pub aggregate_id: String,
    /// Version of the aggregate the event belongs to.
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl DomainEvent {
    pub fn new(
        event_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: new_message_id(),
            event_type: event_type.into(),
            aggregate_id: aggregate_id.into(),
            version: 0,
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// One batch of events produced by a single command against one aggregate.
///
/// `version` is the aggregate version after applying `events`; the first
/// stream of an aggregate carries version 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventStreamMessage {
    pub id: String,
    pub command_id: String,
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub version: u64,
    pub events: Vec<DomainEvent>,
    /// Address to notify once the stream has been fully dispatched.
    ///
    /// Only set when the issuing command asked for the processing contract,
    /// and then on exactly one stream of that command.
    #[serde(default)]
    pub reply_address: Option<String>,
    /// Result string recorded by the command handler, echoed in the reply.
    #[serde(default)]
    pub command_result: Option<String>,
}

impl EventStreamMessage {
    pub fn new(
        command_id: impl Into<String>,
        aggregate_id: impl Into<String>,
        aggregate_type: impl Into<String>,
        version: u64,
        events: Vec<DomainEvent>,
    ) -> Self {
        Self {
            id: new_message_id(),
            command_id: command_id.into(),
            aggregate_id: aggregate_id.into(),
            aggregate_type: aggregate_type.into(),
            version,
            events,
            reply_address: None,
            command_result: None,
        }
    }

    pub fn with_reply_address(mut self, address: impl Into<String>) -> Self {
        self.reply_address = Some(address.into());
        self
    }
}

impl fmt::Display for EventStreamMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "event stream [id={}, command_id={}, aggregate={}/{}, version={}, events={}]",
            self.id,
            self.command_id,
            self.aggregate_type,
            self.aggregate_id,
            self.version,
            self.events.len()
        )
    }
}

/// A message without ordering requirements (application messages, published
/// exceptions).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationMessage {
    pub id: String,
    pub message_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Raw message as received from the transport. Acknowledged through
/// [`crate::interfaces::MessageContext`] once fully handled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub id: String,
    pub topic: String,
    pub route_key: String,
    #[serde(default)]
    pub tag: Option<String>,
    pub body: String,
}

/// Which reply a caller waits for after sending a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandReturnType {
    /// Complete once the command handler has executed.
    CommandExecuted,
    /// Complete once the resulting events have been dispatched downstream.
    EventHandled,
}

/// A command as it travels to the command consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandMessage {
    pub command_id: String,
    pub aggregate_id: String,
    pub command_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Where to send replies; absent for fire-and-forget sends.
    #[serde(default)]
    pub reply_address: Option<String>,
    #[serde(default)]
    pub return_type: Option<CommandReturnType>,
}

impl CommandMessage {
    pub fn new(
        aggregate_id: impl Into<String>,
        command_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            command_id: new_message_id(),
            aggregate_id: aggregate_id.into(),
            command_type: command_type.into(),
            payload,
            reply_address: None,
            return_type: None,
        }
    }

    /// True when the caller waits for the processing acknowledgement.
    pub fn expects_event_handled(&self) -> bool {
        self.reply_address.is_some() && self.return_type == Some(CommandReturnType::EventHandled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Success,
    NothingChanged,
    Failed,
}

impl CommandStatus {
    /// Terminal statuses complete a processing-contract command without
    /// waiting for an event-handled reply.
    pub fn is_terminal_without_events(&self) -> bool {
        matches!(self, CommandStatus::Failed | CommandStatus::NothingChanged)
    }
}

/// Outcome of a command as seen by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub status: CommandStatus,
    pub command_id: String,
    pub aggregate_id: String,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub result_type: Option<String>,
}

impl CommandResult {
    pub fn success(
        command_id: impl Into<String>,
        aggregate_id: impl Into<String>,
        result: Option<String>,
    ) -> Self {
        let result_type = result.as_ref().map(|_| "string".to_string());
        Self {
            status: CommandStatus::Success,
            command_id: command_id.into(),
            aggregate_id: aggregate_id.into(),
            result,
            result_type,
        }
    }

    pub fn failed(
        command_id: impl Into<String>,
        aggregate_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            status: CommandStatus::Failed,
            command_id: command_id.into(),
            aggregate_id: aggregate_id.into(),
            result: Some(message.into()),
            result_type: Some("string".to_string()),
        }
    }

    pub fn nothing_changed(command_id: impl Into<String>, aggregate_id: impl Into<String>) -> Self {
        Self {
            status: CommandStatus::NothingChanged,
            command_id: command_id.into(),
            aggregate_id: aggregate_id.into(),
            result: None,
            result_type: None,
        }
    }
}

/// Sent by the event consumer once the stream carrying the command's reply
/// address was dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainEventHandledMessage {
    pub command_id: String,
    pub aggregate_id: String,
    #[serde(default)]
    pub command_result: Option<String>,
}

/// Inbound reply as carried by the reply transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum Reply {
    CommandExecuted(CommandResult),
    EventHandled(DomainEventHandledMessage),
}

impl Reply {
    pub fn command_id(&self) -> &str {
        match self {
            Reply::CommandExecuted(result) => &result.command_id,
            Reply::EventHandled(message) => &message.command_id,
        }
    }
}
