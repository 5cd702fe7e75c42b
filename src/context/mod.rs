//! Per-command aggregate tracking.
//!
//! A [`CommandContext`] is created for one command execution and handed to
//! the command handler. It tracks every aggregate the handler creates or
//! loads, so that a second lookup of the same id returns the same handle
//! and the caller can collect the resulting event streams afterwards.
//!
//! The tracked map is a concurrent map: a handler may fan out internally
//! and register or look up aggregates from several tasks. A context is
//! never shared between two command executions.

use std::any::type_name;
use std::sync::{Arc, PoisonError, RwLock};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use crate::interfaces::{
    AggregateHandle, AggregateRepository, AggregateRoot, AggregateStorage, MessageContext,
    ReplySender, StorageError, TransportError,
};
use crate::messages::{CommandMessage, CommandResult, EventStreamMessage, QueueMessage, Reply};

/// Result type for context operations.
pub type Result<T> = std::result::Result<T, ContextError>;

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("Aggregate already tracked: type={aggregate_type}, id={id}")]
    AlreadyTracked { id: String, aggregate_type: String },

    #[error("Aggregate {id} is not a {expected}")]
    TypeMismatch { id: String, expected: &'static str },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Collaborators shared by every context created by one command consumer.
#[derive(Clone)]
pub struct ContextServices {
    pub repository: Arc<dyn AggregateRepository>,
    pub storage: Arc<dyn AggregateStorage>,
    pub message_context: Arc<dyn MessageContext>,
    pub reply_sender: Arc<dyn ReplySender>,
}

/// Scratch space for one command execution.
pub struct CommandContext {
    tracked: DashMap<String, AggregateHandle>,
    services: ContextServices,
    queue_message: QueueMessage,
    command: CommandMessage,
    result: RwLock<Option<String>>,
}

impl CommandContext {
    pub fn new(
        services: ContextServices,
        queue_message: QueueMessage,
        command: CommandMessage,
    ) -> Self {
        Self {
            tracked: DashMap::new(),
            services,
            queue_message,
            command,
            result: RwLock::new(None),
        }
    }

    /// The command being executed.
    pub fn command(&self) -> &CommandMessage {
        &self.command
    }

    /// Register a newly created aggregate.
    pub fn add(&self, aggregate: AggregateHandle) -> Result<()> {
        match self.tracked.entry(aggregate.unique_id().to_string()) {
            Entry::Occupied(_) => Err(ContextError::AlreadyTracked {
                id: aggregate.unique_id().to_string(),
                aggregate_type: aggregate.type_name().to_string(),
            }),
            Entry::Vacant(entry) => {
                entry.insert(aggregate);
                Ok(())
            }
        }
    }

    /// Get an aggregate, loading and tracking it if this execution has not
    /// seen it yet.
    ///
    /// With `prefer_cache` the read-through repository is consulted,
    /// otherwise the authoritative storage. Returns `None` when neither has
    /// the aggregate.
    pub async fn get(
        &self,
        id: &str,
        aggregate_type: &str,
        prefer_cache: bool,
    ) -> Result<Option<AggregateHandle>> {
        if let Some(tracked) = self.tracked.get(id).map(|entry| entry.value().clone()) {
            return Ok(Some(tracked));
        }

        let loaded = if prefer_cache {
            self.services.repository.get(aggregate_type, id).await?
        } else {
            self.services.storage.get(aggregate_type, id).await?
        };

        let Some(loaded) = loaded else {
            debug!(aggregate_id = %id, aggregate_type, prefer_cache, "Aggregate not found");
            return Ok(None);
        };

        // A concurrent load of the same id may have won; keep a single handle.
        let handle = self
            .tracked
            .entry(loaded.unique_id().to_string())
            .or_insert(loaded)
            .value()
            .clone();
        Ok(Some(handle))
    }

    /// [`get`](Self::get) through the read-through repository. This is the
    /// default lookup for command handlers.
    pub async fn get_cached(
        &self,
        id: &str,
        aggregate_type: &str,
    ) -> Result<Option<AggregateHandle>> {
        self.get(id, aggregate_type, true).await
    }

    /// Typed variant of [`get`](Self::get).
    pub async fn get_as<A: AggregateRoot>(
        &self,
        id: &str,
        aggregate_type: &str,
        prefer_cache: bool,
    ) -> Result<Option<Arc<A>>> {
        match self.get(id, aggregate_type, prefer_cache).await? {
            Some(handle) => handle
                .into_any()
                .downcast::<A>()
                .map(Some)
                .map_err(|_| ContextError::TypeMismatch {
                    id: id.to_string(),
                    expected: type_name::<A>(),
                }),
            None => Ok(None),
        }
    }

    /// Every aggregate touched so far.
    pub fn tracked_aggregates(&self) -> Vec<AggregateHandle> {
        self.tracked.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Event streams for every tracked aggregate with uncommitted changes,
    /// ordered by aggregate id.
    ///
    /// For the processing contract exactly one stream carries the reply
    /// address: the one for the command's own aggregate, or the first stream
    /// when that aggregate did not change. The event-handled reply is sent
    /// once, when that stream has been dispatched.
    pub fn event_streams(&self) -> Vec<EventStreamMessage> {
        let result = self.result();

        let mut streams: Vec<EventStreamMessage> = self
            .tracked
            .iter()
            .filter_map(|entry| {
                let aggregate = entry.value();
                let changes = aggregate.changes();
                if changes.is_empty() {
                    return None;
                }
                let mut stream = EventStreamMessage::new(
                    self.command.command_id.clone(),
                    aggregate.unique_id(),
                    aggregate.type_name(),
                    aggregate.version() + 1,
                    changes,
                );
                stream.command_result = result.clone();
                Some(stream)
            })
            .collect();
        streams.sort_by(|a, b| a.aggregate_id.cmp(&b.aggregate_id));

        if self.command.expects_event_handled() && !streams.is_empty() {
            let carrier = streams
                .iter()
                .position(|s| s.aggregate_id == self.command.aggregate_id)
                .unwrap_or(0);
            streams[carrier].reply_address = self.command.reply_address.clone();
        }
        streams
    }

    /// Result string recorded by the handler.
    pub fn result(&self) -> Option<String> {
        self.result
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_result(&self, result: impl Into<String>) {
        *self.result.write().unwrap_or_else(PoisonError::into_inner) = Some(result.into());
    }

    /// Release tracked aggregates and the recorded result.
    pub fn clear(&self) {
        self.tracked.clear();
        *self.result.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Acknowledge the inbound command and, if the caller supplied a reply
    /// address, send it the execution result.
    #[tracing::instrument(
        name = "context.on_executed",
        skip_all,
        fields(command_id = %self.command.command_id, status = ?result.status)
    )]
    pub async fn on_executed(
        &self,
        result: CommandResult,
    ) -> std::result::Result<(), TransportError> {
        self.services
            .message_context
            .on_message_handled(&self.queue_message);

        match self.command.reply_address.as_deref() {
            Some(address) if !address.is_empty() => {
                self.services
                    .reply_sender
                    .send_reply(Reply::CommandExecuted(result), address)
                    .await
            }
            _ => Ok(()),
        }
    }
}
