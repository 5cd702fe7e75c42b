//! Reply correlation.
//!
//! A caller that sends a command registers a completion under the command
//! id. Replies arrive asynchronously, usually over the network, and are fed
//! into a [`ReplyInbox`]. Two processing loops, one per reply kind, drain the
//! inbox and fulfil the matching completion.
//!
//! Every fulfilment path removes the pending entry from the map first and
//! only then completes it, so a command id is fulfilled at most once no
//! matter how many replies arrive for it or which loop sees them.

mod service;

use std::sync::{Arc, Mutex, PoisonError};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::messages::{CommandResult, CommandReturnType, DomainEventHandledMessage, Reply};

pub use service::CommandService;

/// Result message used when a command never reached the transport.
pub const SEND_FAILED_MESSAGE: &str = "Failed to send the command.";

/// Result type for correlator operations.
pub type Result<T> = std::result::Result<T, CorrelatorError>;

#[derive(Debug, thiserror::Error)]
pub enum CorrelatorError {
    #[error("A reply is already pending for command {command_id}")]
    DuplicateRegistration { command_id: String },

    #[error("Reply correlator is shut down")]
    Closed,
}

/// Completion handle fulfilled with the command's final result.
pub type Completion = oneshot::Sender<CommandResult>;

struct PendingCommand {
    aggregate_id: String,
    return_type: CommandReturnType,
    completion: Completion,
}

type PendingMap = DashMap<String, PendingCommand>;

type InboxReceivers = (
    mpsc::UnboundedReceiver<CommandResult>,
    mpsc::UnboundedReceiver<DomainEventHandledMessage>,
);

/// Cloneable feed into the correlator's processing loops.
///
/// Network receive paths only enqueue; completion handlers run on the
/// correlator's own tasks.
#[derive(Clone)]
pub struct ReplyInbox {
    executed: mpsc::UnboundedSender<CommandResult>,
    handled: mpsc::UnboundedSender<DomainEventHandledMessage>,
}

impl ReplyInbox {
    pub fn deliver(&self, reply: Reply) -> Result<()> {
        match reply {
            Reply::CommandExecuted(result) => self
                .executed
                .send(result)
                .map_err(|_| CorrelatorError::Closed),
            Reply::EventHandled(message) => self
                .handled
                .send(message)
                .map_err(|_| CorrelatorError::Closed),
        }
    }
}

/// Matches inbound replies to pending command completions.
pub struct ReplyCorrelator {
    pending: Arc<PendingMap>,
    inbox: ReplyInbox,
    receivers: Mutex<Option<InboxReceivers>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for ReplyCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplyCorrelator {
    /// Create a stopped correlator. Replies delivered before [`start`] are
    /// buffered.
    ///
    /// [`start`]: ReplyCorrelator::start
    pub fn new() -> Self {
        let (executed_tx, executed_rx) = mpsc::unbounded_channel();
        let (handled_tx, handled_rx) = mpsc::unbounded_channel();
        Self {
            pending: Arc::new(DashMap::new()),
            inbox: ReplyInbox {
                executed: executed_tx,
                handled: handled_tx,
            },
            receivers: Mutex::new(Some((executed_rx, handled_rx))),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn inbox(&self) -> ReplyInbox {
        self.inbox.clone()
    }

    /// Spawn the two reply processing loops. Calling it again is a no-op.
    pub fn start(&self) {
        let receivers = self
            .receivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some((mut executed, mut handled)) = receivers else {
            warn!("Reply correlator already started");
            return;
        };

        let pending = self.pending.clone();
        let executed_loop = tokio::spawn(async move {
            while let Some(result) = executed.recv().await {
                on_command_executed(&pending, result);
            }
        });

        let pending = self.pending.clone();
        let handled_loop = tokio::spawn(async move {
            while let Some(message) = handled.recv().await {
                on_event_handled(&pending, message);
            }
        });

        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([executed_loop, handled_loop]);
        info!("Reply correlator started");
    }

    /// Stop the processing loops. Pending entries stay registered.
    pub fn shutdown(&self) {
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }
        info!(pending = self.pending.len(), "Reply correlator stopped");
    }

    /// Register a completion for `command_id`.
    pub fn register_pending(
        &self,
        command_id: &str,
        aggregate_id: &str,
        return_type: CommandReturnType,
        completion: Completion,
    ) -> Result<()> {
        match self.pending.entry(command_id.to_string()) {
            Entry::Occupied(_) => Err(CorrelatorError::DuplicateRegistration {
                command_id: command_id.to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(PendingCommand {
                    aggregate_id: aggregate_id.to_string(),
                    return_type,
                    completion,
                });
                Ok(())
            }
        }
    }

    /// Register and return the receiving half of a fresh completion.
    pub fn register(
        &self,
        command_id: &str,
        aggregate_id: &str,
        return_type: CommandReturnType,
    ) -> Result<oneshot::Receiver<CommandResult>> {
        let (completion, receiver) = oneshot::channel();
        self.register_pending(command_id, aggregate_id, return_type, completion)?;
        Ok(receiver)
    }

    /// Fail a pending command whose send did not reach the transport.
    pub fn on_send_failed(&self, command_id: &str) {
        if let Some((command_id, pending)) = self.pending.remove(command_id) {
            let result = CommandResult::failed(
                command_id.as_str(),
                pending.aggregate_id.as_str(),
                SEND_FAILED_MESSAGE,
            );
            fulfil(&command_id, pending.completion, result);
        }
    }

    /// Drop a pending entry without fulfilling it. Returns whether it existed.
    pub fn cancel(&self, command_id: &str) -> bool {
        self.pending.remove(command_id).is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl Drop for ReplyCorrelator {
    fn drop(&mut self) {
        for task in self
            .tasks
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
    }
}

/// Execution acknowledgement from the command consumer.
///
/// Completes callers waiting for execution. Callers waiting for event
/// handling only complete here on a status that will produce no events.
fn on_command_executed(pending: &PendingMap, result: CommandResult) {
    let taken = pending.remove_if(&result.command_id, |_, entry| match entry.return_type {
        CommandReturnType::CommandExecuted => true,
        CommandReturnType::EventHandled => result.status.is_terminal_without_events(),
    });

    match taken {
        Some((command_id, entry)) => fulfil(&command_id, entry.completion, result),
        None => debug!(
            command_id = %result.command_id,
            status = ?result.status,
            "No pending command completed by execution reply"
        ),
    }
}

/// Every stream of the command was dispatched; final success.
fn on_event_handled(pending: &PendingMap, message: DomainEventHandledMessage) {
    let Some((command_id, entry)) = pending.remove(&message.command_id) else {
        debug!(command_id = %message.command_id, "No pending command for event handled reply");
        return;
    };
    let result = CommandResult::success(
        command_id.as_str(),
        message.aggregate_id,
        message.command_result,
    );
    fulfil(&command_id, entry.completion, result);
}

fn fulfil(command_id: &str, completion: Completion, result: CommandResult) {
    let status = result.status;
    if completion.send(result).is_err() {
        debug!(%command_id, "Command caller stopped waiting before the reply");
    } else {
        debug!(%command_id, ?status, "Command reply fulfilled");
    }
}
