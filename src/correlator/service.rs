//! Caller-facing command service on top of the correlator.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::{ReplyCorrelator, Result};
use crate::interfaces::transport::Result as TransportResult;
use crate::interfaces::CommandSender;
use crate::messages::{CommandMessage, CommandResult, CommandReturnType};

const ABANDONED_MESSAGE: &str = "The command reply was abandoned.";
const TIMEOUT_MESSAGE: &str = "Timed out waiting for the command reply.";

/// Sends commands and awaits their replies.
pub struct CommandService {
    sender: Arc<dyn CommandSender>,
    correlator: Arc<ReplyCorrelator>,
    reply_address: String,
}

impl CommandService {
    /// `reply_address` is where command consumers send replies; it must
    /// reach the server feeding `correlator`'s inbox.
    pub fn new(
        sender: Arc<dyn CommandSender>,
        correlator: Arc<ReplyCorrelator>,
        reply_address: impl Into<String>,
    ) -> Self {
        Self {
            sender,
            correlator,
            reply_address: reply_address.into(),
        }
    }

    pub fn reply_address(&self) -> &str {
        &self.reply_address
    }

    /// Fire and forget: no reply is requested or awaited.
    pub async fn send(&self, command: &CommandMessage) -> TransportResult<()> {
        self.sender.send(command).await
    }

    /// Send `command` and wait until the reply of kind `return_type` arrives.
    ///
    /// Transport failures come back as a failed [`CommandResult`]. Only a
    /// duplicate command id is an error.
    #[tracing::instrument(
        name = "command.execute",
        skip_all,
        fields(command_id = %command.command_id, aggregate_id = %command.aggregate_id)
    )]
    pub async fn execute(
        &self,
        mut command: CommandMessage,
        return_type: CommandReturnType,
    ) -> Result<CommandResult> {
        command.reply_address = Some(self.reply_address.clone());
        command.return_type = Some(return_type);

        let receiver =
            self.correlator
                .register(&command.command_id, &command.aggregate_id, return_type)?;

        if let Err(e) = self.sender.send(&command).await {
            warn!(error = %e, "Command send failed");
            self.correlator.on_send_failed(&command.command_id);
        } else {
            debug!(?return_type, "Command sent, awaiting reply");
        }

        Ok(receiver.await.unwrap_or_else(|_| {
            CommandResult::failed(
                command.command_id.as_str(),
                command.aggregate_id.as_str(),
                ABANDONED_MESSAGE,
            )
        }))
    }

    /// Like [`execute`], but gives up after `timeout`. On expiry the pending
    /// entry is dropped, so a late reply is ignored.
    ///
    /// [`execute`]: CommandService::execute
    pub async fn execute_with_timeout(
        &self,
        command: CommandMessage,
        return_type: CommandReturnType,
        timeout: Duration,
    ) -> Result<CommandResult> {
        let command_id = command.command_id.clone();
        let aggregate_id = command.aggregate_id.clone();

        match tokio::time::timeout(timeout, self.execute(command, return_type)).await {
            Ok(result) => result,
            Err(_) => {
                self.correlator.cancel(&command_id);
                warn!(
                    %command_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Timed out waiting for command reply"
                );
                Ok(CommandResult::failed(command_id, aggregate_id, TIMEOUT_MESSAGE))
            }
        }
    }
}
