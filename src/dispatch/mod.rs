//! Sequential event dispatch.
//!
//! Event streams arrive at-least-once and in any order. For each aggregate
//! the processor applies them downstream strictly in version order, exactly
//! once, and advances the published-version cursor after each one:
//!
//! - `published + 1 == version`: dispatch, persist the cursor, complete
//! - `published + 1 < version`: hold in the aggregate's waiting set until
//!   the predecessor completes; no timer is armed
//! - `published + 1 > version`: already applied, complete without dispatch
//!
//! Streams for one aggregate go through that aggregate's mailbox, so at most
//! one stream per aggregate is in flight. Different aggregates run fully in
//! parallel. Every external call is wrapped in [`retry_unbounded`]; a logic
//! failure abandons the stream unacknowledged so the transport redelivers it.

mod mailbox;

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::config::DispatchConfig;
use crate::interfaces::{EventDispatcher, MessageContext, PublishedVersionStore, ReplySender};
use crate::messages::{
    ApplicationMessage, DomainEventHandledMessage, EventStreamMessage, QueueMessage, Reply,
};
use crate::utils::retry::{retry_unbounded, RetryAbort, RetryConfig};

use mailbox::Mailbox;

/// An event stream together with the queue message it arrived in.
pub struct ProcessingEventStream {
    pub message: EventStreamMessage,
    pub queue_message: QueueMessage,
    message_context: Arc<dyn MessageContext>,
}

impl ProcessingEventStream {
    pub fn new(
        message: EventStreamMessage,
        queue_message: QueueMessage,
        message_context: Arc<dyn MessageContext>,
    ) -> Self {
        Self {
            message,
            queue_message,
            message_context,
        }
    }
}

/// An unordered message together with the queue message it arrived in.
pub struct ProcessingMessage {
    pub message: ApplicationMessage,
    pub queue_message: QueueMessage,
    message_context: Arc<dyn MessageContext>,
}

impl ProcessingMessage {
    pub fn new(
        message: ApplicationMessage,
        queue_message: QueueMessage,
        message_context: Arc<dyn MessageContext>,
    ) -> Self {
        Self {
            message,
            queue_message,
            message_context,
        }
    }
}

struct Inner {
    processor_name: String,
    retry: RetryConfig,
    dispatcher: Arc<dyn EventDispatcher>,
    versions: Arc<dyn PublishedVersionStore>,
    reply_sender: Option<Arc<dyn ReplySender>>,
    mailboxes: DashMap<String, Arc<Mailbox>>,
}

/// Orders, deduplicates, and dispatches event streams per aggregate.
///
/// Cheap to clone; clones share mailboxes and collaborators.
#[derive(Clone)]
pub struct EventStreamProcessor {
    inner: Arc<Inner>,
}

impl EventStreamProcessor {
    /// Create a processor.
    ///
    /// `reply_sender` is used to send the event-handled reply for streams
    /// carrying a reply address; without it those replies are skipped.
    pub fn new(
        config: &DispatchConfig,
        dispatcher: Arc<dyn EventDispatcher>,
        versions: Arc<dyn PublishedVersionStore>,
        reply_sender: Option<Arc<dyn ReplySender>>,
    ) -> Self {
        info!(
            processor = %config.processor_name,
            "Event stream processor initialized"
        );
        Self {
            inner: Arc::new(Inner {
                processor_name: config.processor_name.clone(),
                retry: config.retry.clone(),
                dispatcher,
                versions,
                reply_sender,
                mailboxes: DashMap::new(),
            }),
        }
    }

    pub fn processor_name(&self) -> &str {
        &self.inner.processor_name
    }

    /// Accept an event stream for processing. Returns immediately; the
    /// stream completes (is acknowledged) asynchronously.
    pub fn process(&self, stream: ProcessingEventStream) {
        let aggregate_id = stream.message.aggregate_id.clone();

        // Enqueue under the map's entry lock so an idle mailbox cannot be
        // removed between lookup and enqueue.
        let (mailbox, start) = {
            let entry = self
                .inner
                .mailboxes
                .entry(aggregate_id.clone())
                .or_insert_with(|| Arc::new(Mailbox::new(aggregate_id)));
            let start = entry.enqueue(stream);
            (entry.value().clone(), start)
        };

        if start {
            let processor = self.clone();
            tokio::spawn(async move { processor.run(mailbox).await });
        }
    }

    /// Accept a message without ordering requirements. It is dispatched under
    /// the same retry policy and acknowledged once delivered.
    pub fn process_message(&self, processing: ProcessingMessage) {
        let processor = self.clone();
        tokio::spawn(async move { processor.handle_message(processing).await });
    }

    /// Streams currently held for `aggregate_id` awaiting a predecessor.
    pub fn waiting_count(&self, aggregate_id: &str) -> usize {
        self.inner
            .mailboxes
            .get(aggregate_id)
            .map(|mailbox| mailbox.waiting_count())
            .unwrap_or(0)
    }

    /// Aggregates with queued, running, or waiting streams.
    pub fn active_aggregates(&self) -> usize {
        self.inner.mailboxes.len()
    }

    async fn run(&self, mailbox: Arc<Mailbox>) {
        loop {
            while let Some(stream) = mailbox.dequeue() {
                self.handle(&mailbox, stream).await;
            }
            if !mailbox.release() {
                break;
            }
        }

        self.inner
            .mailboxes
            .remove_if(&mailbox.aggregate_id, |_, current| {
                Arc::ptr_eq(current, &mailbox) && current.is_idle()
            });
    }

    /// Handle one stream, then every held successor it unblocks.
    async fn handle(&self, mailbox: &Mailbox, stream: ProcessingEventStream) {
        let mut next = Some(stream);
        while let Some(stream) = next.take() {
            let published = match self.handle_one(mailbox, stream).await {
                Ok(Some(published)) => published,
                // Held, or abandoned after a logic failure.
                Ok(None) | Err(_) => return,
            };

            let (successor, stale) = mailbox.take_successor(published);
            for duplicate in stale {
                debug!(
                    aggregate_id = %duplicate.message.aggregate_id,
                    version = duplicate.message.version,
                    published,
                    "Held stream already covered by the cursor"
                );
                self.complete(duplicate).await;
            }
            next = successor;
        }
    }

    /// Returns the published version known after handling, or `None` when
    /// the stream was held for a missing predecessor.
    #[tracing::instrument(
        name = "dispatch.handle",
        skip_all,
        fields(
            aggregate_id = %stream.message.aggregate_id,
            version = stream.message.version
        )
    )]
    async fn handle_one(
        &self,
        mailbox: &Mailbox,
        stream: ProcessingEventStream,
    ) -> Result<Option<u64>, RetryAbort> {
        let inner = &*self.inner;
        let versions = &inner.versions;
        let dispatcher = &inner.dispatcher;
        let name = inner.processor_name.as_str();
        let message = &stream.message;
        let describe = || message.to_string();

        let published = retry_unbounded("GetPublishedVersion", describe, &inner.retry, move |_| {
            versions.get(name, &message.aggregate_type, &message.aggregate_id)
        })
        .await?;

        if published + 1 == message.version {
            retry_unbounded("DispatchEventStream", describe, &inner.retry, move |_| {
                dispatcher.dispatch_events(&message.events)
            })
            .await?;

            let version = message.version;
            retry_unbounded("UpdatePublishedVersion", describe, &inner.retry, move |_| {
                versions.update(name, &message.aggregate_type, &message.aggregate_id, version)
            })
            .await?;

            debug!(published = version, "Event stream dispatched");
            self.complete(stream).await;
            Ok(Some(version))
        } else if published + 1 < message.version {
            info!(
                published,
                "Event stream is ahead of the published version, holding until its predecessor completes"
            );
            if let Some(duplicate) = mailbox.park(stream) {
                debug!("Same version already held, completing duplicate delivery");
                self.complete(duplicate).await;
            }
            Ok(None)
        } else {
            debug!(published, "Event stream already published, skipping dispatch");
            self.complete(stream).await;
            Ok(Some(published))
        }
    }

    /// Acknowledge the queue message and, for the processing contract, tell
    /// the command sender its events were handled.
    async fn complete(&self, stream: ProcessingEventStream) {
        stream
            .message_context
            .on_message_handled(&stream.queue_message);

        let ProcessingEventStream { message, .. } = stream;
        let (Some(address), Some(sender)) = (message.reply_address, &self.inner.reply_sender)
        else {
            return;
        };

        let reply = Reply::EventHandled(DomainEventHandledMessage {
            command_id: message.command_id.clone(),
            aggregate_id: message.aggregate_id.clone(),
            command_result: message.command_result,
        });
        if let Err(e) = sender.send_reply(reply, &address).await {
            warn!(
                command_id = %message.command_id,
                address = %address,
                error = %e,
                "Failed to send event handled reply"
            );
        }
    }

    #[tracing::instrument(
        name = "dispatch.message",
        skip_all,
        fields(message_id = %processing.message.id, message_type = %processing.message.message_type)
    )]
    async fn handle_message(&self, processing: ProcessingMessage) {
        let dispatcher = &self.inner.dispatcher;
        let message = &processing.message;
        let describe = || format!("message [id={}, type={}]", message.id, message.message_type);

        let dispatched = retry_unbounded("DispatchMessage", describe, &self.inner.retry, move |_| {
            dispatcher.dispatch_message(message)
        })
        .await;

        if dispatched.is_ok() {
            processing
                .message_context
                .on_message_handled(&processing.queue_message);
        }
    }
}

#[cfg(test)]
mod tests;
