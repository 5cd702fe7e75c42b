//! Test utilities and recording implementations.
//!
//! This module provides in-memory implementations of the collaborator
//! traits that record what they were asked to do, plus knobs to inject
//! transient failures.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::interfaces::aggregate_store::Result as StorageResult;
use crate::interfaces::event_dispatcher::Result as DispatchResult;
use crate::interfaces::transport::Result as TransportResult;
use crate::interfaces::{
    AggregateRoot, CommandSender, DispatchError, EventDispatcher, MessageContext,
    PublishedVersionStore, ReplySender, StorageError, TransportError,
};
use crate::messages::{
    ApplicationMessage, CommandMessage, DomainEvent, EventStreamMessage, QueueMessage, Reply,
};
use crate::storage::MemoryPublishedVersionStore;

/// Poll `condition` every few milliseconds until it holds or `timeout` expires.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Build a queue message wrapping an event stream.
pub fn make_queue_message(stream: &EventStreamMessage) -> QueueMessage {
    QueueMessage {
        id: format!("q-{}-{}", stream.aggregate_id, stream.version),
        topic: "domain-events".to_string(),
        route_key: stream.aggregate_id.clone(),
        tag: None,
        body: serde_json::to_string(stream).unwrap_or_default(),
    }
}

/// Build an event stream with one event per name in `event_types`.
pub fn make_event_stream(aggregate_id: &str, version: u64, event_types: &[&str]) -> EventStreamMessage {
    let events = event_types
        .iter()
        .map(|event_type| {
            let mut event = DomainEvent::new(*event_type, aggregate_id, json!({}));
            event.version = version;
            event
        })
        .collect();
    EventStreamMessage::new(
        format!("cmd-{}-{}", aggregate_id, version),
        aggregate_id,
        TestAccount::TYPE_NAME,
        version,
        events,
    )
}

// ============================================================================
// Aggregate
// ============================================================================

#[derive(Default)]
struct AccountState {
    balance: i64,
    changes: Vec<DomainEvent>,
}

/// Bank account aggregate used across tests.
pub struct TestAccount {
    id: String,
    owner: String,
    version: u64,
    state: Mutex<AccountState>,
}

impl TestAccount {
    pub const TYPE_NAME: &'static str = "BankAccount";

    /// A freshly opened account; records an `AccountCreated` change.
    pub fn new(id: &str, owner: &str) -> Self {
        let account = Self::loaded(id, owner, 0);
        account.apply("AccountCreated", json!({ "owner": owner }));
        account
    }

    /// An account as rebuilt from storage at `version`, without changes.
    pub fn loaded(id: &str, owner: &str, version: u64) -> Self {
        Self {
            id: id.to_string(),
            owner: owner.to_string(),
            version,
            state: Mutex::new(AccountState::default()),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn deposit(&self, amount: i64) {
        self.apply("AccountDeposited", json!({ "amount": amount }));
    }

    pub fn balance(&self) -> i64 {
        self.state.lock().map(|s| s.balance).unwrap_or(0)
    }

    fn apply(&self, event_type: &str, payload: serde_json::Value) {
        let mut state = self.state.lock().unwrap();
        if let Some(amount) = payload.get("amount").and_then(|a| a.as_i64()) {
            state.balance += amount;
        }
        let mut event = DomainEvent::new(event_type, &self.id, payload);
        event.version = self.version + 1;
        state.changes.push(event);
    }
}

impl AggregateRoot for TestAccount {
    fn unique_id(&self) -> &str {
        &self.id
    }

    fn type_name(&self) -> &str {
        Self::TYPE_NAME
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn changes(&self) -> Vec<DomainEvent> {
        self.state
            .lock()
            .map(|s| s.changes.clone())
            .unwrap_or_default()
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// A second aggregate type, for typed-lookup mismatches.
pub struct TestTransfer {
    id: String,
}

impl TestTransfer {
    pub const TYPE_NAME: &'static str = "TransferTransaction";

    pub fn new(id: &str) -> Self {
        Self { id: id.to_string() }
    }
}

impl AggregateRoot for TestTransfer {
    fn unique_id(&self) -> &str {
        &self.id
    }

    fn type_name(&self) -> &str {
        Self::TYPE_NAME
    }

    fn version(&self) -> u64 {
        0
    }

    fn changes(&self) -> Vec<DomainEvent> {
        Vec::new()
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Dispatcher that records every batch it delivers.
#[derive(Default)]
pub struct RecordingDispatcher {
    batches: Mutex<Vec<Vec<DomainEvent>>>,
    messages: Mutex<Vec<ApplicationMessage>>,
    /// Remaining transient failures to inject before succeeding.
    failures_remaining: AtomicU32,
    /// Event type that triggers a non-retryable failure.
    poison_event_type: Mutex<Option<String>>,
    delay: Mutex<Option<Duration>>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_times(&self, times: u32) {
        self.failures_remaining.store(times, Ordering::SeqCst);
    }

    pub fn poison(&self, event_type: &str) {
        *self.poison_event_type.lock().unwrap() = Some(event_type.to_string());
    }

    /// Slow every dispatch down, to widen race windows.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn batches(&self) -> Vec<Vec<DomainEvent>> {
        self.batches.lock().unwrap().clone()
    }

    /// Versions of the dispatched batches for one aggregate, in dispatch order.
    pub fn versions_for(&self, aggregate_id: &str) -> Vec<u64> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .filter_map(|batch| batch.first())
            .filter(|event| event.aggregate_id == aggregate_id)
            .map(|event| event.version)
            .collect()
    }

    pub fn messages(&self) -> Vec<ApplicationMessage> {
        self.messages.lock().unwrap().clone()
    }

    fn take_failure(&self) -> bool {
        self.failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl EventDispatcher for RecordingDispatcher {
    async fn dispatch_events(&self, events: &[DomainEvent]) -> DispatchResult<()> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let poison = self.poison_event_type.lock().unwrap().clone();
        if let Some(poison) = poison {
            if events.iter().any(|e| e.event_type == poison) {
                return Err(DispatchError::Invariant(format!("poison event {}", poison)));
            }
        }
        if self.take_failure() {
            return Err(DispatchError::HandlerFailed {
                name: "recording".to_string(),
                message: "injected failure".to_string(),
            });
        }
        self.batches.lock().unwrap().push(events.to_vec());
        Ok(())
    }

    async fn dispatch_message(&self, message: &ApplicationMessage) -> DispatchResult<()> {
        if self.take_failure() {
            return Err(DispatchError::HandlerFailed {
                name: "recording".to_string(),
                message: "injected failure".to_string(),
            });
        }
        self.messages.lock().unwrap().push(message.clone());
        Ok(())
    }
}

// ============================================================================
// Acknowledgement and transports
// ============================================================================

/// Message context recording acknowledged queue message ids.
#[derive(Default)]
pub struct RecordingMessageContext {
    acked: Mutex<Vec<String>>,
}

impl RecordingMessageContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acked(&self) -> Vec<String> {
        self.acked.lock().unwrap().clone()
    }

    pub fn ack_count(&self) -> usize {
        self.acked.lock().unwrap().len()
    }
}

impl MessageContext for RecordingMessageContext {
    fn on_message_handled(&self, message: &QueueMessage) {
        self.acked.lock().unwrap().push(message.id.clone());
    }
}

/// Reply sender recording (reply, address) pairs.
#[derive(Default)]
pub struct RecordingReplySender {
    sent: Mutex<Vec<(Reply, String)>>,
    fail: Mutex<bool>,
}

impl RecordingReplySender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }

    pub fn sent(&self) -> Vec<(Reply, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReplySender for RecordingReplySender {
    async fn send_reply(&self, reply: Reply, address: &str) -> TransportResult<()> {
        if *self.fail.lock().unwrap() {
            return Err(TransportError::Connection {
                address: address.to_string(),
                message: "injected failure".to_string(),
            });
        }
        self.sent.lock().unwrap().push((reply, address.to_string()));
        Ok(())
    }
}

/// Command sender recording sent commands.
#[derive(Default)]
pub struct RecordingCommandSender {
    sent: Mutex<Vec<CommandMessage>>,
    fail: Mutex<bool>,
}

impl RecordingCommandSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }

    pub fn sent(&self) -> Vec<CommandMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandSender for RecordingCommandSender {
    async fn send(&self, command: &CommandMessage) -> TransportResult<()> {
        if *self.fail.lock().unwrap() {
            return Err(TransportError::Connection {
                address: "broker".to_string(),
                message: "injected failure".to_string(),
            });
        }
        self.sent.lock().unwrap().push(command.clone());
        Ok(())
    }
}

// ============================================================================
// Published versions
// ============================================================================

/// Published-version store that fails a configurable number of calls.
#[derive(Default)]
pub struct FlakyPublishedVersionStore {
    inner: MemoryPublishedVersionStore,
    get_failures: AtomicU32,
    update_failures: AtomicU32,
    updates: Mutex<HashMap<String, Vec<u64>>>,
}

impl FlakyPublishedVersionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_gets(&self, times: u32) {
        self.get_failures.store(times, Ordering::SeqCst);
    }

    pub fn fail_updates(&self, times: u32) {
        self.update_failures.store(times, Ordering::SeqCst);
    }

    /// Every version written for an aggregate, in write order.
    pub fn updates_for(&self, aggregate_id: &str) -> Vec<u64> {
        self.updates
            .lock()
            .unwrap()
            .get(aggregate_id)
            .cloned()
            .unwrap_or_default()
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl PublishedVersionStore for FlakyPublishedVersionStore {
    async fn get(
        &self,
        processor_name: &str,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> StorageResult<u64> {
        if Self::take(&self.get_failures) {
            return Err(StorageError::Unavailable("injected get failure".to_string()));
        }
        self.inner
            .get(processor_name, aggregate_type, aggregate_id)
            .await
    }

    async fn update(
        &self,
        processor_name: &str,
        aggregate_type: &str,
        aggregate_id: &str,
        version: u64,
    ) -> StorageResult<()> {
        if Self::take(&self.update_failures) {
            return Err(StorageError::Unavailable(
                "injected update failure".to_string(),
            ));
        }
        self.updates
            .lock()
            .unwrap()
            .entry(aggregate_id.to_string())
            .or_default()
            .push(version);
        self.inner
            .update(processor_name, aggregate_type, aggregate_id, version)
            .await
    }
}
