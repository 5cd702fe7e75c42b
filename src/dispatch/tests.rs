use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::config::Config;
use crate::config::DEFAULT_PROCESSOR_NAME;
use crate::messages::ApplicationMessage;
use crate::storage::MemoryPublishedVersionStore;
use crate::test_utils::{
    make_event_stream, make_queue_message, wait_until, FlakyPublishedVersionStore,
    RecordingDispatcher, RecordingMessageContext, RecordingReplySender, TestAccount,
};

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    processor: EventStreamProcessor,
    dispatcher: Arc<RecordingDispatcher>,
    versions: Arc<FlakyPublishedVersionStore>,
    acks: Arc<RecordingMessageContext>,
    replies: Arc<RecordingReplySender>,
}

impl Harness {
    fn new() -> Self {
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let versions = Arc::new(FlakyPublishedVersionStore::new());
        let replies = Arc::new(RecordingReplySender::new());
        let processor = EventStreamProcessor::new(
            &Config::for_test().dispatch,
            dispatcher.clone(),
            versions.clone(),
            Some(replies.clone()),
        );
        Self {
            processor,
            dispatcher,
            versions,
            acks: Arc::new(RecordingMessageContext::new()),
            replies,
        }
    }

    fn deliver(&self, message: EventStreamMessage) {
        let queue_message = make_queue_message(&message);
        self.processor.process(ProcessingEventStream::new(
            message,
            queue_message,
            self.acks.clone(),
        ));
    }

    fn send(&self, aggregate_id: &str, version: u64) {
        self.deliver(make_event_stream(aggregate_id, version, &["AccountDeposited"]));
    }

    async fn published(&self, aggregate_id: &str) -> u64 {
        self.versions
            .get(
                self.processor.processor_name(),
                TestAccount::TYPE_NAME,
                aggregate_id,
            )
            .await
            .unwrap()
    }

    async fn wait_acks(&self, count: usize) -> bool {
        let acks = self.acks.clone();
        wait_until(WAIT, move || acks.ack_count() >= count).await
    }

    async fn wait_waiting(&self, aggregate_id: &str, count: usize) -> bool {
        let processor = self.processor.clone();
        let aggregate_id = aggregate_id.to_string();
        wait_until(WAIT, move || processor.waiting_count(&aggregate_id) == count).await
    }
}

#[tokio::test]
async fn test_in_order_streams_dispatch_and_advance_cursor() {
    let h = Harness::new();

    for version in 1..=3 {
        h.send("acc-1", version);
    }

    assert!(h.wait_acks(3).await);
    assert_eq!(h.dispatcher.versions_for("acc-1"), vec![1, 2, 3]);
    assert_eq!(h.versions.updates_for("acc-1"), vec![1, 2, 3]);
    assert_eq!(h.published("acc-1").await, 3);
}

#[tokio::test]
async fn test_stream_ahead_of_cursor_is_held_until_predecessor_arrives() {
    let h = Harness::new();

    h.send("acc-1", 3);
    h.send("acc-1", 2);
    assert!(h.wait_waiting("acc-1", 2).await);
    assert!(h.dispatcher.batches().is_empty());
    assert_eq!(h.acks.ack_count(), 0);

    h.send("acc-1", 1);

    assert!(h.wait_acks(3).await);
    assert_eq!(h.dispatcher.versions_for("acc-1"), vec![1, 2, 3]);
    assert_eq!(h.published("acc-1").await, 3);
    assert_eq!(h.processor.waiting_count("acc-1"), 0);
}

#[tokio::test]
async fn test_redelivered_stream_is_acknowledged_without_dispatch() {
    let h = Harness::new();

    h.send("acc-1", 1);
    assert!(h.wait_acks(1).await);

    h.send("acc-1", 1);
    assert!(h.wait_acks(2).await);

    assert_eq!(h.dispatcher.versions_for("acc-1"), vec![1]);
    assert_eq!(h.published("acc-1").await, 1);
}

#[tokio::test]
async fn test_duplicate_of_held_version_is_completed_immediately() {
    let h = Harness::new();

    h.send("acc-1", 3);
    h.send("acc-1", 3);
    assert!(h.wait_acks(1).await);
    assert_eq!(h.processor.waiting_count("acc-1"), 1);

    h.send("acc-1", 1);
    h.send("acc-1", 2);

    assert!(h.wait_acks(4).await);
    assert_eq!(h.dispatcher.versions_for("acc-1"), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_held_streams_covered_by_cursor_complete_as_duplicates() {
    let h = Harness::new();

    h.send("acc-1", 3);
    assert!(h.wait_waiting("acc-1", 1).await);

    // Another processor instance sharing the store got there first.
    h.versions
        .update(
            h.processor.processor_name(),
            TestAccount::TYPE_NAME,
            "acc-1",
            3,
        )
        .await
        .unwrap();

    h.send("acc-1", 2);

    assert!(h.wait_acks(2).await);
    assert!(h.dispatcher.batches().is_empty());
    assert_eq!(h.processor.waiting_count("acc-1"), 0);
}

#[tokio::test]
async fn test_transient_cursor_failures_are_retried() {
    let h = Harness::new();
    h.versions.fail_gets(3);
    h.versions.fail_updates(2);

    h.send("acc-1", 1);
    h.send("acc-1", 2);

    assert!(h.wait_acks(2).await);
    assert_eq!(h.dispatcher.versions_for("acc-1"), vec![1, 2]);
    assert_eq!(h.versions.updates_for("acc-1"), vec![1, 2]);
}

#[tokio::test]
async fn test_failed_cursor_update_does_not_redispatch() {
    let h = Harness::new();
    h.versions.fail_updates(4);

    h.send("acc-1", 1);

    assert!(h.wait_acks(1).await);
    assert_eq!(h.dispatcher.batches().len(), 1);
    assert_eq!(h.published("acc-1").await, 1);
}

#[tokio::test]
async fn test_transient_dispatch_failures_are_retried() {
    let h = Harness::new();
    h.dispatcher.fail_times(3);

    h.send("acc-1", 1);

    assert!(h.wait_acks(1).await);
    assert_eq!(h.dispatcher.versions_for("acc-1"), vec![1]);
}

#[tokio::test]
async fn test_logic_failure_abandons_stream_without_ack() {
    let h = Harness::new();
    h.dispatcher.poison("AccountFrozen");

    h.deliver(make_event_stream("acc-1", 1, &["AccountFrozen"]));
    h.send("acc-1", 2);

    assert!(h.wait_waiting("acc-1", 1).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(h.acks.ack_count(), 0);
    assert!(h.dispatcher.batches().is_empty());
    assert_eq!(h.published("acc-1").await, 0);
}

#[tokio::test]
async fn test_completed_stream_with_reply_address_sends_event_handled() {
    let h = Harness::new();
    let mut message = make_event_stream("acc-1", 1, &["AccountCreated"])
        .with_reply_address("127.0.0.1:7000");
    message.command_result = Some("opened".to_string());
    let command_id = message.command_id.clone();

    h.deliver(message);

    assert!(h.wait_acks(1).await);
    let replies = h.replies.clone();
    assert!(wait_until(WAIT, move || replies.sent().len() == 1).await);

    let (reply, address) = h.replies.sent().remove(0);
    assert_eq!(address, "127.0.0.1:7000");
    match reply {
        Reply::EventHandled(handled) => {
            assert_eq!(handled.command_id, command_id);
            assert_eq!(handled.aggregate_id, "acc-1");
            assert_eq!(handled.command_result.as_deref(), Some("opened"));
        }
        other => panic!("unexpected reply: {:?}", other),
    }
}

#[tokio::test]
async fn test_failed_event_handled_reply_still_acknowledges() {
    let h = Harness::new();
    h.replies.set_fail(true);

    h.deliver(make_event_stream("acc-1", 1, &["AccountCreated"]).with_reply_address("nowhere"));

    assert!(h.wait_acks(1).await);
    assert_eq!(h.published("acc-1").await, 1);
}

#[tokio::test]
async fn test_stream_without_reply_address_sends_no_reply() {
    let h = Harness::new();

    h.send("acc-1", 1);

    assert!(h.wait_acks(1).await);
    assert!(h.replies.sent().is_empty());
}

#[tokio::test]
async fn test_aggregates_progress_independently() {
    let dispatcher = Arc::new(RecordingDispatcher::new());
    dispatcher.set_delay(Duration::from_millis(20));
    let processor = EventStreamProcessor::new(
        &Config::for_test().dispatch,
        dispatcher.clone(),
        Arc::new(MemoryPublishedVersionStore::new()),
        None,
    );
    let acks = Arc::new(RecordingMessageContext::new());

    for aggregate in ["acc-a", "acc-b", "acc-c"] {
        for version in [2, 1] {
            let message = make_event_stream(aggregate, version, &["AccountDeposited"]);
            let queue_message = make_queue_message(&message);
            processor.process(ProcessingEventStream::new(message, queue_message, acks.clone()));
        }
    }

    let acks_probe = acks.clone();
    assert!(wait_until(WAIT, move || acks_probe.ack_count() == 6).await);
    for aggregate in ["acc-a", "acc-b", "acc-c"] {
        assert_eq!(dispatcher.versions_for(aggregate), vec![1, 2]);
    }

    let probe = processor.clone();
    assert!(wait_until(WAIT, move || probe.active_aggregates() == 0).await);
}

#[tokio::test]
async fn test_unordered_message_is_dispatched_and_acknowledged() {
    let h = Harness::new();
    h.dispatcher.fail_times(2);

    let message = ApplicationMessage {
        id: "m-1".to_string(),
        message_type: "AccountReport".to_string(),
        payload: serde_json::json!({ "total": 3 }),
    };
    let queue_message = QueueMessage {
        id: "q-m-1".to_string(),
        topic: "application-messages".to_string(),
        route_key: "m-1".to_string(),
        tag: None,
        body: String::new(),
    };
    h.processor
        .process_message(ProcessingMessage::new(message, queue_message, h.acks.clone()));

    assert!(h.wait_acks(1).await);
    assert_eq!(h.acks.acked(), vec!["q-m-1".to_string()]);
    assert_eq!(h.dispatcher.messages().len(), 1);
}

#[tokio::test]
async fn test_processor_uses_configured_name() {
    let mut config = Config::for_test().dispatch;
    config.processor_name = "BalanceProjection".to_string();
    let versions = Arc::new(MemoryPublishedVersionStore::new());
    let processor = EventStreamProcessor::new(
        &config,
        Arc::new(RecordingDispatcher::new()),
        versions.clone(),
        None,
    );
    let acks = Arc::new(RecordingMessageContext::new());

    let message = make_event_stream("acc-1", 1, &["AccountCreated"]);
    let queue_message = make_queue_message(&message);
    processor.process(ProcessingEventStream::new(message, queue_message, acks.clone()));

    let probe = acks.clone();
    assert!(wait_until(WAIT, move || probe.ack_count() == 1).await);
    assert_eq!(
        versions
            .get("BalanceProjection", TestAccount::TYPE_NAME, "acc-1")
            .await
            .unwrap(),
        1
    );
    assert_eq!(
        versions
            .get(DEFAULT_PROCESSOR_NAME, TestAccount::TYPE_NAME, "acc-1")
            .await
            .unwrap(),
        0
    );
}
