//! Ordering and idempotence of the sequential dispatch engine under
//! at-least-once, out-of-order delivery.
//!
//! Run with: cargo test --test ordering --features test-utils

use std::sync::Arc;
use std::time::Duration;

use causeway::config::Config;
use causeway::dispatch::{EventStreamProcessor, ProcessingEventStream};
use causeway::interfaces::PublishedVersionStore;
use causeway::messages::EventStreamMessage;
use causeway::storage::MemoryPublishedVersionStore;
use causeway::test_utils::{
    make_event_stream, make_queue_message, wait_until, RecordingDispatcher,
    RecordingMessageContext, TestAccount,
};

const WAIT: Duration = Duration::from_secs(10);

struct Fixture {
    processor: EventStreamProcessor,
    dispatcher: Arc<RecordingDispatcher>,
    versions: Arc<MemoryPublishedVersionStore>,
    acks: Arc<RecordingMessageContext>,
}

fn fixture(processor_name: &str) -> Fixture {
    let mut config = Config::for_test();
    config.dispatch.processor_name = processor_name.to_string();

    let dispatcher = Arc::new(RecordingDispatcher::new());
    let versions = Arc::new(MemoryPublishedVersionStore::new());
    let processor =
        EventStreamProcessor::new(&config.dispatch, dispatcher.clone(), versions.clone(), None);
    Fixture {
        processor,
        dispatcher,
        versions,
        acks: Arc::new(RecordingMessageContext::new()),
    }
}

impl Fixture {
    fn deliver(&self, message: EventStreamMessage) {
        let queue_message = make_queue_message(&message);
        self.processor.process(ProcessingEventStream::new(
            message,
            queue_message,
            self.acks.clone(),
        ));
    }

    async fn wait_acks(&self, count: usize) {
        let acks = self.acks.clone();
        assert!(
            wait_until(WAIT, move || acks.ack_count() >= count).await,
            "expected {} acknowledgements, saw {}",
            count,
            self.acks.ack_count()
        );
    }

    async fn cursor(&self, aggregate_id: &str) -> u64 {
        self.versions
            .get(
                self.processor.processor_name(),
                TestAccount::TYPE_NAME,
                aggregate_id,
            )
            .await
            .unwrap()
    }
}

fn permutations(items: &[u64]) -> Vec<Vec<u64>> {
    if items.len() <= 1 {
        return vec![items.to_vec()];
    }
    let mut all = Vec::new();
    for (i, first) in items.iter().enumerate() {
        let mut rest = items.to_vec();
        rest.remove(i);
        for mut tail in permutations(&rest) {
            tail.insert(0, *first);
            all.push(tail);
        }
    }
    all
}

#[tokio::test]
async fn test_duplicate_redelivery_alongside_next_version() {
    let f = fixture("S");

    f.deliver(make_event_stream("A1", 1, &["E1"]));
    f.wait_acks(1).await;

    let batches = f.dispatcher.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0][0].event_type, "E1");
    assert_eq!(f.cursor("A1").await, 1);

    f.deliver(make_event_stream("A1", 2, &["E2", "E3"]));
    f.deliver(make_event_stream("A1", 1, &["E1"]));
    f.wait_acks(3).await;

    let types: Vec<Vec<String>> = f
        .dispatcher
        .batches()
        .iter()
        .map(|batch| batch.iter().map(|e| e.event_type.clone()).collect())
        .collect();
    assert_eq!(
        types,
        vec![
            vec!["E1".to_string()],
            vec!["E2".to_string(), "E3".to_string()]
        ]
    );
    assert_eq!(f.cursor("A1").await, 2);
}

#[tokio::test]
async fn test_every_delivery_order_dispatches_in_version_order() {
    for order in permutations(&[1, 2, 3, 4]) {
        let f = fixture("S");

        // Each order is followed by a redelivery of its first and last stream.
        let mut deliveries = order.clone();
        deliveries.push(order[0]);
        deliveries.push(order[3]);

        for version in &deliveries {
            f.deliver(make_event_stream("A1", *version, &["AccountDeposited"]));
        }
        f.wait_acks(deliveries.len()).await;

        assert_eq!(
            f.dispatcher.versions_for("A1"),
            vec![1, 2, 3, 4],
            "delivery order {:?}",
            deliveries
        );
        assert_eq!(f.cursor("A1").await, 4);
        assert_eq!(f.processor.waiting_count("A1"), 0);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_aggregates_from_concurrent_producers() {
    const AGGREGATES: usize = 40;
    const VERSIONS: u64 = 6;

    let f = Arc::new(fixture("S"));
    f.dispatcher.set_delay(Duration::from_millis(1));

    let mut producers = Vec::new();
    for producer in 0..3u64 {
        let f = f.clone();
        producers.push(tokio::spawn(async move {
            for a in 0..AGGREGATES {
                // Producers walk versions in different orders; all overlap.
                let mut versions: Vec<u64> = (1..=VERSIONS).collect();
                versions.rotate_left(((a as u64 + producer) % VERSIONS) as usize);
                if producer == 1 {
                    versions.reverse();
                }
                for version in versions {
                    f.deliver(make_event_stream(
                        &format!("acc-{}", a),
                        version,
                        &["AccountDeposited"],
                    ));
                    tokio::task::yield_now().await;
                }
            }
        }));
    }
    for producer in producers {
        producer.await.unwrap();
    }

    f.wait_acks(3 * AGGREGATES * VERSIONS as usize).await;

    for a in 0..AGGREGATES {
        let aggregate_id = format!("acc-{}", a);
        assert_eq!(
            f.dispatcher.versions_for(&aggregate_id),
            (1..=VERSIONS).collect::<Vec<_>>(),
            "aggregate {}",
            aggregate_id
        );
        assert_eq!(f.cursor(&aggregate_id).await, VERSIONS);
    }

    let processor = f.processor.clone();
    assert!(wait_until(WAIT, move || processor.active_aggregates() == 0).await);
}

#[tokio::test]
async fn test_transient_failures_do_not_break_order() {
    let f = fixture("S");
    f.dispatcher.fail_times(5);

    for version in [3, 1, 2] {
        f.deliver(make_event_stream("A1", version, &["AccountDeposited"]));
    }
    f.wait_acks(3).await;

    assert_eq!(f.dispatcher.versions_for("A1"), vec![1, 2, 3]);
}
