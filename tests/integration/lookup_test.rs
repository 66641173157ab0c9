// tests/integration/lookup_test.rs

//! Discovery mode: lookup polling, per-URL error tolerance, and RDY
//! rotation across producers.

use super::mock_lookupd::{LookupMode, MockLookupd};
use super::mock_nsqd::{MockBehavior, MockNsqd};
use super::test_helpers::{TEST_ID, init_tracing, test_connection_config, within};
use nsq_client::{Subscriber, SubscriberConfig, SubscriberEvent};

fn lookup_subscriber(lookups: Vec<String>, discover_frequency_ms: u64) -> Subscriber {
    let mut config = SubscriberConfig::new("test", "ch");
    config.lookup = lookups;
    config.concurrency = 1;
    config.discover_frequency_ms = discover_frequency_ms;
    config.connection = test_connection_config();
    Subscriber::new(config).unwrap()
}

async fn await_lookup_failure(
    events: &mut tokio::sync::broadcast::Receiver<SubscriberEvent>,
    failing_host: &str,
) {
    within(async {
        loop {
            match events.recv().await.expect("event stream ended") {
                SubscriberEvent::LookupFailed { host, error } => {
                    assert_eq!(host, failing_host);
                    assert_eq!(error.code(), Some("ELOOKUPERROR"));
                    return;
                }
                _ => continue,
            }
        }
    })
    .await
}

#[tokio::test]
async fn test_lookup_404_never_aborts_the_poll() {
    init_tracing();
    let mut nsqd = MockNsqd::start(MockBehavior::default()).await;

    let good = MockLookupd::start().await;
    good.set_producers(vec![("127.0.0.1".into(), nsqd.port())]);
    let bad = MockLookupd::start().await;
    bad.set_mode(LookupMode::NotFound);

    let mut subscriber = lookup_subscriber(vec![bad.url(), good.url()], 60_000);
    let mut events = subscriber.events();
    subscriber.connect().await.unwrap();

    await_lookup_failure(&mut events, &bad.url()).await;

    // The good lookup's producer still joined the set.
    let sub = nsqd.next_command_of("SUB").await;
    assert_eq!(sub.args, vec!["test", "ch"]);
    nsqd.next_command_of("RDY").await;

    mock_message_round_trip(&mut nsqd, &mut subscriber).await;
    subscriber.close().await.unwrap();
}

#[tokio::test]
async fn test_truncated_lookup_json_never_aborts_the_poll() {
    init_tracing();
    let mut nsqd = MockNsqd::start(MockBehavior::default()).await;

    let good = MockLookupd::start().await;
    good.set_producers(vec![("127.0.0.1".into(), nsqd.port())]);
    let bad = MockLookupd::start().await;
    bad.set_mode(LookupMode::BadJson);

    let mut subscriber = lookup_subscriber(vec![bad.url(), good.url()], 60_000);
    let mut events = subscriber.events();
    subscriber.connect().await.unwrap();

    await_lookup_failure(&mut events, &bad.url()).await;
    nsqd.next_command_of("SUB").await;

    subscriber.close().await.unwrap();
}

async fn mock_message_round_trip(nsqd: &mut MockNsqd, subscriber: &mut Subscriber) {
    nsqd.send_message(TEST_ID, 1, b"discovered");
    let message = within(subscriber.recv()).await.unwrap();
    assert_eq!(message.body().as_ref(), b"discovered");
    message.finish().await.unwrap();
}

#[tokio::test]
async fn test_rdy_rotates_between_producers_at_concurrency_one() {
    init_tracing();
    let mut nsqd_a = MockNsqd::start(MockBehavior::default()).await;
    let mut nsqd_b = MockNsqd::start(MockBehavior::default()).await;

    let lookupd = MockLookupd::start().await;
    lookupd.set_producers(vec![
        ("127.0.0.1".into(), nsqd_a.port()),
        ("127.0.0.1".into(), nsqd_b.port()),
    ]);

    let mut subscriber = lookup_subscriber(vec![lookupd.url()], 150);
    subscriber.connect().await.unwrap();

    // Both producers join the set.
    nsqd_a.next_command_of("SUB").await;
    nsqd_b.next_command_of("SUB").await;

    // With a budget of one, successive polls hand the single credit back
    // and forth. From either producer's perspective the RDY sequence is
    // 1, 0, 1, 0, ...: its first RDY is always a grant, its second always
    // a revoke.
    let first_a = nsqd_a.next_command_of("RDY").await;
    assert_eq!(first_a.args, vec!["1"]);
    let first_b = nsqd_b.next_command_of("RDY").await;
    assert_eq!(first_b.args, vec!["1"]);

    let second_a = nsqd_a.next_command_of("RDY").await;
    assert_eq!(second_a.args, vec!["0"]);

    subscriber.close().await.unwrap();
}

#[tokio::test]
async fn test_removed_producer_is_closed() {
    init_tracing();
    let mut nsqd_a = MockNsqd::start(MockBehavior::default()).await;
    let nsqd_b = MockNsqd::start(MockBehavior::default()).await;

    let lookupd = MockLookupd::start().await;
    lookupd.set_producers(vec![
        ("127.0.0.1".into(), nsqd_a.port()),
        ("127.0.0.1".into(), nsqd_b.port()),
    ]);

    let mut subscriber = lookup_subscriber(vec![lookupd.url()], 150);
    let mut events = subscriber.events();
    subscriber.connect().await.unwrap();
    nsqd_a.next_command_of("SUB").await;

    // Producer A disappears from the next poll.
    lookupd.set_producers(vec![("127.0.0.1".into(), nsqd_b.port())]);
    let removed_address = format!("127.0.0.1:{}", nsqd_a.port());
    within(async {
        loop {
            match events.recv().await.expect("event stream ended") {
                SubscriberEvent::ProducerRemoved { address } if address == removed_address => {
                    return;
                }
                _ => continue,
            }
        }
    })
    .await;

    // Its connection runs the close protocol.
    nsqd_a.next_command_of("CLS").await;
    subscriber.close().await.unwrap();
}
