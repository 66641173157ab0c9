// tests/integration/close_test.rs

//! Graceful close: inflight drain bounds and abortive teardown.

use super::mock_nsqd::{MockBehavior, MockNsqd};
use super::test_helpers::{TEST_ID, init_tracing, test_connection_config, within};
use nsq_client::{Subscriber, SubscriberConfig};
use std::time::{Duration, Instant};

fn short_timeout_behavior() -> MockBehavior {
    MockBehavior {
        msg_timeout_ms: 300,
        ..MockBehavior::default()
    }
}

fn subscriber_for(mock: &MockNsqd) -> Subscriber {
    let mut config = SubscriberConfig::new("t", "ch");
    config.nsqd = Some(mock.nsqd_address());
    config.connection = test_connection_config();
    Subscriber::new(config).unwrap()
}

#[tokio::test]
async fn test_close_waits_for_unfinished_inflight() {
    init_tracing();
    let mut mock = MockNsqd::start(short_timeout_behavior()).await;
    let mut subscriber = subscriber_for(&mock);
    subscriber.connect().await.unwrap();
    mock.next_command_of("RDY").await;

    mock.send_message(TEST_ID, 1, b"never finished");
    let _message = within(subscriber.recv()).await.unwrap();

    // The message is never FINed, so close must ride out msg_timeout.
    let started = Instant::now();
    subscriber.close().await.unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_millis(250), "close returned after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "close took {elapsed:?}");
}

#[tokio::test]
async fn test_close_is_prompt_once_inflight_is_clear() {
    init_tracing();
    let mut mock = MockNsqd::start(short_timeout_behavior()).await;
    let mut subscriber = subscriber_for(&mock);
    subscriber.connect().await.unwrap();
    mock.next_command_of("RDY").await;

    mock.send_message(TEST_ID, 1, b"handled");
    let message = within(subscriber.recv()).await.unwrap();
    message.finish().await.unwrap();
    mock.next_command_of("FIN").await;

    let started = Instant::now();
    subscriber.close().await.unwrap();
    assert!(
        started.elapsed() < Duration::from_millis(250),
        "clean close took {:?}",
        started.elapsed()
    );
}

#[tokio::test]
async fn test_unref_makes_close_abortive() {
    init_tracing();
    let mut mock = MockNsqd::start(short_timeout_behavior()).await;
    let mut subscriber = subscriber_for(&mock);
    subscriber.connect().await.unwrap();
    mock.next_command_of("RDY").await;

    mock.send_message(TEST_ID, 1, b"abandoned");
    let _message = within(subscriber.recv()).await.unwrap();

    subscriber.unref().await;
    let started = Instant::now();
    subscriber.close().await.unwrap();
    assert!(
        started.elapsed() < Duration::from_millis(250),
        "abortive close took {:?}",
        started.elapsed()
    );
}
