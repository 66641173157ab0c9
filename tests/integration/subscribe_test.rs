// tests/integration/subscribe_test.rs

//! Subscriber scenarios in direct (single nsqd) mode.

use super::mock_nsqd::{MockBehavior, MockNsqd};
use super::test_helpers::{TEST_ID, init_tracing, test_connection_config, within};
use nsq_client::{Subscriber, SubscriberConfig};
use serde_json::json;
use std::time::Duration;

fn subscriber_for(mock: &MockNsqd, topic: &str, channel: &str) -> Subscriber {
    let mut config = SubscriberConfig::new(topic, channel);
    config.nsqd = Some(mock.nsqd_address());
    config.concurrency = 1;
    config.connection = test_connection_config();
    Subscriber::new(config).unwrap()
}

#[tokio::test]
async fn test_subscribe_receive_finish() {
    init_tracing();
    let mut mock = MockNsqd::start(MockBehavior::default()).await;
    let mut subscriber = subscriber_for(&mock, "test", "ch");
    subscriber.connect().await.unwrap();

    mock.next_command_of("IDENTIFY").await;
    let sub = mock.next_command_of("SUB").await;
    assert_eq!(sub.args, vec!["test", "ch"]);
    let rdy = mock.next_command_of("RDY").await;
    assert_eq!(rdy.args, vec!["1"]);

    mock.send_message(TEST_ID, 1, br#"{"some":"object"}"#);
    let message = within(subscriber.recv()).await.unwrap();
    assert_eq!(message.attempts(), 1);
    assert_eq!(message.id().to_string(), "0123456789abcdef");
    assert_eq!(message.json(), Some(json!({"some": "object"})));
    assert_eq!(message.body().as_ref(), br#"{"some":"object"}"#);

    message.finish().await.unwrap();
    let fin = mock.next_command_of("FIN").await;
    assert_eq!(fin.args, vec!["0123456789abcdef"]);

    subscriber.close().await.unwrap();
    mock.next_command_of("CLS").await;
}

#[tokio::test]
async fn test_non_json_body_comes_back_raw() {
    init_tracing();
    let mut mock = MockNsqd::start(MockBehavior::default()).await;
    let mut subscriber = subscriber_for(&mock, "raw", "ch");
    subscriber.connect().await.unwrap();
    mock.next_command_of("RDY").await;

    mock.send_message(TEST_ID, 1, b"\x00\x01not json");
    let message = within(subscriber.recv()).await.unwrap();
    assert_eq!(message.json(), None);
    assert_eq!(message.body().as_ref(), b"\x00\x01not json");

    message.finish().await.unwrap();
    subscriber.close().await.unwrap();
}

#[tokio::test]
async fn test_heartbeat_is_answered_with_nop() {
    init_tracing();
    let mut mock = MockNsqd::start(MockBehavior::default()).await;
    let mut subscriber = subscriber_for(&mock, "hb", "ch");
    subscriber.connect().await.unwrap();
    mock.next_command_of("RDY").await;

    mock.send_heartbeat();
    mock.next_command_of("NOP").await;

    subscriber.close().await.unwrap();
}

#[tokio::test]
async fn test_requeue_with_delay() {
    init_tracing();
    let mut mock = MockNsqd::start(MockBehavior::default()).await;
    let mut subscriber = subscriber_for(&mock, "rq", "ch");
    subscriber.connect().await.unwrap();
    mock.next_command_of("RDY").await;

    mock.send_message(TEST_ID, 2, b"again");
    let message = within(subscriber.recv()).await.unwrap();
    assert_eq!(message.attempts(), 2);
    message
        .requeue(Some(Duration::from_millis(200)))
        .await
        .unwrap();

    let req = mock.next_command_of("REQ").await;
    assert_eq!(req.args, vec!["0123456789abcdef", "200"]);

    subscriber.close().await.unwrap();
}

#[tokio::test]
async fn test_touch_strictly_extends_the_expiry() {
    init_tracing();
    let mut mock = MockNsqd::start(MockBehavior::default()).await;
    let mut subscriber = subscriber_for(&mock, "touch", "ch");
    subscriber.connect().await.unwrap();
    mock.next_command_of("RDY").await;

    mock.send_message(TEST_ID, 1, b"slow work");
    let message = within(subscriber.recv()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    let before = message.expires_in();
    message.touch().await.unwrap();
    let after = message.expires_in();
    assert!(after > before, "touch must extend expiry: {before:?} -> {after:?}");

    mock.next_command_of("TOUCH").await;
    message.finish().await.unwrap();
    subscriber.close().await.unwrap();
}

#[tokio::test]
async fn test_keepalive_touches_before_the_deadline() {
    init_tracing();
    let behavior = MockBehavior {
        msg_timeout_ms: 300,
        max_msg_timeout_ms: 900,
        ..MockBehavior::default()
    };
    let mut mock = MockNsqd::start(behavior).await;

    let mut config = SubscriberConfig::new("ka", "ch");
    config.nsqd = Some(mock.nsqd_address());
    config.connection = test_connection_config();
    config.keepalive_offset_ms = 150;
    let mut subscriber = Subscriber::new(config).unwrap();
    subscriber.connect().await.unwrap();
    mock.next_command_of("RDY").await;

    mock.send_message(TEST_ID, 1, b"long job");
    let message = within(subscriber.recv()).await.unwrap();
    let keepalive = message.keepalive();

    // The helper fires its first TOUCH around deadline - offset (~150ms).
    mock.next_command_of("TOUCH").await;

    message.finish().await.unwrap();
    within(keepalive).await.unwrap();
    subscriber.close().await.unwrap();
}

#[tokio::test]
async fn test_pause_revokes_ready_and_unpause_restores_it() {
    init_tracing();
    let mut mock = MockNsqd::start(MockBehavior::default()).await;
    let mut subscriber = subscriber_for(&mock, "pp", "ch");
    subscriber.connect().await.unwrap();

    let rdy = mock.next_command_of("RDY").await;
    assert_eq!(rdy.args, vec!["1"]);

    subscriber.pause().await;
    let rdy = mock.next_command_of("RDY").await;
    assert_eq!(rdy.args, vec!["0"]);

    subscriber.unpause().await;
    let rdy = mock.next_command_of("RDY").await;
    assert_eq!(rdy.args, vec!["1"]);

    subscriber.close().await.unwrap();
}
