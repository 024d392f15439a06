use super::*;
use crate::mqtt::MQTTMessage;
use crate::registry::SubscriptionRegistry;
use crate::testing::{mock_connection, MockBroker, RecordingNotifier};
use std::sync::Arc;

async fn fanout_with(
    subscriptions: &[(&str, &str)],
) -> (FanOut, Arc<RecordingNotifier>, Arc<SubscriptionRegistry>) {
    let broker = MockBroker::new();
    let (connection, _events) = mock_connection(&broker);
    connection.connect("mqtt://broker", None).await.unwrap();

    let registry = Arc::new(SubscriptionRegistry::new(connection));
    for (user, topic) in subscriptions {
        registry.subscribe(user, topic).await.unwrap();
    }
    let notifier = RecordingNotifier::new();
    let fanout = FanOut::new(registry.clone(), notifier.clone());
    (fanout, notifier, registry)
}

#[tokio::test]
async fn message_reaches_every_subscriber_once() {
    let (fanout, notifier, _registry) = fanout_with(&[("alice", "x"), ("bob", "x")]).await;

    let report = fanout
        .deliver(&MQTTMessage::from_topic("x", b"hello".to_vec()))
        .await;

    assert_eq!(
        report,
        DeliveryReport {
            delivered: 2,
            failed: 0
        }
    );
    assert_eq!(notifier.sent_to("alice"), vec!["[x]: hello"]);
    assert_eq!(notifier.sent_to("bob"), vec!["[x]: hello"]);
}

#[tokio::test]
async fn message_without_subscribers_is_discarded() {
    let (fanout, notifier, _registry) = fanout_with(&[("alice", "x"), ("bob", "x")]).await;

    let report = fanout
        .deliver(&MQTTMessage::from_topic("y", b"hello".to_vec()))
        .await;

    assert_eq!(report, DeliveryReport::default());
    assert!(notifier.sent().is_empty());
}

#[tokio::test]
async fn failing_recipient_does_not_block_others() {
    let (fanout, notifier, registry) =
        fanout_with(&[("alice", "x"), ("bob", "x"), ("carol", "x")]).await;
    notifier.make_unreachable("bob");

    let report = fanout
        .deliver(&MQTTMessage::from_topic("x", b"24C".to_vec()))
        .await;

    assert_eq!(report.delivered, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(notifier.sent_to("alice").len(), 1);
    assert_eq!(notifier.sent_to("carol").len(), 1);
    assert!(notifier.sent_to("bob").is_empty());
    // Delivery failures never touch the registry
    assert_eq!(registry.subscribers_of("x").await.len(), 3);
}

#[tokio::test]
async fn subscribers_of_other_topics_are_not_notified() {
    let (fanout, notifier, _registry) =
        fanout_with(&[("alice", "sensors/1"), ("bob", "sensors/2")]).await;

    fanout
        .deliver(&MQTTMessage::from_topic("sensors/1", b"24C".to_vec()))
        .await;

    assert_eq!(notifier.sent(), vec![("alice".to_string(), "[sensors/1]: 24C".to_string())]);
}

#[tokio::test]
async fn wildcard_filters_receive_matching_messages() {
    let (fanout, notifier, _registry) = fanout_with(&[
        ("alice", "sensors/+"),
        ("bob", "sensors/#"),
        ("carol", "sensors/+/temp"),
        ("dave", "sensors/1"),
    ])
    .await;

    let report = fanout
        .deliver(&MQTTMessage::from_topic("sensors/1", b"24C".to_vec()))
        .await;

    assert_eq!(report.delivered, 3);
    assert_eq!(notifier.sent_to("alice"), vec!["[sensors/1]: 24C"]);
    assert_eq!(notifier.sent_to("bob"), vec!["[sensors/1]: 24C"]);
    assert_eq!(notifier.sent_to("dave"), vec!["[sensors/1]: 24C"]);
    assert!(notifier.sent_to("carol").is_empty());
}

#[tokio::test]
async fn overlapping_filters_notify_once() {
    let (fanout, notifier, _registry) =
        fanout_with(&[("alice", "a/+"), ("alice", "a/#"), ("alice", "a/b")]).await;

    let report = fanout
        .deliver(&MQTTMessage::from_topic("a/b", b"x".to_vec()))
        .await;

    assert_eq!(report.delivered, 1);
    assert_eq!(notifier.sent_to("alice"), vec!["[a/b]: x"]);
}
