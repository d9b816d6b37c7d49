use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::json;

use super::*;
use crate::broker::MemoryBroker;
use crate::connection::ConnectionManager;
use crate::tests::support::{ConfirmScript, ScriptedConnector, connected, fast_config};
use crate::topology::{BindingSpec, QueueSpec};
use crate::transport::{ConsumeOptions, DeliveryStream};

/// Declares `queue` bound to `events` with `pattern` and starts consuming it
/// on a channel outside the publisher.
async fn tap(manager: &ConnectionManager, queue: &str, pattern: &str) -> DeliveryStream {
    let channel = manager.get_channel().await.unwrap();
    channel
        .declare_exchange(&ExchangeSpec::default())
        .await
        .unwrap();
    channel
        .declare_queue(&QueueSpec::durable(queue))
        .await
        .unwrap();
    channel
        .bind_queue(&BindingSpec::new(queue, DEFAULT_EXCHANGE, pattern))
        .await
        .unwrap();
    channel
        .consume(
            queue,
            ConsumeOptions {
                consumer_tag: format!("tap-{queue}"),
                no_ack: true,
            },
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn test_publish_before_initialize_fails() {
    let broker = MemoryBroker::new();
    let manager = connected(&broker).await;
    let publisher = Publisher::new(manager, PublisherConfig::new("orders"));

    let result = publisher.publish("order.placed", json!({}), None).await;
    assert!(matches!(result, Err(EventError::NotInitialized(_))));
}

#[tokio::test]
async fn test_initialize_declares_exchange_and_registers_it() {
    let broker = MemoryBroker::new();
    let manager = connected(&broker).await;
    let publisher = Publisher::new(Arc::clone(&manager), PublisherConfig::new("orders"));

    publisher.initialize().await.unwrap();

    assert!(broker.has_exchange(DEFAULT_EXCHANGE));
    assert_eq!(
        manager.topology(),
        vec![Declaration::Exchange(ExchangeSpec::topic(DEFAULT_EXCHANGE))]
    );
}

#[tokio::test]
async fn test_publish_delivers_envelope() {
    let broker = MemoryBroker::new();
    let manager = connected(&broker).await;
    let mut deliveries = tap(&manager, "audit", "payment.#").await;
    let publisher = Publisher::new(Arc::clone(&manager), PublisherConfig::new("payments"));
    publisher.initialize().await.unwrap();

    let event = publisher
        .publish("payment.created", json!({ "amount": 10 }), None)
        .await
        .unwrap();

    let delivery = deliveries.next().await.unwrap().unwrap();
    assert_eq!(delivery.routing_key, "payment.created");
    assert_eq!(delivery.message_id.as_deref(), Some(event.event_id.as_str()));

    let received = BaseEvent::from_slice(&delivery.body).unwrap();
    assert_eq!(received, event);
    assert_eq!(received.event_type, "payment.created");
    assert_eq!(received.metadata.service, "payments");
}

#[tokio::test]
async fn test_publish_keeps_explicit_metadata() {
    let broker = MemoryBroker::new();
    let manager = connected(&broker).await;
    let mut deliveries = tap(&manager, "audit", "#").await;
    let publisher = Publisher::new(Arc::clone(&manager), PublisherConfig::new("payments"));
    publisher.initialize().await.unwrap();

    let metadata = EventMetadata::new("billing").with_user("u-7");
    publisher
        .publish("invoice.sent", json!(null), Some(metadata.clone()))
        .await
        .unwrap();

    let delivery = deliveries.next().await.unwrap().unwrap();
    let received = BaseEvent::from_slice(&delivery.body).unwrap();
    assert_eq!(received.metadata, metadata);
}

#[tokio::test]
async fn test_sequential_publishes_arrive_in_order() {
    let broker = MemoryBroker::new();
    let manager = connected(&broker).await;
    let mut deliveries = tap(&manager, "ordered", "seq.#").await;
    let publisher = Publisher::new(Arc::clone(&manager), PublisherConfig::new("seq"));
    publisher.initialize().await.unwrap();

    let mut sent = Vec::new();
    for n in 0..20 {
        let event = publisher
            .publish("seq.tick", json!({ "n": n }), None)
            .await
            .unwrap();
        sent.push(event.event_id);
    }

    let mut received = Vec::new();
    for _ in 0..20 {
        let delivery = deliveries.next().await.unwrap().unwrap();
        received.push(BaseEvent::from_slice(&delivery.body).unwrap().event_id);
    }
    assert_eq!(received, sent);
}

#[tokio::test]
async fn test_broker_nack_is_publish_error() {
    let broker = MemoryBroker::new();
    let connector = ScriptedConnector::new(&broker);
    let manager = ConnectionManager::new(fast_config(), connector.clone());
    manager.connect().await.unwrap();
    let publisher = Publisher::new(manager, PublisherConfig::new("orders"));
    publisher.initialize().await.unwrap();

    connector.set(ConfirmScript::Nack("queue full".into()));
    let event = BaseEvent::new("order.placed", json!({}), EventMetadata::new("orders"));
    let err = publisher.publish_event(&event).await.unwrap_err();

    match err {
        EventError::Publish { event_id, reason } => {
            assert_eq!(event_id, event.event_id);
            assert_eq!(reason, "queue full");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_channel_closed_before_confirm_is_publish_error() {
    let broker = MemoryBroker::new();
    let connector = ScriptedConnector::new(&broker);
    let manager = ConnectionManager::new(fast_config(), connector.clone());
    manager.connect().await.unwrap();
    let publisher = Publisher::new(Arc::clone(&manager), PublisherConfig::new("orders"));
    publisher.initialize().await.unwrap();

    connector.set(ConfirmScript::ChannelClosed);
    let event = BaseEvent::new("order.placed", json!({}), EventMetadata::new("orders"));
    let err = publisher.publish_event(&event).await.unwrap_err();

    match err {
        EventError::Publish { event_id, reason } => {
            assert_eq!(event_id, event.event_id);
            assert!(reason.contains("channel closed"), "{reason}");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(manager.health_check());
}

#[tokio::test(start_paused = true)]
async fn test_missing_confirm_times_out() {
    let broker = MemoryBroker::new();
    let connector = ScriptedConnector::new(&broker);
    let manager = ConnectionManager::new(fast_config(), connector.clone());
    manager.connect().await.unwrap();
    let config = PublisherConfig {
        confirm_timeout: Duration::from_millis(250),
        ..PublisherConfig::new("orders")
    };
    let publisher = Publisher::new(manager, config);
    publisher.initialize().await.unwrap();

    connector.set(ConfirmScript::Hang);
    let started = tokio::time::Instant::now();
    let err = publisher
        .publish("order.placed", json!({}), None)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        EventError::PublishTimeout { timeout, .. } if timeout == Duration::from_millis(250)
    ));
    assert_eq!(started.elapsed(), Duration::from_millis(250));
}

#[tokio::test]
async fn test_close_rejects_pending_confirm() {
    let broker = MemoryBroker::new();
    let connector = ScriptedConnector::new(&broker);
    let manager = ConnectionManager::new(fast_config(), connector.clone());
    manager.connect().await.unwrap();
    let config = PublisherConfig {
        confirm_timeout: Duration::from_secs(3600),
        ..PublisherConfig::new("orders")
    };
    let publisher = Arc::new(Publisher::new(Arc::clone(&manager), config));
    publisher.initialize().await.unwrap();

    connector.set(ConfirmScript::Hang);
    let pending = {
        let publisher = Arc::clone(&publisher);
        tokio::spawn(async move { publisher.publish("order.placed", json!({}), None).await })
    };
    tokio::task::yield_now().await;
    manager.close().await.unwrap();

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(EventError::ConnectionClosed)));
}

#[tokio::test]
async fn test_publish_after_close_fails() {
    let broker = MemoryBroker::new();
    let manager = connected(&broker).await;
    let publisher = Publisher::new(Arc::clone(&manager), PublisherConfig::new("orders"));
    publisher.initialize().await.unwrap();

    manager.close().await.unwrap();

    let result = publisher.publish("order.placed", json!({}), None).await;
    assert!(matches!(result, Err(EventError::ConnectionClosed)));
}

#[tokio::test(start_paused = true)]
async fn test_publish_reacquires_channel_after_reconnect() {
    let broker = MemoryBroker::new();
    let manager = connected(&broker).await;
    let publisher = Publisher::new(Arc::clone(&manager), PublisherConfig::new("orders"));
    publisher.initialize().await.unwrap();
    publisher
        .publish("order.placed", json!({ "n": 1 }), None)
        .await
        .unwrap();

    broker.drop_connections();

    publisher
        .publish("order.placed", json!({ "n": 2 }), None)
        .await
        .unwrap();
    assert_eq!(manager.generation(), 2);
}
