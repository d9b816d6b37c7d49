use std::time::Duration;

use futures::StreamExt;

use super::amqp::{confirm_error, with_heartbeat};
use super::*;
use crate::broker::MemoryBroker;
use crate::topology::{BindingSpec, ExchangeSpec, QueueSpec};

async fn open(broker: &MemoryBroker) -> (Arc<dyn BrokerConnection>, Arc<dyn BrokerChannel>) {
    let connection = broker
        .connector()
        .connect(&ConnectionConfig::default())
        .await
        .unwrap();
    let channel = connection.open_channel().await.unwrap();
    (connection, channel)
}

fn consume_options(tag: &str) -> ConsumeOptions {
    ConsumeOptions {
        consumer_tag: tag.to_string(),
        no_ack: false,
    }
}

#[tokio::test]
async fn test_memory_publish_confirm_and_consume() {
    let broker = MemoryBroker::new();
    let (_connection, channel) = open(&broker).await;

    channel
        .declare_exchange(&ExchangeSpec::topic("events"))
        .await
        .unwrap();
    channel
        .declare_queue(&QueueSpec::durable("orders"))
        .await
        .unwrap();
    channel
        .bind_queue(&BindingSpec::new("orders", "events", "order.*"))
        .await
        .unwrap();
    channel.confirm_select().await.unwrap();

    let mut deliveries = channel
        .consume("orders", consume_options("c1"))
        .await
        .unwrap();

    let properties = PublishProperties {
        message_id: Some("m-1".into()),
        content_type: Some("application/json".into()),
        persistent: true,
        timestamp: Some(1),
    };
    let confirm = channel
        .publish("events", "order.created", b"{}".to_vec(), properties)
        .await
        .unwrap();
    assert_eq!(confirm.await.unwrap(), Confirm::Ack);

    let delivery = deliveries.next().await.unwrap().unwrap();
    assert_eq!(delivery.routing_key, "order.created");
    assert_eq!(delivery.exchange, "events");
    assert_eq!(delivery.message_id.as_deref(), Some("m-1"));
    assert!(!delivery.redelivered);

    channel.ack(delivery.delivery_tag).await.unwrap();
    assert_eq!(broker.unacked_count("orders"), 0);
}

#[tokio::test]
async fn test_memory_publish_without_confirm_mode() {
    let broker = MemoryBroker::new();
    let (_connection, channel) = open(&broker).await;
    channel
        .declare_exchange(&ExchangeSpec::topic("events"))
        .await
        .unwrap();

    let confirm = channel
        .publish("events", "x", Vec::new(), PublishProperties::default())
        .await
        .unwrap();
    assert_eq!(confirm.await.unwrap(), Confirm::NotRequested);
}

#[tokio::test]
async fn test_memory_closed_resolves_when_broker_drops_connections() {
    let broker = MemoryBroker::new();
    let (connection, channel) = open(&broker).await;
    assert!(connection.is_open());

    broker.drop_connections();

    tokio::time::timeout(Duration::from_secs(1), connection.closed())
        .await
        .expect("closed() should resolve");
    assert!(!connection.is_open());
    assert!(!channel.is_open());
    assert!(matches!(
        channel.declare_queue(&QueueSpec::durable("q")).await,
        Err(TransportError::ChannelClosed)
    ));
}

#[tokio::test]
async fn test_memory_stream_ends_when_channel_closes() {
    let broker = MemoryBroker::new();
    let (_connection, channel) = open(&broker).await;
    channel
        .declare_queue(&QueueSpec::durable("jobs"))
        .await
        .unwrap();

    let mut deliveries = channel.consume("jobs", consume_options("c")).await.unwrap();
    channel.close().await.unwrap();

    assert!(deliveries.next().await.is_none());
    assert_eq!(broker.consumer_count("jobs"), 0);
}

#[tokio::test]
async fn test_memory_connect_fails_when_unavailable() {
    let broker = MemoryBroker::new();
    broker.set_available(false);

    let result = broker
        .connector()
        .connect(&ConnectionConfig::default())
        .await;
    assert!(matches!(result, Err(TransportError::Unreachable(_))));
}

#[tokio::test]
async fn test_declare_applies_each_declaration_kind() {
    let broker = MemoryBroker::new();
    let (_connection, channel) = open(&broker).await;

    let declarations = [
        Declaration::Exchange(ExchangeSpec::topic("events")),
        Declaration::Queue(QueueSpec::durable("audit")),
        Declaration::Binding(BindingSpec::new("audit", "events", "#")),
    ];
    for declaration in &declarations {
        declare(channel.as_ref(), declaration).await.unwrap();
    }

    assert!(broker.has_exchange("events"));
    assert!(broker.has_queue("audit"));
}

#[test]
fn test_with_heartbeat_appends_query_parameter() {
    let secs = Duration::from_secs(30);
    assert_eq!(
        with_heartbeat("amqp://localhost:5672/%2f", secs),
        "amqp://localhost:5672/%2f?heartbeat=30"
    );
    assert_eq!(
        with_heartbeat("amqp://localhost/?frame_max=8192", secs),
        "amqp://localhost/?frame_max=8192&heartbeat=30"
    );
    assert_eq!(
        with_heartbeat("amqp://localhost/?heartbeat=10", secs),
        "amqp://localhost/?heartbeat=10"
    );
    assert_eq!(
        with_heartbeat("amqp://localhost", Duration::ZERO),
        "amqp://localhost"
    );
}

#[test]
fn test_confirm_error_maps_closed_channel() {
    assert!(matches!(
        confirm_error(lapin::Error::InvalidChannel(3)),
        TransportError::ChannelClosed
    ));
    assert!(matches!(
        confirm_error(lapin::Error::ChannelsLimitReached),
        TransportError::Amqp(_)
    ));
}
