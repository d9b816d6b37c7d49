use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Value, json};

use super::*;
use crate::broker::MemoryBroker;
use crate::connection::ConnectionConfig;
use crate::topology::QueueSpec;
use crate::transport::{BrokerChannel, ConsumeOptions, Connector, PublishProperties, RawDelivery};
use crate::utils::EventError;
use futures::StreamExt;

fn sample_event() -> BaseEvent {
    BaseEvent::new(
        "payment.created",
        json!({ "amount": 42, "currency": "EUR" }),
        EventMetadata::new("payments").with_user("u-1"),
    )
}

#[test]
fn test_wire_format_is_camel_case() {
    let event = sample_event();
    let wire: Value = serde_json::from_slice(&event.to_bytes().unwrap()).unwrap();

    assert_eq!(wire["eventId"], json!(event.event_id));
    assert_eq!(wire["eventType"], json!("payment.created"));
    assert_eq!(wire["timestamp"], json!(event.timestamp));
    assert_eq!(wire["data"]["amount"], json!(42));
    assert_eq!(wire["metadata"]["service"], json!("payments"));
    assert_eq!(wire["metadata"]["userId"], json!("u-1"));
    assert!(wire.get("event_id").is_none());
}

#[test]
fn test_user_id_omitted_when_absent() {
    let event = BaseEvent::new("order.placed", json!({}), EventMetadata::new("orders"));
    let wire: Value = serde_json::to_value(&event).unwrap();

    assert!(wire["metadata"].get("userId").is_none());
}

#[test]
fn test_extension_fields_are_flattened() {
    let metadata = EventMetadata::new("orders").with_extra("traceId", "t-9");
    let event = BaseEvent::new("order.placed", json!(null), metadata);
    let wire: Value = serde_json::to_value(&event).unwrap();
    assert_eq!(wire["metadata"]["traceId"], json!("t-9"));

    let decoded = BaseEvent::from_slice(&event.to_bytes().unwrap()).unwrap();
    assert_eq!(decoded.metadata.extra.get("traceId"), Some(&json!("t-9")));
    assert_eq!(decoded, event);
}

#[test]
fn test_routing_key_is_event_type() {
    let event = sample_event();
    assert_eq!(event.routing_key(), "payment.created");
}

#[test]
fn test_event_ids_are_unique() {
    let a = sample_event();
    let b = sample_event();
    assert_ne!(a.event_id, b.event_id);
    assert!(uuid::Uuid::parse_str(&a.event_id).is_ok());
}

#[test]
fn test_from_slice_rejects_malformed_bodies() {
    let cases: [&[u8]; 4] = [
        b"not json",
        br#"{"eventType":"a.b","timestamp":1,"data":{},"metadata":{"service":"s"}}"#,
        br#"{"eventId":"","eventType":"a.b","timestamp":1,"data":{},"metadata":{"service":"s"}}"#,
        br#"{"eventId":"x","eventType":" ","timestamp":1,"data":{},"metadata":{"service":"s"}}"#,
    ];
    for body in cases {
        assert!(
            matches!(BaseEvent::from_slice(body), Err(EventError::Deserialization(_))),
            "accepted {}",
            String::from_utf8_lossy(body)
        );
    }
}

#[test]
fn test_from_slice_accepts_other_producers() {
    let body = br#"{
        "eventId": "e-1",
        "eventType": "user.registered",
        "timestamp": 1700000000000,
        "data": {"email": "a@b.c"},
        "metadata": {"service": "accounts"}
    }"#;
    let event = BaseEvent::from_slice(body).unwrap();
    assert_eq!(event.event_id, "e-1");
    assert_eq!(event.metadata.user_id, None);
    assert!(event.metadata.extra.is_empty());
}

#[test]
fn test_data_as_typed_payload() {
    #[derive(Debug, Deserialize, PartialEq)]
    struct Payment {
        amount: u32,
        currency: String,
    }

    let event = sample_event();
    let payment: Payment = event.data_as().unwrap();
    assert_eq!(
        payment,
        Payment {
            amount: 42,
            currency: "EUR".into()
        }
    );

    let wrong: crate::utils::Result<Vec<String>> = event.data_as();
    assert!(matches!(wrong, Err(EventError::Deserialization(_))));
}

async fn delivered(broker: &MemoryBroker) -> (Arc<dyn BrokerChannel>, RawDelivery) {
    let connection = broker
        .connector()
        .connect(&ConnectionConfig::default())
        .await
        .unwrap();
    let channel = connection.open_channel().await.unwrap();
    channel
        .declare_queue(&QueueSpec::durable("ctx"))
        .await
        .unwrap();
    let mut stream = channel
        .consume(
            "ctx",
            ConsumeOptions {
                consumer_tag: "t".into(),
                no_ack: false,
            },
        )
        .await
        .unwrap();
    channel
        .publish("", "ctx", b"{}".to_vec(), PublishProperties::default())
        .await
        .unwrap()
        .await
        .unwrap();
    let delivery = stream.next().await.unwrap().unwrap();
    (channel, delivery)
}

#[tokio::test]
async fn test_second_ack_is_a_noop() {
    let broker = MemoryBroker::new();
    let (channel, delivery) = delivered(&broker).await;
    let ctx = EventContext::new(channel, &delivery, true);

    assert_eq!(ctx.settlement(), None);
    ctx.ack().await.unwrap();
    // would fail with an unknown delivery tag if it reached the broker
    ctx.ack().await.unwrap();
    ctx.nack(false).await.unwrap();

    assert_eq!(ctx.settlement(), Some(Settlement::Acked));
    assert_eq!(broker.unacked_count("ctx"), 0);
    assert_eq!(broker.queue_depth("ctx"), Some(0));
}

#[tokio::test]
async fn test_clones_share_settlement() {
    let broker = MemoryBroker::new();
    let (channel, delivery) = delivered(&broker).await;
    let ctx = EventContext::new(channel, &delivery, true);
    let clone = ctx.clone();

    clone.nack(true).await.unwrap();
    ctx.ack().await.unwrap();

    assert_eq!(ctx.settlement(), Some(Settlement::Nacked { requeue: true }));
    assert!(ctx.is_settled());
}

#[tokio::test]
async fn test_auto_ack_context_ignores_settlement() {
    let broker = MemoryBroker::new();
    let (channel, delivery) = delivered(&broker).await;
    let ctx = EventContext::new(channel, &delivery, false);

    assert_eq!(ctx.settlement(), Some(Settlement::AutoAcked));
    ctx.ack().await.unwrap();
    ctx.nack(false).await.unwrap();
    assert_eq!(ctx.settlement(), Some(Settlement::AutoAcked));
    // the broker still holds the manual-ack delivery untouched
    assert_eq!(broker.unacked_count("ctx"), 1);
}

#[tokio::test]
async fn test_context_exposes_delivery_metadata() {
    let broker = MemoryBroker::new();
    let (channel, delivery) = delivered(&broker).await;
    let ctx = EventContext::new(channel, &delivery, true);

    assert_eq!(ctx.delivery_tag(), delivery.delivery_tag);
    assert_eq!(ctx.routing_key(), "ctx");
    assert!(!ctx.redelivered());
}
