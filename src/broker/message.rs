//! Message definitions for the in-memory broker
//!
//! `Message` is what the broker keeps per queue entry. It carries the
//! publish-time exchange and routing key so a dead-lettered copy can still be
//! traced back to where it came from.
//!
//! Notes on fields:
//! - `body`: opaque bytes; the core always sends a JSON envelope
//! - `properties`: publish properties, `persistent` decides whether the
//!   message is written to the durable store on a durable queue
//! - `redelivered`: set once the message went back to the queue after being
//!   handed to a consumer

use serde::{Deserialize, Serialize};

use crate::transport::PublishProperties;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: PublishProperties,
    #[serde(default)]
    pub redelivered: bool,
}

impl Message {
    pub fn new(
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: PublishProperties,
    ) -> Self {
        Self {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body,
            properties,
            redelivered: false,
        }
    }
}

/// A message sitting in a queue. `seq` orders the queue and keys the durable
/// store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub seq: u64,
    pub message: Message,
}
