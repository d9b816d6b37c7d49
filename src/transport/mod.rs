//! The `transport` module is the seam between the messaging core and a
//! concrete broker.
//!
//! The core only talks to three traits:
//!
//! - [`Connector`] opens a [`BrokerConnection`] from a [`ConnectionConfig`].
//! - [`BrokerConnection`] multiplexes [`BrokerChannel`]s and reports when it
//!   dies.
//! - [`BrokerChannel`] declares topology, publishes with confirms and
//!   consumes with manual acknowledgement.
//!
//! Two implementations ship with the crate: [`amqp`] drives a real AMQP 0-9-1
//! broker through `lapin`, [`memory`] drives the in-process
//! [`MemoryBroker`](crate::broker::MemoryBroker).

pub mod amqp;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::connection::ConnectionConfig;
use crate::topology::{BindingSpec, Declaration, ExchangeSpec, QueueSpec};
use crate::utils::TransportError;

pub use amqp::AmqpConnector;
pub use memory::MemoryConnector;

/// Broker answer to a confirmed publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirm {
    Ack,
    Nack(String),
    /// The channel is not in confirm mode.
    NotRequested,
}

pub type ConfirmFuture = BoxFuture<'static, Result<Confirm, TransportError>>;
pub type DeliveryStream = BoxStream<'static, Result<RawDelivery, TransportError>>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishProperties {
    pub message_id: Option<String>,
    pub content_type: Option<String>,
    /// Delivery mode 2: written to disk by the broker on durable queues.
    pub persistent: bool,
    /// Seconds since the UNIX epoch.
    pub timestamp: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDelivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub message_id: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeOptions {
    pub consumer_tag: String,
    pub no_ack: bool,
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(
        &self,
        config: &ConnectionConfig,
    ) -> Result<Arc<dyn BrokerConnection>, TransportError>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, TransportError>;

    fn is_open(&self) -> bool;

    /// Resolves once the connection is gone, whether it failed or was closed.
    async fn closed(&self);

    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), TransportError>;

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), TransportError>;

    async fn bind_queue(&self, spec: &BindingSpec) -> Result<(), TransportError>;

    /// Puts the channel in publisher-confirm mode.
    async fn confirm_select(&self) -> Result<(), TransportError>;

    async fn qos(&self, prefetch: u16) -> Result<(), TransportError>;

    /// Sends the message and returns a future for the broker confirm. The
    /// message is on the wire, in call order, once this returns.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: PublishProperties,
    ) -> Result<ConfirmFuture, TransportError>;

    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, TransportError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Applies one declaration on a channel.
pub async fn declare(
    channel: &dyn BrokerChannel,
    declaration: &Declaration,
) -> Result<(), TransportError> {
    match declaration {
        Declaration::Exchange(spec) => channel.declare_exchange(spec).await,
        Declaration::Queue(spec) => channel.declare_queue(spec).await,
        Declaration::Binding(spec) => channel.bind_queue(spec).await,
    }
}

#[cfg(test)]
mod tests;
