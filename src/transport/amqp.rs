//! Transport over a real AMQP 0-9-1 broker (RabbitMQ) using `lapin`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::watch;
use tracing::{debug, warn};

use super::{
    BrokerChannel, BrokerConnection, Confirm, ConfirmFuture, ConsumeOptions, Connector,
    DeliveryStream, PublishProperties, RawDelivery,
};
use crate::connection::ConnectionConfig;
use crate::topology::{BindingSpec, ExchangeKind, ExchangeSpec, QueueSpec};
use crate::utils::TransportError;

const REPLY_SUCCESS: u16 = 200;

#[derive(Debug, Clone, Copy, Default)]
pub struct AmqpConnector;

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(
        &self,
        config: &ConnectionConfig,
    ) -> Result<Arc<dyn BrokerConnection>, TransportError> {
        let uri = with_heartbeat(&config.url, config.heartbeat);
        let properties = ConnectionProperties::default()
            .with_connection_name(config.connection_name.clone().into());

        let connection = Connection::connect(&uri, properties).await?;

        let lost = Arc::new(watch::channel(false).0);
        let on_error = Arc::clone(&lost);
        connection.on_error(move |err| {
            warn!(error = %err, "amqp connection error");
            on_error.send_replace(true);
        });
        debug!(name = %config.connection_name, "amqp connection established");

        Ok(Arc::new(AmqpConnection { connection, lost }))
    }
}

/// A channel that closes under an in-flight publish fails its confirm with the
/// channel state, or with the broker's close reason (e.g. `NOT_FOUND` for a
/// missing exchange), which is kept.
pub(crate) fn confirm_error(err: lapin::Error) -> TransportError {
    match err {
        lapin::Error::InvalidChannel(_) | lapin::Error::InvalidChannelState(_) => {
            debug!(error = %err, "channel closed with a confirm pending");
            TransportError::ChannelClosed
        }
        lapin::Error::InvalidConnectionState(_) | lapin::Error::IOError(_) => {
            TransportError::ConnectionClosed
        }
        other => TransportError::Amqp(other),
    }
}

/// Adds `heartbeat=<secs>` to the URI query unless it is already there.
pub(crate) fn with_heartbeat(url: &str, heartbeat: Duration) -> String {
    let secs = heartbeat.as_secs();
    if secs == 0 || url.contains("heartbeat=") {
        return url.to_string();
    }
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}heartbeat={secs}")
}

pub struct AmqpConnection {
    connection: Connection,
    lost: Arc<watch::Sender<bool>>,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, TransportError> {
        let channel = self.connection.create_channel().await?;
        Ok(Arc::new(AmqpChannel { channel }))
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected() && !*self.lost.borrow()
    }

    async fn closed(&self) {
        let mut lost = self.lost.subscribe();
        let _ = lost.wait_for(|l| *l).await;
    }

    async fn close(&self) -> Result<(), TransportError> {
        let result = if self.connection.status().connected() {
            self.connection.close(REPLY_SUCCESS, "closing").await
        } else {
            Ok(())
        };
        self.lost.send_replace(true);
        Ok(result?)
    }
}

pub struct AmqpChannel {
    channel: Channel,
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        }
    }
}

fn queue_arguments(spec: &QueueSpec) -> FieldTable {
    let mut arguments = FieldTable::default();
    if let Some(dlx) = &spec.dead_letter_exchange {
        arguments.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(dlx.clone().into()),
        );
    }
    if let Some(key) = &spec.dead_letter_routing_key {
        arguments.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(key.clone().into()),
        );
    }
    arguments
}

fn basic_properties(properties: PublishProperties) -> BasicProperties {
    let mut basic = BasicProperties::default().with_delivery_mode(if properties.persistent {
        2
    } else {
        1
    });
    if let Some(id) = properties.message_id {
        basic = basic.with_message_id(id.into());
    }
    if let Some(content_type) = properties.content_type {
        basic = basic.with_content_type(content_type.into());
    }
    if let Some(timestamp) = properties.timestamp {
        basic = basic.with_timestamp(timestamp);
    }
    basic
}

fn raw_delivery(delivery: lapin::message::Delivery) -> RawDelivery {
    RawDelivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        redelivered: delivery.redelivered,
        message_id: delivery
            .properties
            .message_id()
            .as_ref()
            .map(|id| id.as_str().to_string()),
        body: delivery.data,
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), TransportError> {
        self.channel
            .exchange_declare(
                &spec.name,
                spec.kind.into(),
                ExchangeDeclareOptions {
                    durable: spec.durable,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), TransportError> {
        self.channel
            .queue_declare(
                &spec.name,
                QueueDeclareOptions {
                    durable: spec.durable,
                    ..QueueDeclareOptions::default()
                },
                queue_arguments(spec),
            )
            .await?;
        Ok(())
    }

    async fn bind_queue(&self, spec: &BindingSpec) -> Result<(), TransportError> {
        self.channel
            .queue_bind(
                &spec.queue,
                &spec.exchange,
                &spec.pattern,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn confirm_select(&self) -> Result<(), TransportError> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        Ok(())
    }

    async fn qos(&self, prefetch: u16) -> Result<(), TransportError> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: PublishProperties,
    ) -> Result<ConfirmFuture, TransportError> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &body,
                basic_properties(properties),
            )
            .await?;

        Ok(async move {
            match confirm.await.map_err(confirm_error)? {
                Confirmation::Ack(_) => Ok(Confirm::Ack),
                Confirmation::Nack(_) => Ok(Confirm::Nack("broker nacked the publish".into())),
                Confirmation::NotRequested => Ok(Confirm::NotRequested),
            }
        }
        .boxed())
    }

    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, TransportError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                &options.consumer_tag,
                BasicConsumeOptions {
                    no_ack: options.no_ack,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        Ok(consumer
            .map(|delivery| delivery.map(raw_delivery).map_err(TransportError::from))
            .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    requeue,
                    ..BasicNackOptions::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.channel.status().connected() {
            self.channel.close(REPLY_SUCCESS, "closing").await?;
        }
        Ok(())
    }
}
