//! Transport over the in-process [`MemoryBroker`].

use std::sync::Arc;

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use tokio::sync::watch;

use super::{
    BrokerChannel, BrokerConnection, ConfirmFuture, ConsumeOptions, Connector, DeliveryStream,
    PublishProperties,
};
use crate::broker::{ChannelId, ConnectionId, MemoryBroker};
use crate::connection::ConnectionConfig;
use crate::topology::{BindingSpec, ExchangeSpec, QueueSpec};
use crate::utils::TransportError;

#[derive(Debug, Clone)]
pub struct MemoryConnector {
    broker: MemoryBroker,
}

impl MemoryConnector {
    pub fn new(broker: MemoryBroker) -> Self {
        Self { broker }
    }

    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        _config: &ConnectionConfig,
    ) -> Result<Arc<dyn BrokerConnection>, TransportError> {
        let (id, closed) = self.broker.with(|b| b.open_connection())?;
        Ok(Arc::new(MemoryConnection {
            broker: self.broker.clone(),
            id,
            closed,
        }))
    }
}

pub struct MemoryConnection {
    broker: MemoryBroker,
    id: ConnectionId,
    closed: watch::Receiver<bool>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, TransportError> {
        let id = self.broker.with(|b| b.open_channel(self.id))?;
        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            id,
        }))
    }

    fn is_open(&self) -> bool {
        !*self.closed.borrow()
    }

    async fn closed(&self) {
        let mut closed = self.closed.clone();
        // sender dropped means the broker itself is gone
        let _ = closed.wait_for(|c| *c).await;
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.broker.with(|b| b.close_connection(self.id));
        Ok(())
    }
}

pub struct MemoryChannel {
    broker: MemoryBroker,
    id: ChannelId,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), TransportError> {
        self.broker.with(|b| {
            b.channel_is_open(self.id)
                .then_some(())
                .ok_or(TransportError::ChannelClosed)?;
            b.declare_exchange(spec)
        })
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), TransportError> {
        self.broker.with(|b| {
            b.channel_is_open(self.id)
                .then_some(())
                .ok_or(TransportError::ChannelClosed)?;
            b.declare_queue(spec)
        })
    }

    async fn bind_queue(&self, spec: &BindingSpec) -> Result<(), TransportError> {
        self.broker.with(|b| {
            b.channel_is_open(self.id)
                .then_some(())
                .ok_or(TransportError::ChannelClosed)?;
            b.bind_queue(spec)
        })
    }

    async fn confirm_select(&self) -> Result<(), TransportError> {
        self.broker.with(|b| b.confirm_select(self.id))
    }

    async fn qos(&self, prefetch: u16) -> Result<(), TransportError> {
        self.broker.with(|b| b.set_prefetch(self.id, prefetch))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: PublishProperties,
    ) -> Result<ConfirmFuture, TransportError> {
        let confirm = self
            .broker
            .with(|b| b.publish(self.id, exchange, routing_key, body, properties))?;
        Ok(futures::future::ready(Ok::<_, TransportError>(confirm)).boxed())
    }

    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, TransportError> {
        let receiver = self.broker.with(|b| b.consume(self.id, queue, options))?;
        let stream = futures::stream::unfold(receiver, |mut rx| async move {
            rx.recv()
                .await
                .map(|delivery| (Ok::<_, TransportError>(delivery), rx))
        });
        Ok(stream.boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        self.broker.with(|b| b.ack(self.id, delivery_tag))
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        self.broker.with(|b| b.nack(self.id, delivery_tag, requeue))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        self.broker.with(|b| b.cancel(self.id, consumer_tag))
    }

    fn is_open(&self) -> bool {
        self.broker.with(|b| b.channel_is_open(self.id))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.broker.with(|b| b.close_channel(self.id));
        Ok(())
    }
}
