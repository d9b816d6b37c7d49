//! Test doubles shared by the module test suites.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;

use crate::broker::MemoryBroker;
use crate::connection::{ConnectionConfig, ConnectionManager, ReconnectPolicy};
use crate::topology::{BindingSpec, ExchangeSpec, QueueSpec};
use crate::transport::{
    BrokerChannel, BrokerConnection, Confirm, ConfirmFuture, ConsumeOptions, Connector,
    DeliveryStream, MemoryConnector, PublishProperties,
};
use crate::utils::TransportError;

/// How a [`ScriptedConnector`] channel answers publishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmScript {
    /// Whatever the memory broker says.
    Broker,
    /// The message is routed but the confirm is a nack.
    Nack(String),
    /// The message is routed and the channel closes before the confirm.
    ChannelClosed,
    /// The message is routed and the confirm never arrives.
    Hang,
}

/// Memory transport whose publisher confirms can be scripted.
#[derive(Clone)]
pub struct ScriptedConnector {
    inner: MemoryConnector,
    script: Arc<Mutex<ConfirmScript>>,
}

impl ScriptedConnector {
    pub fn new(broker: &MemoryBroker) -> Self {
        Self {
            inner: broker.connector(),
            script: Arc::new(Mutex::new(ConfirmScript::Broker)),
        }
    }

    pub fn set(&self, script: ConfirmScript) {
        *self.script.lock().unwrap() = script;
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(
        &self,
        config: &ConnectionConfig,
    ) -> Result<Arc<dyn BrokerConnection>, TransportError> {
        Ok(Arc::new(ScriptedConnection {
            inner: self.inner.connect(config).await?,
            script: Arc::clone(&self.script),
        }))
    }
}

struct ScriptedConnection {
    inner: Arc<dyn BrokerConnection>,
    script: Arc<Mutex<ConfirmScript>>,
}

#[async_trait]
impl BrokerConnection for ScriptedConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, TransportError> {
        Ok(Arc::new(ScriptedChannel {
            inner: self.inner.open_channel().await?,
            script: Arc::clone(&self.script),
        }))
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    async fn closed(&self) {
        self.inner.closed().await
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.inner.close().await
    }
}

struct ScriptedChannel {
    inner: Arc<dyn BrokerChannel>,
    script: Arc<Mutex<ConfirmScript>>,
}

#[async_trait]
impl BrokerChannel for ScriptedChannel {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), TransportError> {
        self.inner.declare_exchange(spec).await
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), TransportError> {
        self.inner.declare_queue(spec).await
    }

    async fn bind_queue(&self, spec: &BindingSpec) -> Result<(), TransportError> {
        self.inner.bind_queue(spec).await
    }

    async fn confirm_select(&self) -> Result<(), TransportError> {
        self.inner.confirm_select().await
    }

    async fn qos(&self, prefetch: u16) -> Result<(), TransportError> {
        self.inner.qos(prefetch).await
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: PublishProperties,
    ) -> Result<ConfirmFuture, TransportError> {
        let confirm = self
            .inner
            .publish(exchange, routing_key, body, properties)
            .await?;
        let script = self.script.lock().unwrap().clone();
        Ok(match script {
            ConfirmScript::Broker => confirm,
            ConfirmScript::Nack(reason) => {
                futures::future::ready(Ok::<_, TransportError>(Confirm::Nack(reason))).boxed()
            }
            ConfirmScript::ChannelClosed => {
                futures::future::ready(Err::<Confirm, _>(TransportError::ChannelClosed)).boxed()
            }
            ConfirmScript::Hang => futures::future::pending().boxed(),
        })
    }

    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, TransportError> {
        self.inner.consume(queue, options).await
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        self.inner.ack(delivery_tag).await
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        self.inner.nack(delivery_tag, requeue).await
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        self.inner.cancel(consumer_tag).await
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.inner.close().await
    }
}

/// Fast reconnect settings so paused-clock tests stay short.
pub fn fast_config() -> ConnectionConfig {
    ConnectionConfig {
        reconnect: ReconnectPolicy {
            enabled: true,
            max_retries: Some(5),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            multiplier: 2.0,
        },
        ..ConnectionConfig::default()
    }
}

/// A connected manager over `broker`.
pub async fn connected(broker: &MemoryBroker) -> Arc<ConnectionManager> {
    let manager = ConnectionManager::new(fast_config(), broker.connector());
    manager.connect().await.unwrap();
    manager
}
