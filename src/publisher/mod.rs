//! Publisher
//!
//! Sends [`BaseEvent`]s to a durable topic exchange with publisher confirms.
//! `publish` only resolves once the broker has taken responsibility for the
//! message, so a returned `Ok` means the event survives a broker restart.
//!
//! Publishes from one `Publisher` go out over one channel, serialized by an
//! async mutex, so they reach the broker in call order. The mutex is released
//! as soon as the message is on the wire; waiting for the confirm happens
//! outside it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::connection::{ChannelLease, ConnectionManager};
use crate::event::{BaseEvent, EventMetadata};
use crate::topology::{DEFAULT_EXCHANGE, Declaration, ExchangeSpec};
use crate::transport::{Confirm, ConfirmFuture, PublishProperties};
use crate::utils::{EventError, Result, TransportError};

pub const CONTENT_TYPE_JSON: &str = "application/json";

#[derive(Debug, Clone, PartialEq)]
pub struct PublisherConfig {
    /// Default `metadata.service` for events published without metadata.
    pub service: String,
    pub exchange: String,
    pub confirm_timeout: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            service: "eventcore".to_string(),
            exchange: DEFAULT_EXCHANGE.to_string(),
            confirm_timeout: Duration::from_secs(5),
        }
    }
}

impl PublisherConfig {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            ..Self::default()
        }
    }
}

pub struct Publisher {
    manager: Arc<ConnectionManager>,
    config: PublisherConfig,
    lease: Mutex<Option<ChannelLease>>,
    initialized: AtomicBool,
}

impl Publisher {
    pub fn new(manager: Arc<ConnectionManager>, config: PublisherConfig) -> Self {
        Self {
            manager,
            config,
            lease: Mutex::new(None),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    fn exchange_spec(&self) -> ExchangeSpec {
        ExchangeSpec::topic(self.config.exchange.clone())
    }

    /// Asserts the exchange and puts the publishing channel in confirm mode.
    /// The exchange is also re-declared after every reconnect.
    pub async fn initialize(&self) -> Result<()> {
        self.manager
            .register_topology([Declaration::Exchange(self.exchange_spec())]);

        let mut slot = self.lease.lock().await;
        *slot = Some(self.open_lease().await?);
        self.initialized.store(true, Ordering::Release);

        info!(
            exchange = %self.config.exchange,
            service = %self.config.service,
            "publisher initialized"
        );
        Ok(())
    }

    /// Wraps `data` in a new envelope (`eventType` = `routing_key`) and
    /// publishes it. Returns the envelope that was confirmed.
    pub async fn publish(
        &self,
        routing_key: &str,
        data: Value,
        metadata: Option<EventMetadata>,
    ) -> Result<BaseEvent> {
        let metadata = metadata.unwrap_or_else(|| EventMetadata::new(self.config.service.clone()));
        let event = BaseEvent::new(routing_key, data, metadata);
        self.publish_event(&event).await?;
        Ok(event)
    }

    /// Publishes an already built envelope. Retrying a failed publish with
    /// the same envelope keeps its `eventId`, so consumers can deduplicate.
    pub async fn publish_event(&self, event: &BaseEvent) -> Result<()> {
        if !self.initialized.load(Ordering::Acquire) {
            return Err(EventError::NotInitialized("Publisher::publish"));
        }

        let body = event.to_bytes()?;
        let properties = PublishProperties {
            message_id: Some(event.event_id.clone()),
            content_type: Some(CONTENT_TYPE_JSON.to_string()),
            persistent: true,
            timestamp: u64::try_from(event.timestamp / 1000).ok(),
        };

        let confirm = self.send(event, body, properties).await?;
        self.await_confirm(event, confirm).await
    }

    /// Puts the message on the wire, re-acquiring the channel when the
    /// connection was re-established since the last publish.
    async fn send(
        &self,
        event: &BaseEvent,
        body: Vec<u8>,
        properties: PublishProperties,
    ) -> Result<ConfirmFuture> {
        let mut slot = self.lease.lock().await;
        let mut retried = false;
        loop {
            let lease = match slot.as_ref() {
                Some(lease)
                    if lease.generation == self.manager.generation()
                        && lease.channel.is_open() =>
                {
                    lease.clone()
                }
                _ => {
                    debug!("publisher channel stale; re-acquiring");
                    let fresh = self.open_lease().await?;
                    *slot = Some(fresh.clone());
                    fresh
                }
            };

            let sent = lease
                .channel
                .publish(
                    &self.config.exchange,
                    event.routing_key(),
                    body.clone(),
                    properties.clone(),
                )
                .await;
            match sent {
                Ok(confirm) => return Ok(confirm),
                Err(TransportError::ChannelClosed | TransportError::ConnectionClosed)
                    if !retried =>
                {
                    warn!(
                        event_id = %event.event_id,
                        "channel closed during publish; retrying once"
                    );
                    *slot = None;
                    retried = true;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn await_confirm(&self, event: &BaseEvent, confirm: ConfirmFuture) -> Result<()> {
        let timeout = self.config.confirm_timeout;
        tokio::select! {
            biased;
            outcome = tokio::time::timeout(timeout, confirm) => match outcome {
                Err(_) => Err(EventError::PublishTimeout {
                    event_id: event.event_id.clone(),
                    timeout,
                }),
                Ok(Err(_)) if self.manager.is_closing() => Err(EventError::ConnectionClosed),
                Ok(Err(e)) => {
                    warn!(event_id = %event.event_id, error = %e, "confirm lost");
                    Err(EventError::Publish {
                        event_id: event.event_id.clone(),
                        reason: format!("no confirm from broker: {e}"),
                    })
                }
                Ok(Ok(Confirm::Nack(reason))) => Err(EventError::Publish {
                    event_id: event.event_id.clone(),
                    reason,
                }),
                Ok(Ok(Confirm::Ack | Confirm::NotRequested)) => {
                    debug!(
                        event_id = %event.event_id,
                        routing_key = %event.routing_key(),
                        "event confirmed"
                    );
                    Ok(())
                }
            },
            _ = self.manager.closing() => Err(EventError::ConnectionClosed),
        }
    }

    async fn open_lease(&self) -> Result<ChannelLease> {
        let lease = self.manager.lease().await?;
        lease.channel.declare_exchange(&self.exchange_spec()).await?;
        lease.channel.confirm_select().await?;
        Ok(lease)
    }
}

#[cfg(test)]
mod tests;
