//! Dead-letter monitor: a consumer bound directly to `<queue>.dlq` that logs
//! every poison message with its full envelope and acks it.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tracing::{info, warn};
use uuid::Uuid;

use super::{Subscriber, SubscriberConfig, SubscriptionHandle, handler_fn};
use crate::connection::ConnectionManager;
use crate::event::BaseEvent;
use crate::topology::{dead_letter_declarations, dead_letter_name};
use crate::transport::{self, ConsumeOptions};
use crate::utils::Result;

pub struct DeadLetterMonitor {
    manager: Arc<ConnectionManager>,
    source: String,
    queue: String,
}

impl DeadLetterMonitor {
    /// Monitors the dead-letter queue of `source_queue`.
    pub fn new(manager: Arc<ConnectionManager>, source_queue: impl Into<String>) -> Self {
        let source = source_queue.into();
        let queue = dead_letter_name(&source);
        Self {
            manager,
            source,
            queue,
        }
    }

    /// Name of the monitored dead-letter queue.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Declares the dead-letter exchange/queue pair so the monitor can run
    /// before the source subscriber ever did.
    pub async fn initialize(&self) -> Result<()> {
        let declarations = dead_letter_declarations(&self.source);
        self.manager.register_topology(declarations.clone());

        let channel = self.manager.get_channel().await?;
        for declaration in &declarations {
            transport::declare(channel.as_ref(), declaration).await?;
        }
        channel.close().await?;
        Ok(())
    }

    /// Logs and acks dead letters as they arrive, until the handle is
    /// cancelled.
    pub async fn start(&self) -> Result<SubscriptionHandle> {
        let subscriber = Subscriber::new(
            Arc::clone(&self.manager),
            SubscriberConfig::new(self.queue.clone()),
        );
        subscriber.initialize().await?;

        let queue = self.queue.clone();
        subscriber
            .subscribe(handler_fn(move |event, ctx| {
                log_dead_letter(&queue, &event, ctx.redelivered());
                async move {
                    ctx.ack().await?;
                    Ok(())
                }
            }))
            .await
    }

    /// Consumes whatever is in the dead-letter queue, acking each message,
    /// and returns once no delivery arrived for `idle`. Bodies that are not
    /// valid envelopes are logged raw, acked and left out of the result.
    pub async fn drain(&self, idle: Duration) -> Result<Vec<BaseEvent>> {
        let channel = self.manager.get_channel().await?;
        let consumer_tag = format!("{}.drain.{}", self.queue, Uuid::new_v4().simple());
        let mut stream = channel
            .consume(
                &self.queue,
                ConsumeOptions {
                    consumer_tag: consumer_tag.clone(),
                    no_ack: false,
                },
            )
            .await?;

        let mut drained = Vec::new();
        while let Ok(Some(delivery)) = tokio::time::timeout(idle, stream.next()).await {
            let delivery = delivery?;
            match BaseEvent::from_slice(&delivery.body) {
                Ok(event) => {
                    log_dead_letter(&self.queue, &event, delivery.redelivered);
                    drained.push(event);
                }
                Err(e) => warn!(
                    queue = %self.queue,
                    error = %e,
                    body = %String::from_utf8_lossy(&delivery.body),
                    "undecodable dead letter"
                ),
            }
            channel.ack(delivery.delivery_tag).await?;
        }

        channel.cancel(&consumer_tag).await?;
        channel.close().await?;
        info!(queue = %self.queue, drained = drained.len(), "dead-letter queue drained");
        Ok(drained)
    }
}

fn log_dead_letter(queue: &str, event: &BaseEvent, redelivered: bool) {
    let envelope = serde_json::to_string(event).unwrap_or_default();
    warn!(
        queue,
        event_id = %event.event_id,
        event_type = %event.event_type,
        service = %event.metadata.service,
        redelivered,
        envelope = %envelope,
        "dead letter"
    );
}
