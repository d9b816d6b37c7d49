//! Subscriber
//!
//! Binds a durable queue to an exchange and feeds each delivery to an
//! [`EventHandler`] together with an [`EventContext`] for acknowledging it.
//!
//! Delivery rules:
//! - handlers run one at a time per subscription, in delivery order
//! - a body that is not a valid envelope is rejected without requeue
//! - a handler that fails (or panics) without settling its delivery gets
//!   it rejected without requeue, so it lands in the dead-letter queue when
//!   one is configured
//! - a message is only removed from the queue once it is acked
//!
//! When the delivery stream ends (connection loss, broker restart) the
//! subscription re-acquires a channel from the [`ConnectionManager`] and
//! resumes consuming. Unacked deliveries come back flagged `redelivered`.

pub mod handler;
pub mod monitor;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::FutureExt;
use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::connection::ConnectionManager;
use crate::event::{BaseEvent, EventContext};
use crate::topology::{
    BindingSpec, Declaration, ExchangeSpec, QueueSpec, dead_letter_declarations, dead_letter_name,
};
use crate::transport::{self, BrokerChannel, ConsumeOptions, DeliveryStream, RawDelivery};
use crate::utils::{EventError, Result};

pub use handler::{EventHandler, HandlerResult, handler_fn};
pub use monitor::DeadLetterMonitor;

/// Bytes of an undecodable body included in the warning log.
const BODY_PREVIEW: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberConfig {
    pub queue: String,
    /// `(exchange, routing-key pattern)` the queue is bound with.
    pub binding: Option<(String, String)>,
    /// Declares `<queue>.dlq` and routes rejected messages there.
    pub dead_letter: bool,
    pub manual_ack: bool,
    /// Unacked deliveries in flight on the consumer channel; 0 is unlimited.
    pub prefetch: u16,
    pub consumer_tag: Option<String>,
    /// Ack automatically when the handler returns `Ok` without settling.
    pub ack_on_success: bool,
}

impl SubscriberConfig {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            binding: None,
            dead_letter: false,
            manual_ack: true,
            prefetch: 10,
            consumer_tag: None,
            ack_on_success: false,
        }
    }

    pub fn bind(mut self, exchange: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.binding = Some((exchange.into(), pattern.into()));
        self
    }

    pub fn with_dead_letter(mut self) -> Self {
        self.dead_letter = true;
        self
    }

    pub fn auto_ack(mut self) -> Self {
        self.manual_ack = false;
        self
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn with_consumer_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = Some(tag.into());
        self
    }

    pub fn ack_on_success(mut self) -> Self {
        self.ack_on_success = true;
        self
    }

    /// Everything this subscriber needs declared on the broker, in order.
    pub fn declarations(&self) -> Vec<Declaration> {
        let mut declarations = Vec::new();
        let mut queue = QueueSpec::durable(self.queue.clone());

        if self.dead_letter {
            declarations.extend(dead_letter_declarations(&self.queue));
            queue = queue.with_dead_letter_exchange(dead_letter_name(&self.queue));
        }
        if let Some((exchange, _)) = &self.binding {
            declarations.push(Declaration::Exchange(ExchangeSpec::topic(exchange.clone())));
        }
        declarations.push(Declaration::Queue(queue));
        if let Some((exchange, pattern)) = &self.binding {
            declarations.push(Declaration::Binding(BindingSpec::new(
                self.queue.clone(),
                exchange.clone(),
                pattern.clone(),
            )));
        }
        declarations
    }
}

pub struct Subscriber {
    manager: Arc<ConnectionManager>,
    config: SubscriberConfig,
    initialized: AtomicBool,
}

impl Subscriber {
    pub fn new(manager: Arc<ConnectionManager>, config: SubscriberConfig) -> Self {
        Self {
            manager,
            config,
            initialized: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &SubscriberConfig {
        &self.config
    }

    /// Declares the queue, its binding and the dead-letter pair when
    /// configured. The declarations are replayed after every reconnect.
    pub async fn initialize(&self) -> Result<()> {
        let declarations = self.config.declarations();
        self.manager.register_topology(declarations.clone());

        let channel = self.manager.get_channel().await?;
        for declaration in &declarations {
            transport::declare(channel.as_ref(), declaration).await?;
        }
        channel.close().await?;

        self.initialized.store(true, Ordering::Release);
        info!(
            queue = %self.config.queue,
            binding = ?self.config.binding,
            dead_letter = self.config.dead_letter,
            "subscriber initialized"
        );
        Ok(())
    }

    /// Starts consuming. The first consume happens before this returns, so
    /// a missing queue or a dead connection is reported here.
    pub async fn subscribe(&self, handler: impl EventHandler) -> Result<SubscriptionHandle> {
        if !self.initialized.load(Ordering::Acquire) {
            return Err(EventError::NotInitialized("Subscriber::subscribe"));
        }

        let consumer_tag = self
            .config
            .consumer_tag
            .clone()
            .unwrap_or_else(|| format!("{}.{}", self.config.queue, Uuid::new_v4().simple()));
        let consumer = Consumer {
            manager: Arc::clone(&self.manager),
            config: self.config.clone(),
            handler: Arc::new(handler),
            consumer_tag: consumer_tag.clone(),
        };
        let (channel, stream) = consumer.open().await?;

        let (cancel, cancelled) = watch::channel(false);
        let task = tokio::spawn(consumer.run(channel, stream, cancelled));
        info!(queue = %self.config.queue, consumer_tag = %consumer_tag, "subscription started");

        Ok(SubscriptionHandle {
            consumer_tag,
            cancel,
            task,
        })
    }
}

/// Controls a running subscription. Dropping it leaves the subscription
/// running.
#[derive(Debug)]
pub struct SubscriptionHandle {
    consumer_tag: String,
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// Stops consuming after the in-flight handler finishes. Unacked
    /// deliveries go back to the queue when the channel closes.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the consume loop to exit.
    pub async fn join(self) -> Result<()> {
        self.task.await?;
        Ok(())
    }

    /// `cancel` followed by `join`.
    pub async fn shutdown(self) -> Result<()> {
        self.cancel();
        self.join().await
    }
}

struct Consumer {
    manager: Arc<ConnectionManager>,
    config: SubscriberConfig,
    handler: Arc<dyn EventHandler>,
    consumer_tag: String,
}

async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let handle_dropped = cancel.wait_for(|c| *c).await.is_err();
    if handle_dropped {
        std::future::pending::<()>().await;
    }
}

impl Consumer {
    async fn open(&self) -> Result<(Arc<dyn BrokerChannel>, DeliveryStream)> {
        let channel = self.manager.get_channel().await?;
        if self.config.manual_ack && self.config.prefetch > 0 {
            channel.qos(self.config.prefetch).await?;
        }
        let stream = channel
            .consume(
                &self.config.queue,
                ConsumeOptions {
                    consumer_tag: self.consumer_tag.clone(),
                    no_ack: !self.config.manual_ack,
                },
            )
            .await?;
        Ok((channel, stream))
    }

    async fn run(
        self,
        mut channel: Arc<dyn BrokerChannel>,
        mut stream: DeliveryStream,
        mut cancel: watch::Receiver<bool>,
    ) {
        let queue = self.config.queue.clone();
        loop {
            tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => {
                    if let Err(e) = channel.cancel(&self.consumer_tag).await {
                        debug!(queue = %queue, error = %e, "basic.cancel failed");
                    }
                    let _ = channel.close().await;
                    info!(
                        queue = %queue,
                        consumer_tag = %self.consumer_tag,
                        "subscription cancelled"
                    );
                    return;
                }
                next = stream.next() => match next {
                    Some(Ok(delivery)) => self.dispatch(&channel, delivery).await,
                    end => {
                        if let Some(Err(e)) = end {
                            warn!(queue = %queue, error = %e, "delivery stream failed");
                        }
                        match self.resume(&mut cancel).await {
                            Some((ch, st)) => {
                                channel = ch;
                                stream = st;
                            }
                            None => return,
                        }
                    }
                },
            }
        }
    }

    /// Re-establishes the consumer after its stream ended. `None` when the
    /// subscription should stop.
    async fn resume(
        &self,
        cancel: &mut watch::Receiver<bool>,
    ) -> Option<(Arc<dyn BrokerChannel>, DeliveryStream)> {
        let queue = &self.config.queue;
        let retry_delay = self.manager.config().reconnect.initial_delay;
        loop {
            if self.manager.is_closing() {
                debug!(queue = %queue, "connection closed; consume loop exiting");
                return None;
            }
            tokio::select! {
                biased;
                _ = cancelled(cancel) => return None,
                opened = self.open() => match opened {
                    Ok(consumer) => {
                        info!(
                            queue = %queue,
                            generation = self.manager.generation(),
                            "consumer resumed"
                        );
                        return Some(consumer);
                    }
                    Err(e @ (EventError::ConnectionClosed
                    | EventError::NotConnected
                    | EventError::ReconnectionExhausted { .. })) => {
                        error!(queue = %queue, error = %e, "consumer cannot resume");
                        return None;
                    }
                    Err(e) => {
                        warn!(queue = %queue, error = %e, "consumer resume failed; retrying");
                    }
                },
            }
            tokio::select! {
                _ = cancelled(cancel) => return None,
                _ = tokio::time::sleep(retry_delay) => {}
            }
        }
    }

    async fn dispatch(&self, channel: &Arc<dyn BrokerChannel>, delivery: RawDelivery) {
        let ctx = EventContext::new(Arc::clone(channel), &delivery, self.config.manual_ack);

        let event = match BaseEvent::from_slice(&delivery.body) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    queue = %self.config.queue,
                    delivery_tag = delivery.delivery_tag,
                    error = %e,
                    body = %preview(&delivery.body),
                    "malformed envelope; rejecting"
                );
                if let Err(e) = ctx.nack(false).await {
                    warn!(delivery_tag = delivery.delivery_tag, error = %e, "reject failed");
                }
                return;
            }
        };

        let span = info_span!(
            "handle_event",
            event_id = %event.event_id,
            event_type = %event.event_type,
            queue = %self.config.queue,
            redelivered = delivery.redelivered,
        );
        let outcome = AssertUnwindSafe(self.handler.handle(event, ctx.clone()))
            .catch_unwind()
            .instrument(span.clone())
            .await;

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(EventError::Handler(e.to_string())),
            Err(panic) => Some(EventError::Handler(panic_message(panic.as_ref()))),
        };

        let settled = match failure {
            None if self.config.ack_on_success && !ctx.is_settled() => ctx.ack().await,
            None => Ok(()),
            Some(e) if ctx.is_settled() => {
                span.in_scope(|| debug!(error = %e, "handler failed after settling"));
                Ok(())
            }
            Some(e) => {
                span.in_scope(|| warn!(error = %e, "handler failed; rejecting to dead-letter"));
                ctx.nack(false).await
            }
        };
        if let Err(e) = settled {
            span.in_scope(|| warn!(error = %e, "settling delivery failed"));
        }
    }
}

fn preview(body: &[u8]) -> String {
    let end = body.len().min(BODY_PREVIEW);
    String::from_utf8_lossy(&body[..end]).into_owned()
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("handler panicked: {message}")
    } else {
        "handler panicked".to_string()
    }
}
