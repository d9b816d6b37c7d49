//! Broker engine
//!
//! This module contains the in-process broker used by the memory transport.
//! It mirrors the parts of AMQP 0-9-1 the messaging core relies on:
//! - topic/direct/fanout exchanges, queues and bindings, declared
//!   idempotently (redeclaring with different settings is a precondition
//!   failure)
//! - round-robin delivery to the consumers of a queue, per-channel delivery
//!   tags and prefetch
//! - ack, nack with requeue, and dead-lettering through the queue's
//!   dead-letter exchange
//! - requeue of unacknowledged deliveries when their channel or connection
//!   goes away, flagged `redelivered`
//! - durable exchanges/queues/bindings and persistent messages, which
//!   survive [`Broker::restart`]
//!
//! Concurrency and usage notes:
//! - The `Broker` API is synchronous and is shared as `Arc<Mutex<Broker>>`
//!   through [`MemoryBroker`]. Deliveries are pushed into unbounded channels
//!   so no operation ever awaits while holding the lock.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::broker::message::{Message, QueuedMessage};
use crate::broker::topic::Exchange;
use crate::persistence::Persistence;
use crate::topology::{BindingSpec, ExchangeSpec, QueueSpec};
use crate::transport::{Confirm, ConsumeOptions, PublishProperties, RawDelivery};
use crate::utils::TransportError;

pub type ConnectionId = u64;
pub type ChannelId = u64;

type ConsumerKey = (ChannelId, String);

#[derive(Debug)]
struct Queue {
    spec: QueueSpec,
    ready: VecDeque<QueuedMessage>,
    consumers: Vec<ConsumerKey>,
    cursor: usize,
}

impl Queue {
    fn new(spec: QueueSpec) -> Self {
        Self {
            spec,
            ready: VecDeque::new(),
            consumers: Vec::new(),
            cursor: 0,
        }
    }
}

#[derive(Debug)]
struct Consumer {
    queue: String,
    no_ack: bool,
    sender: mpsc::UnboundedSender<RawDelivery>,
}

#[derive(Debug)]
struct Unacked {
    queue: String,
    message: QueuedMessage,
}

#[derive(Debug)]
struct Channel {
    connection: ConnectionId,
    next_tag: u64,
    prefetch: u16,
    confirm: bool,
    unacked: BTreeMap<u64, Unacked>,
    consumers: Vec<String>,
}

#[derive(Debug)]
struct Connection {
    channels: Vec<ChannelId>,
    closed: watch::Sender<bool>,
}

#[derive(Debug)]
pub struct Broker {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
    connections: HashMap<ConnectionId, Connection>,
    channels: HashMap<ChannelId, Channel>,
    consumers: HashMap<ConsumerKey, Consumer>,
    store: Option<Persistence>,
    next_id: u64,
    next_seq: u64,
    available: bool,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    /// A broker without a durable store: `restart` keeps durable entities and
    /// persistent messages in memory instead of reloading them from disk.
    pub fn new() -> Self {
        Self {
            exchanges: HashMap::new(),
            queues: HashMap::new(),
            connections: HashMap::new(),
            channels: HashMap::new(),
            consumers: HashMap::new(),
            store: None,
            next_id: 1,
            next_seq: 1,
            available: true,
        }
    }

    /// A broker backed by `store`; anything durable already in it is loaded.
    pub fn new_with_persistence(store: Persistence) -> Result<Self, TransportError> {
        let mut broker = Self::new();
        broker.store = Some(store);
        broker.load_durable()?;
        Ok(broker)
    }

    pub fn set_available(&mut self, available: bool) {
        self.available = available;
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    pub fn open_connection(
        &mut self,
    ) -> Result<(ConnectionId, watch::Receiver<bool>), TransportError> {
        if !self.available {
            return Err(TransportError::Unreachable(
                "in-memory broker is not accepting connections".into(),
            ));
        }
        let id = self.next_id();
        let (closed, rx) = watch::channel(false);
        self.connections.insert(
            id,
            Connection {
                channels: Vec::new(),
                closed,
            },
        );
        debug!(connection = id, "connection opened");
        Ok((id, rx))
    }

    pub fn close_connection(&mut self, id: ConnectionId) {
        let Some(connection) = self.connections.remove(&id) else {
            return;
        };
        for channel in connection.channels {
            self.close_channel(channel);
        }
        connection.closed.send_replace(true);
        debug!(connection = id, "connection closed");
    }

    /// Severs every client connection, as a network partition would.
    pub fn drop_connections(&mut self) {
        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for id in ids {
            self.close_connection(id);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn open_channel(&mut self, connection: ConnectionId) -> Result<ChannelId, TransportError> {
        if !self.connections.contains_key(&connection) {
            return Err(TransportError::ConnectionClosed);
        }
        let id = self.next_id();
        self.channels.insert(
            id,
            Channel {
                connection,
                next_tag: 1,
                prefetch: 0,
                confirm: false,
                unacked: BTreeMap::new(),
                consumers: Vec::new(),
            },
        );
        if let Some(conn) = self.connections.get_mut(&connection) {
            conn.channels.push(id);
        }
        Ok(id)
    }

    /// Closes a channel. Its consumers are cancelled and its unacknowledged
    /// deliveries go back to the head of their queues in delivery order.
    pub fn close_channel(&mut self, id: ChannelId) {
        let Some(channel) = self.channels.remove(&id) else {
            return;
        };

        for tag in &channel.consumers {
            if let Some(consumer) = self.consumers.remove(&(id, tag.clone())) {
                if let Some(queue) = self.queues.get_mut(&consumer.queue) {
                    queue.consumers.retain(|key| key != &(id, tag.clone()));
                }
            }
        }

        let mut touched = BTreeSet::new();
        for (_, unacked) in channel.unacked.into_iter().rev() {
            if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                let mut queued = unacked.message;
                queued.message.redelivered = true;
                queue.ready.push_front(queued);
                touched.insert(unacked.queue);
            }
        }

        if let Some(conn) = self.connections.get_mut(&channel.connection) {
            conn.channels.retain(|c| *c != id);
        }

        for queue in touched {
            self.dispatch(&queue);
        }
    }

    pub fn channel_is_open(&self, id: ChannelId) -> bool {
        self.channels.contains_key(&id)
    }

    pub fn declare_exchange(&mut self, spec: &ExchangeSpec) -> Result<(), TransportError> {
        if let Some(existing) = self.exchanges.get(&spec.name) {
            if existing.spec != *spec {
                return Err(TransportError::PreconditionFailed(format!(
                    "exchange '{}' redeclared with different settings",
                    spec.name
                )));
            }
            return Ok(());
        }
        if spec.durable {
            if let Some(store) = &self.store {
                store.save_exchange(spec)?;
            }
        }
        self.exchanges.insert(spec.name.clone(), Exchange::new(spec.clone()));
        debug!(exchange = %spec.name, kind = ?spec.kind, "exchange declared");
        Ok(())
    }

    pub fn declare_queue(&mut self, spec: &QueueSpec) -> Result<(), TransportError> {
        if let Some(existing) = self.queues.get(&spec.name) {
            if existing.spec != *spec {
                return Err(TransportError::PreconditionFailed(format!(
                    "queue '{}' redeclared with different settings",
                    spec.name
                )));
            }
            return Ok(());
        }
        if spec.durable {
            if let Some(store) = &self.store {
                store.save_queue(spec)?;
            }
        }
        self.queues.insert(spec.name.clone(), Queue::new(spec.clone()));
        debug!(queue = %spec.name, durable = spec.durable, "queue declared");
        Ok(())
    }

    pub fn bind_queue(&mut self, spec: &BindingSpec) -> Result<(), TransportError> {
        let queue_durable = match self.queues.get(&spec.queue) {
            Some(queue) => queue.spec.durable,
            None => return Err(TransportError::QueueNotFound(spec.queue.clone())),
        };
        let Some(exchange) = self.exchanges.get_mut(&spec.exchange) else {
            return Err(TransportError::ExchangeNotFound(spec.exchange.clone()));
        };
        if exchange.bind(&spec.queue, &spec.pattern) && queue_durable && exchange.spec.durable {
            if let Some(store) = &self.store {
                store.save_binding(spec)?;
            }
        }
        Ok(())
    }

    pub fn confirm_select(&mut self, channel: ChannelId) -> Result<(), TransportError> {
        self.channel_mut(channel)?.confirm = true;
        Ok(())
    }

    /// Caps the unacknowledged deliveries per channel; `0` means unlimited.
    pub fn set_prefetch(
        &mut self,
        channel: ChannelId,
        prefetch: u16,
    ) -> Result<(), TransportError> {
        self.channel_mut(channel)?.prefetch = prefetch;
        Ok(())
    }

    pub fn publish(
        &mut self,
        channel: ChannelId,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: PublishProperties,
    ) -> Result<Confirm, TransportError> {
        let confirm = self.channel_mut(channel)?.confirm;

        let targets = if exchange.is_empty() {
            // default exchange: routing key names the queue
            if self.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            }
        } else {
            match self.exchanges.get(exchange) {
                Some(ex) => ex.route(routing_key),
                None if confirm => {
                    return Ok(Confirm::Nack(format!("no exchange '{exchange}'")));
                }
                None => return Err(TransportError::ExchangeNotFound(exchange.to_string())),
            }
        };

        if targets.is_empty() {
            debug!(exchange, routing_key, "message unroutable; dropped");
        }

        let message = Message::new(exchange, routing_key, body, properties);
        for queue in &targets {
            self.enqueue(queue, message.clone())?;
        }
        // a confirmed persistent message must be on disk before the ack
        if confirm && message.properties.persistent && !targets.is_empty() {
            if let Some(store) = &self.store {
                store.flush()?;
            }
        }
        for queue in &targets {
            self.dispatch(queue);
        }

        Ok(if confirm {
            Confirm::Ack
        } else {
            Confirm::NotRequested
        })
    }

    pub fn consume(
        &mut self,
        channel: ChannelId,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<mpsc::UnboundedReceiver<RawDelivery>, TransportError> {
        if !self.channels.contains_key(&channel) {
            return Err(TransportError::ChannelClosed);
        }
        if !self.queues.contains_key(queue) {
            return Err(TransportError::QueueNotFound(queue.to_string()));
        }

        let tag = if options.consumer_tag.is_empty() {
            format!("amq.ctag-{}", self.next_id())
        } else {
            options.consumer_tag
        };
        let key = (channel, tag.clone());
        if self.consumers.contains_key(&key) {
            return Err(TransportError::PreconditionFailed(format!(
                "consumer tag '{tag}' already in use on this channel"
            )));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        self.consumers.insert(
            key.clone(),
            Consumer {
                queue: queue.to_string(),
                no_ack: options.no_ack,
                sender,
            },
        );
        if let Some(q) = self.queues.get_mut(queue) {
            q.consumers.push(key);
        }
        if let Some(ch) = self.channels.get_mut(&channel) {
            ch.consumers.push(tag.clone());
        }
        debug!(queue, consumer_tag = %tag, "consumer registered");

        self.dispatch(queue);
        Ok(receiver)
    }

    pub fn cancel(&mut self, channel: ChannelId, consumer_tag: &str) -> Result<(), TransportError> {
        let ch = self.channel_mut(channel)?;
        ch.consumers.retain(|t| t != consumer_tag);
        let key = (channel, consumer_tag.to_string());
        if let Some(consumer) = self.consumers.remove(&key) {
            if let Some(queue) = self.queues.get_mut(&consumer.queue) {
                queue.consumers.retain(|k| k != &key);
            }
        }
        Ok(())
    }

    pub fn ack(&mut self, channel: ChannelId, delivery_tag: u64) -> Result<(), TransportError> {
        let unacked = self
            .channel_mut(channel)?
            .unacked
            .remove(&delivery_tag)
            .ok_or(TransportError::UnknownDeliveryTag(delivery_tag))?;
        self.forget(&unacked.queue, &unacked.message);
        self.dispatch(&unacked.queue);
        Ok(())
    }

    pub fn nack(
        &mut self,
        channel: ChannelId,
        delivery_tag: u64,
        requeue: bool,
    ) -> Result<(), TransportError> {
        let unacked = self
            .channel_mut(channel)?
            .unacked
            .remove(&delivery_tag)
            .ok_or(TransportError::UnknownDeliveryTag(delivery_tag))?;

        if requeue {
            if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                let mut queued = unacked.message;
                queued.message.redelivered = true;
                queue.ready.push_front(queued);
            }
        } else {
            self.dead_letter(&unacked.queue, unacked.message)?;
        }
        self.dispatch(&unacked.queue);
        Ok(())
    }

    /// Simulates a broker process restart: every connection drops, transient
    /// exchanges/queues and non-persistent messages vanish, durable state is
    /// reloaded.
    pub fn restart(&mut self) -> Result<(), TransportError> {
        self.drop_connections();

        if self.store.is_some() {
            self.exchanges.clear();
            self.queues.clear();
            self.load_durable()?;
        } else {
            let durable_queues: BTreeSet<String> = self
                .queues
                .values()
                .filter(|q| q.spec.durable)
                .map(|q| q.spec.name.clone()).collect();
            self.queues.retain(|_, q| q.spec.durable);
            for queue in self.queues.values_mut() {
                queue.ready.retain(|m| m.message.properties.persistent);
                queue.consumers.clear();
                queue.cursor = 0;
            }
            self.exchanges.retain(|_, ex| ex.spec.durable);
            for exchange in self.exchanges.values_mut() {
                exchange
                    .bindings.retain(|b| durable_queues.contains(&b.queue));
            }
        }

        info!(
            exchanges = self.exchanges.len(),
            queues = self.queues.len(),
            "broker restarted"
        );
        Ok(())
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.exchanges.contains_key(name)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.queues.contains_key(name)
    }

    /// Messages ready for delivery on `queue`.
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.queues.get(queue).map(|q| q.ready.len())
    }

    /// Delivered but not yet acknowledged messages taken from `queue`.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.channels
            .values()
            .flat_map(|ch| ch.unacked.values())
            .filter(|u| u.queue == queue)
            .count()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.queues.get(queue).map_or(0, |q| q.consumers.len())
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn channel_mut(&mut self, id: ChannelId) -> Result<&mut Channel, TransportError> {
        self.channels
            .get_mut(&id)
            .ok_or(TransportError::ChannelClosed)
    }

    fn enqueue(&mut self, queue_name: &str, message: Message) -> Result<(), TransportError> {
        let seq = self.next_seq;
        self.next_seq += 1;
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return Ok(());
        };
        if queue.spec.durable && message.properties.persistent {
            if let Some(store) = &self.store {
                store.store_message(queue_name, seq, &message)?;
            }
        }
        queue.ready.push_back(QueuedMessage { seq, message });
        Ok(())
    }

    /// Drops a settled message from the durable store.
    fn forget(&self, queue: &str, queued: &QueuedMessage) {
        if !queued.message.properties.persistent {
            return;
        }
        if let Some(store) = &self.store {
            if let Err(e) = store.remove_message(queue, queued.seq) {
                warn!(
                    queue,
                    seq = queued.seq,
                    error = %e,
                    "failed to remove settled message from store"
                );
            }
        }
    }

    fn dead_letter(
        &mut self,
        queue_name: &str,
        queued: QueuedMessage,
    ) -> Result<(), TransportError> {
        self.forget(queue_name, &queued);

        let Some(queue) = self.queues.get(queue_name) else {
            return Ok(());
        };
        let Some(dlx) = queue.spec.dead_letter_exchange.clone() else {
            debug!(queue = queue_name, "rejected message dropped; no dead-letter exchange");
            return Ok(());
        };
        let routing_key = queue
            .spec
            .dead_letter_routing_key
            .clone().unwrap_or_else(|| queued.message.routing_key.clone());

        let Some(exchange) = self.exchanges.get(&dlx) else {
            warn!(
                queue = queue_name,
                exchange = %dlx,
                "dead-letter exchange missing; message dropped"
            );
            return Ok(());
        };
        let targets = exchange.route(&routing_key);

        let mut message = queued.message;
        message.exchange = dlx;
        message.routing_key = routing_key;
        message.redelivered = false;

        for target in &targets {
            self.enqueue(target, message.clone())?;
        }
        for target in &targets {
            self.dispatch(target);
        }
        debug!(queue = queue_name, targets = targets.len(), "message dead-lettered");
        Ok(())
    }

    /// Hands ready messages to consumers of `queue_name`, round-robin,
    /// until the queue is empty or every consumer is at its prefetch limit.
    fn dispatch(&mut self, queue_name: &str) {
        loop {
            let Some(queue) = self.queues.get_mut(queue_name) else {
                return;
            };
            if queue.ready.is_empty() || queue.consumers.is_empty() {
                return;
            }

            let count = queue.consumers.len();
            let mut chosen = None;
            for offset in 0..count {
                let idx = (queue.cursor + offset) % count;
                let key = &queue.consumers[idx];
                let (Some(consumer), Some(channel)) =
                    (self.consumers.get(key), self.channels.get(&key.0))
                else {
                    continue;
                };
                let has_room = consumer.no_ack
                    || channel.prefetch == 0
                    || channel.unacked.len() < usize::from(channel.prefetch);
                if has_room {
                    chosen = Some((idx, key.clone()));
                    break;
                }
            }
            let Some((idx, key)) = chosen else {
                return;
            };
            queue.cursor = (idx + 1) % count;
            let Some(queued) = queue.ready.pop_front() else {
                return;
            };

            let (Some(consumer), Some(channel)) =
                (self.consumers.get(&key), self.channels.get_mut(&key.0))
            else {
                queue.ready.push_front(queued);
                return;
            };

            let delivery_tag = channel.next_tag;
            channel.next_tag += 1;
            let delivery = RawDelivery {
                delivery_tag,
                exchange: queued.message.exchange.clone(),
                routing_key: queued.message.routing_key.clone(),
                redelivered: queued.message.redelivered,
                message_id: queued.message.properties.message_id.clone(),
                body: queued.message.body.clone(),
            };

            if consumer.sender.send(delivery).is_err() {
                // receiver dropped without a cancel: forget the consumer
                queue.ready.push_front(queued);
                queue.consumers.retain(|k| k != &key);
                channel.consumers.retain(|t| t != &key.1);
                self.consumers.remove(&key);
                continue;
            }

            if consumer.no_ack {
                self.forget(queue_name, &queued);
            } else {
                channel.unacked.insert(
                    delivery_tag,
                    Unacked {
                        queue: queue_name.to_string(),
                        message: queued,
                    },
                );
            }
        }
    }

    fn load_durable(&mut self) -> Result<(), TransportError> {
        let Some(store) = self.store.clone() else {
            return Ok(());
        };
        let topology = store.load_topology()?;

        for spec in topology.exchanges {
            self.exchanges.insert(spec.name.clone(), Exchange::new(spec));
        }
        for spec in topology.queues {
            let mut queue = Queue::new(spec);
            for (seq, message) in store.load_messages(&queue.spec.name)? {
                self.next_seq = self.next_seq.max(seq + 1);
                queue.ready.push_back(QueuedMessage { seq, message });
            }
            self.queues.insert(queue.spec.name.clone(), queue);
        }
        for binding in topology.bindings {
            if let Some(exchange) = self.exchanges.get_mut(&binding.exchange) {
                exchange.bind(&binding.queue, &binding.pattern);
            }
        }
        Ok(())
    }
}

/// Shared handle to a [`Broker`]; clones point at the same broker.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Mutex<Broker>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A broker whose durable state lives in a sled store at `path`.
    pub fn open(path: &str) -> Result<Self, TransportError> {
        Self::with_persistence(Persistence::open(path)?)
    }

    pub fn with_persistence(store: Persistence) -> Result<Self, TransportError> {
        Ok(Self {
            inner: Arc::new(Mutex::new(Broker::new_with_persistence(store)?)),
        })
    }

    /// Runs `f` with the broker locked.
    pub fn with<R>(&self, f: impl FnOnce(&mut Broker) -> R) -> R {
        let mut broker = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut broker)
    }

    pub fn connector(&self) -> crate::transport::MemoryConnector {
        crate::transport::MemoryConnector::new(self.clone())
    }

    pub fn set_available(&self, available: bool) {
        self.with(|b| b.set_available(available));
    }

    pub fn drop_connections(&self) {
        self.with(Broker::drop_connections);
    }

    pub fn restart(&self) -> Result<(), TransportError> {
        self.with(Broker::restart)
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.with(|b| b.has_exchange(name))
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.with(|b| b.has_queue(name))
    }

    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.with(|b| b.queue_depth(queue))
    }

    pub fn unacked_count(&self, queue: &str) -> usize {
        self.with(|b| b.unacked_count(queue))
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.with(|b| b.consumer_count(queue))
    }

    pub fn connection_count(&self) -> usize {
        self.with(|b| b.connection_count())
    }
}
