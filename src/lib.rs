//! # eventcore
//!
//! `eventcore` is the event backbone shared by a fleet of services. Services
//! publish JSON event envelopes to a durable topic exchange and consume them
//! from durable queues with manual acknowledgement, publisher confirms and
//! dead-lettering of messages their handlers cannot process.
//!
//! ## Core Modules
//!
//! - `connection`: The `ConnectionManager` owning the broker connection, its
//!   reconnect loop and the topology replayed after each reconnect.
//! - `publisher`: Confirmed, ordered publishing of `BaseEvent`s.
//! - `subscriber`: Queue consumers feeding handlers, plus the dead-letter monitor.
//! - `event`: The `BaseEvent` envelope and the per-delivery `EventContext`.
//! - `topology`: Exchange/queue/binding declarations and naming conventions.
//! - `transport`: The broker seam, with an AMQP (lapin) and an in-memory implementation.
//! - `broker`: The in-memory broker behind the memory transport.
//! - `persistence`: The sled store keeping the in-memory broker's durable state.
//! - `verify`: The publish/restart/verify persistence check.
//! - `config`: Loading settings from file and environment.
//! - `utils`: Error taxonomy and logging setup.

pub mod broker;
pub mod config;
pub mod connection;
pub mod event;
pub mod persistence;
pub mod publisher;
pub mod subscriber;
pub mod topology;
pub mod transport;
pub mod utils;
pub mod verify;

pub use connection::{ConnectionConfig, ConnectionManager, ConnectionState, ReconnectPolicy};
pub use event::{BaseEvent, EventContext, EventMetadata};
pub use publisher::{Publisher, PublisherConfig};
pub use subscriber::{
    DeadLetterMonitor, EventHandler, Subscriber, SubscriberConfig, SubscriptionHandle, handler_fn,
};
pub use utils::{EventError, Result};

#[cfg(test)]
mod tests;
