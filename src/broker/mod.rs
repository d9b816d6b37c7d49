//! In-process AMQP-style broker.
//!
//! Backs the memory transport so the whole messaging core (reconnection,
//! confirms, manual acks, dead-lettering, durability across restarts) can run
//! and be tested without a network broker.

pub mod engine;
pub mod message;
pub mod topic;

pub use engine::{Broker, ChannelId, ConnectionId, MemoryBroker};
