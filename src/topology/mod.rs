//! Exchange / queue / binding declarations.
//!
//! Everything here is plain data: publishers and subscribers build
//! [`Declaration`]s, the connection manager records them and replays them
//! after a reconnect. Declaring is idempotent on the broker side, so replay
//! is always safe.

pub mod pattern;

use serde::{Deserialize, Serialize};

pub use pattern::matches;

/// Name of the shared topic exchange every service publishes to.
pub const DEFAULT_EXCHANGE: &str = "events";

/// Suffix used for a queue's dead-letter exchange and queue.
pub const DEAD_LETTER_SUFFIX: &str = ".dlq";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Topic,
    Direct,
    Fanout,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

impl ExchangeSpec {
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Topic,
            durable: true,
        }
    }

    pub fn transient(mut self) -> Self {
        self.durable = false;
        self
    }
}

impl Default for ExchangeSpec {
    fn default() -> Self {
        Self::topic(DEFAULT_EXCHANGE)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    /// Sets `x-dead-letter-exchange` on the queue.
    #[serde(default)]
    pub dead_letter_exchange: Option<String>,
    /// Sets `x-dead-letter-routing-key`; the original key is kept when unset.
    #[serde(default)]
    pub dead_letter_routing_key: Option<String>,
}

impl QueueSpec {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            dead_letter_exchange: None,
            dead_letter_routing_key: None,
        }
    }

    pub fn transient(mut self) -> Self {
        self.durable = false;
        self
    }

    pub fn with_dead_letter_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingSpec {
    pub queue: String,
    pub exchange: String,
    pub pattern: String,
}

impl BindingSpec {
    pub fn new(
        queue: impl Into<String>,
        exchange: impl Into<String>,
        pattern: impl Into<String>,
    ) -> Self {
        Self {
            queue: queue.into(),
            exchange: exchange.into(),
            pattern: pattern.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Declaration {
    Exchange(ExchangeSpec),
    Queue(QueueSpec),
    Binding(BindingSpec),
}

/// `<consumer>.<purpose>.queue`, e.g. `billing.payments.queue`.
pub fn queue_name(consumer: &str, purpose: &str) -> String {
    format!("{consumer}.{purpose}.queue")
}

/// Name shared by a queue's dead-letter exchange and dead-letter queue.
pub fn dead_letter_name(queue: &str) -> String {
    format!("{queue}{DEAD_LETTER_SUFFIX}")
}

/// Declarations for a dead-letter pair: a durable topic exchange and a
/// durable queue bound to it with `#`, both named `<queue>.dlq`.
pub fn dead_letter_declarations(queue: &str) -> Vec<Declaration> {
    let name = dead_letter_name(queue);
    vec![
        Declaration::Exchange(ExchangeSpec::topic(name.clone())),
        Declaration::Queue(QueueSpec::durable(name.clone())),
        Declaration::Binding(BindingSpec::new(name.clone(), name, "#")),
    ]
}

#[cfg(test)]
mod tests;
