//! Exchange routing
//!
//! An `Exchange` holds its declaration and the list of queue bindings.
//! Routing a key returns the names of the bound queues that match it, once
//! each, in binding order.
//!
//! Concurrency note: callers must synchronize access to `Exchange` (for
//! example via the broker lock) when modifying bindings.

use crate::topology::{ExchangeKind, ExchangeSpec, matches};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub queue: String,
    pub pattern: String,
}

#[derive(Debug, Clone)]
pub struct Exchange {
    pub spec: ExchangeSpec,
    pub bindings: Vec<Binding>,
}

impl Exchange {
    pub fn new(spec: ExchangeSpec) -> Self {
        Self {
            spec,
            bindings: Vec::new(),
        }
    }

    /// Add a binding. Duplicate binds are ignored; returns whether it was new.
    pub fn bind(&mut self, queue: &str, pattern: &str) -> bool {
        let binding = Binding {
            queue: queue.to_string(),
            pattern: pattern.to_string(),
        };
        if self.bindings.contains(&binding) {
            return false;
        }
        self.bindings.push(binding);
        true
    }

    pub fn route(&self, routing_key: &str) -> Vec<String> {
        let mut targets: Vec<String> = Vec::new();
        for binding in &self.bindings {
            let hit = match self.spec.kind {
                ExchangeKind::Topic => matches(&binding.pattern, routing_key),
                ExchangeKind::Direct => binding.pattern == routing_key,
                ExchangeKind::Fanout => true,
            };
            if hit && !targets.contains(&binding.queue) {
                targets.push(binding.queue.clone());
            }
        }
        targets
    }
}
