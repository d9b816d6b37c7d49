//! The event envelope model: [`BaseEvent`] travels on the wire,
//! [`EventContext`] lives for one handler invocation.

pub mod context;
pub mod envelope;

pub use context::{EventContext, Settlement};
pub use envelope::{BaseEvent, EventMetadata};

#[cfg(test)]
mod tests;
