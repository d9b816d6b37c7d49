//! The `persistence` module is the durable store behind the in-memory broker.
//!
//! It keeps durable exchange/queue/binding declarations and persistent
//! messages on durable queues, so `MemoryBroker::restart` can bring them back
//! exactly the way a real broker recovers from disk.
//!
//! It uses `sled` as an embedded key-value store.

pub mod sled_store;

pub use sled_store::{Persistence, StoredTopology};
