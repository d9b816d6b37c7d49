//! Broker connection lifecycle: configuration, state, and the
//! [`ConnectionManager`] every publisher and subscriber shares.

pub mod config;
pub mod manager;
pub mod state;

pub use self::config::{ConnectionConfig, DEFAULT_URL, ReconnectPolicy};
pub use manager::{ChannelLease, ConnectionManager};
pub use state::ConnectionState;
