//! Connection manager
//!
//! Owns the single logical broker connection of the process:
//! - `connect()` performs the initial handshake (a few immediate attempts,
//!   no backoff) and fails fast with [`EventError::Connection`]
//! - a supervisor task watches the live connection and, when it drops
//!   unexpectedly, reconnects with exponential backoff, replays every
//!   registered topology declaration and bumps the connection generation
//! - `get_channel()` / `lease()` hand out channels, waiting out an
//!   in-progress reconnection
//! - `close()` closes every handed-out channel, then the connection
//!
//! Locking notes: the connection slot, topology registry and channel list
//! sit behind short-lived std mutexes that are never held across an await.
//! Connect and reconnect are serialized by an async mutex.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::{ConnectionConfig, ConnectionState};
use crate::topology::Declaration;
use crate::transport::{self, BrokerChannel, BrokerConnection, Connector};
use crate::utils::error::redact_url;
use crate::utils::{EventError, Result, TransportError};

/// A channel together with the connection generation it was opened on.
#[derive(Clone)]
pub struct ChannelLease {
    pub channel: Arc<dyn BrokerChannel>,
    pub generation: u64,
}

impl std::fmt::Debug for ChannelLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelLease")
            .field("generation", &self.generation)
            .field("open", &self.channel.is_open())
            .finish()
    }
}

pub struct ConnectionManager {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    me: Weak<ConnectionManager>,
    state: watch::Sender<ConnectionState>,
    shutdown: watch::Sender<bool>,
    current: Mutex<Option<Arc<dyn BrokerConnection>>>,
    connect_lock: tokio::sync::Mutex<()>,
    topology: Mutex<Vec<Declaration>>,
    channels: Mutex<Vec<Weak<dyn BrokerChannel>>>,
    generation: AtomicU64,
    /// Failed reconnect attempts when the policy gave up; 0 otherwise.
    exhausted_after: AtomicU32,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig, connector: impl Connector) -> Arc<Self> {
        Self::with_connector(config, Arc::new(connector))
    }

    pub fn with_connector(config: ConnectionConfig, connector: Arc<dyn Connector>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            config,
            connector,
            me: me.clone(),
            state: watch::channel(ConnectionState::Disconnected).0,
            shutdown: watch::channel(false).0,
            current: Mutex::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
            topology: Mutex::new(Vec::new()),
            channels: Mutex::new(Vec::new()),
            generation: AtomicU64::new(0),
            exhausted_after: AtomicU32::new(0),
        })
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receives every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Incremented each time a connection is (re-)established.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Establishes the connection. Already connected is a no-op.
    pub async fn connect(&self) -> Result<()> {
        let _guard = self.connect_lock.lock().await;
        self.ensure_not_closed()?;
        if self.health_check() {
            return Ok(());
        }

        self.set_state(ConnectionState::Connecting);
        let attempts = self.config.connect_attempts.max(1);
        let url = redact_url(&self.config.url);

        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.establish().await {
                Ok(connection) => return self.install(connection).await,
                Err(e) => {
                    warn!(
                        url = %url,
                        attempt,
                        attempts,
                        error = %e,
                        "broker connect attempt failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        self.set_state(ConnectionState::Disconnected);
        Err(EventError::Connection {
            url,
            source: last_error.unwrap_or(TransportError::ConnectionClosed),
        })
    }

    /// A fresh channel on the current connection.
    pub async fn get_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        Ok(self.lease().await?.channel)
    }

    /// Like [`get_channel`](Self::get_channel), also reporting the connection
    /// generation so the holder can tell when it must re-acquire.
    pub async fn lease(&self) -> Result<ChannelLease> {
        let mut states = self.state.subscribe();
        loop {
            if *self.shutdown.borrow() {
                return Err(EventError::ConnectionClosed);
            }
            let state = *states.borrow_and_update();
            match state {
                ConnectionState::Connected => {
                    if let Some(lease) = self.try_open_channel().await? {
                        return Ok(lease);
                    }
                }
                ConnectionState::Connecting | ConnectionState::Reconnecting => {}
                ConnectionState::Disconnected => return Err(EventError::NotConnected),
                ConnectionState::Closed => return Err(self.closed_error()),
            }
            if states.changed().await.is_err() {
                return Err(EventError::ConnectionClosed);
            }
        }
    }

    /// True when a connection is established and open. Never mutates state.
    pub fn health_check(&self) -> bool {
        self.state().is_connected() && lock(&self.current).as_ref().is_some_and(|c| c.is_open())
    }

    /// Records declarations to replay after every reconnect. Duplicates are
    /// ignored.
    pub fn register_topology(&self, declarations: impl IntoIterator<Item = Declaration>) {
        let mut topology = lock(&self.topology);
        for declaration in declarations {
            if !topology.contains(&declaration) {
                topology.push(declaration);
            }
        }
    }

    pub fn topology(&self) -> Vec<Declaration> {
        lock(&self.topology).clone()
    }

    /// Closes all handed-out channels and then the connection. Later calls
    /// return immediately.
    pub async fn close(&self) -> Result<()> {
        if self.shutdown.send_replace(true) {
            return Ok(());
        }
        info!("closing broker connection");

        let channels: Vec<_> = lock(&self.channels)
            .drain(..)
            .filter_map(|weak| weak.upgrade())
            .collect();
        for channel in channels {
            if let Err(e) = channel.close().await {
                debug!(error = %e, "channel close failed");
            }
        }

        let connection = lock(&self.current).take();
        self.set_state(ConnectionState::Closed);
        if let Some(connection) = connection {
            connection.close().await?;
        }
        Ok(())
    }

    /// Resolves once `close()` has been called.
    pub async fn closing(&self) {
        wait_closing(self.shutdown.subscribe()).await;
    }

    pub fn is_closing(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn ensure_not_closed(&self) -> Result<()> {
        if self.is_closing() || self.state() == ConnectionState::Closed {
            return Err(self.closed_error());
        }
        Ok(())
    }

    fn closed_error(&self) -> EventError {
        match self.exhausted_after.load(Ordering::Acquire) {
            0 => EventError::ConnectionClosed,
            attempts => EventError::ReconnectionExhausted { attempts },
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = %previous, to = %next, "connection state changed");
        }
    }

    async fn try_open_channel(&self) -> Result<Option<ChannelLease>> {
        let connection = lock(&self.current).clone();
        let Some(connection) = connection else {
            return Ok(None);
        };
        let generation = self.generation();
        match connection.open_channel().await {
            Ok(channel) => {
                let mut channels = lock(&self.channels);
                channels.retain(|weak| weak.strong_count() > 0);
                channels.push(Arc::downgrade(&channel));
                Ok(Some(ChannelLease {
                    channel,
                    generation,
                }))
            }
            // the supervisor is about to move the state on
            Err(_) if !connection.is_open() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Connects and replays the registered topology on a scratch channel.
    async fn establish(&self) -> std::result::Result<Arc<dyn BrokerConnection>, TransportError> {
        let connection = self.connector.connect(&self.config).await?;
        let topology = self.topology();
        if topology.is_empty() {
            return Ok(connection);
        }

        let replay = async {
            let channel = connection.open_channel().await?;
            for declaration in &topology {
                transport::declare(channel.as_ref(), declaration).await?;
            }
            channel.close().await
        };
        if let Err(e) = replay.await {
            let _ = connection.close().await;
            return Err(e);
        }
        debug!(declarations = topology.len(), "topology replayed");
        Ok(connection)
    }

    async fn install(&self, connection: Arc<dyn BrokerConnection>) -> Result<()> {
        if self.is_closing() {
            let _ = connection.close().await;
            return Err(EventError::ConnectionClosed);
        }
        *lock(&self.current) = Some(Arc::clone(&connection));
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.exhausted_after.store(0, Ordering::Release);
        self.set_state(ConnectionState::Connected);
        info!(
            url = %redact_url(&self.config.url),
            generation,
            "connected to broker"
        );

        tokio::spawn(supervise(self.me.clone(), connection, generation));
        Ok(())
    }

    async fn reconnect(&self, lost_generation: u64) {
        let _guard = self.connect_lock.lock().await;
        if self.is_closing() || self.generation() != lost_generation {
            return;
        }
        lock(&self.current).take();
        lock(&self.channels).clear();

        let policy = &self.config.reconnect;
        if !policy.enabled {
            warn!("broker connection lost; reconnection disabled");
            self.set_state(ConnectionState::Disconnected);
            return;
        }
        warn!("broker connection lost; reconnecting");
        self.set_state(ConnectionState::Reconnecting);

        let mut attempt = 0;
        while policy.allows(attempt) {
            let delay = policy.delay_for(attempt);
            attempt += 1;
            info!(attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.closing() => return,
            }

            match self.establish().await {
                Ok(connection) => {
                    if self.install(connection).await.is_ok() {
                        info!(attempt, "reconnected to broker");
                    }
                    return;
                }
                Err(e) => warn!(attempt, error = %e, "reconnect attempt failed"),
            }
        }

        error!(attempts = attempt, "reconnection exhausted; giving up");
        self.exhausted_after.store(attempt.max(1), Ordering::Release);
        self.set_state(ConnectionState::Closed);
    }
}

/// Waits for `connection` to drop and hands control to the reconnect loop.
///
/// Boxed: the reconnect loop installs the next connection, which spawns the
/// next supervisor.
fn supervise(
    manager: Weak<ConnectionManager>,
    connection: Arc<dyn BrokerConnection>,
    generation: u64,
) -> BoxFuture<'static, ()> {
    async move {
        let Some(shutdown) = manager.upgrade().map(|m| m.shutdown.subscribe()) else {
            return;
        };
        tokio::select! {
            _ = connection.closed() => {}
            _ = wait_closing(shutdown) => return,
        }
        drop(connection);

        if let Some(manager) = manager.upgrade() {
            manager.reconnect(generation).await;
        }
    }
    .boxed()
}

async fn wait_closing(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|closing| *closing).await;
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("url", &redact_url(&self.config.url))
            .field("state", &self.state())
            .field("generation", &self.generation())
            .finish()
    }
}
