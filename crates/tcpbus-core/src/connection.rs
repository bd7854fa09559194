//! A single TCP stream and its dedicated receive task.
//!
//! Each `Connection`:
//! - Owns its socket exclusively (split into read and write halves)
//! - Runs exactly one receive task once [`Connection::start_listen`] is called
//! - Reports every successful read and its own disconnection through
//!   [`ConnectionEvents`]
//!
//! # Lifecycle
//!
//! ```text
//! CREATED ──start_listen()──▶ LISTENING ──EOF / read error / close()──▶ DISCONNECTED
//!    │                                                                      ▲
//!    └─────────────────────────────close()──────────────────────────────────┘
//! ```
//!
//! DISCONNECTED is terminal. The disconnection event fires exactly once, from
//! whichever path gets there first.
//!
//! # Wire Format
//!
//! None. Each successful read is delivered as one payload, so payload
//! boundaries follow the transport's packetization.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{
    ClientConfig, ServerConfig, DEFAULT_READ_BUFFER_SIZE, DEFAULT_WRITE_TIMEOUT_MS,
};
use crate::error::ConnectionError;

/// Disconnection reason when the peer performs an orderly shutdown.
pub const REASON_PEER_CLOSED: &str = "Client closed connection";

/// Disconnection reason when [`Connection::close`] ends the connection.
pub const REASON_CLOSED_LOCALLY: &str = "Connection closed locally";

/// Disconnection reason when the receive task stops without reaching a verdict.
pub const REASON_TASK_ABORTED: &str = "Receive task terminated unexpectedly";

const STATE_CREATED: u8 = 0;
const STATE_LISTENING: u8 = 1;
const STATE_DISCONNECTED: u8 = 2;

/// Observable lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Created,
    Listening,
    Disconnected,
}

/// Capability injected into every connection to receive its events.
///
/// Implementations run on the connection's receive task and must return
/// quickly.
pub trait ConnectionEvents: Send + Sync {
    /// A read returned `payload` (never empty).
    fn on_message(&self, connection: &Connection, payload: &[u8]);

    /// The connection went down. Called exactly once per connection.
    fn on_disconnect(&self, connection: &Connection, reason: &str);
}

/// I/O settings applied to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// Upper bound on a single send
    pub write_timeout: Duration,

    /// Maximum bytes delivered per read
    pub read_buffer_size: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_millis(DEFAULT_WRITE_TIMEOUT_MS),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

impl From<&ServerConfig> for ConnectionSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            write_timeout: config.write_timeout(),
            read_buffer_size: config.read_buffer_size,
        }
    }
}

impl From<&ClientConfig> for ConnectionSettings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            write_timeout: config.write_timeout(),
            read_buffer_size: config.read_buffer_size,
        }
    }
}

/// Point-in-time description of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub address: String,
    pub peer: SocketAddr,
    pub state: ConnectionState,
    pub connected_at: DateTime<Utc>,
}

/// One established TCP stream.
pub struct Connection {
    /// Remote IP address, used for lookups and observer filters
    address: String,

    /// Full remote socket address
    peer: SocketAddr,

    connected_at: DateTime<Utc>,

    /// One of the `STATE_*` constants
    state: AtomicU8,

    /// Read half, moved into the receive task by `start_listen`
    reader: Mutex<Option<OwnedReadHalf>>,

    /// Write half, taken by `close`
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,

    /// Handle of the receive task; only `close` joins it
    receive_task: Mutex<Option<JoinHandle<()>>>,

    /// Stops the receive task
    cancel: CancellationToken,

    /// Serializes `close` so every caller returns after the join
    closing: tokio::sync::Mutex<()>,

    events: Arc<dyn ConnectionEvents>,

    settings: ConnectionSettings,
}

impl Connection {
    /// Wraps an established stream.
    ///
    /// The event sink is attached here, before any receive task can run.
    /// Fails only if the peer address cannot be read (the peer already reset).
    pub fn open(
        stream: TcpStream,
        events: Arc<dyn ConnectionEvents>,
        settings: ConnectionSettings,
    ) -> std::io::Result<Arc<Self>> {
        let peer = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();

        Ok(Arc::new(Self {
            address: address_of(&peer),
            peer,
            connected_at: Utc::now(),
            state: AtomicU8::new(STATE_CREATED),
            reader: Mutex::new(Some(reader)),
            writer: tokio::sync::Mutex::new(Some(writer)),
            receive_task: Mutex::new(None),
            cancel: CancellationToken::new(),
            closing: tokio::sync::Mutex::new(()),
            events,
            settings,
        }))
    }

    /// Remote IP address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Remote socket address.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// False once the connection has reached DISCONNECTED; never true again.
    pub fn is_connected(&self) -> bool {
        self.state.load(Ordering::Acquire) != STATE_DISCONNECTED
    }

    pub fn state(&self) -> ConnectionState {
        match self.state.load(Ordering::Acquire) {
            STATE_CREATED => ConnectionState::Created,
            STATE_LISTENING => ConnectionState::Listening,
            _ => ConnectionState::Disconnected,
        }
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            address: self.address.clone(),
            peer: self.peer,
            state: self.state(),
            connected_at: self.connected_at,
        }
    }

    /// Spawns the receive task and returns immediately.
    ///
    /// # Errors
    ///
    /// - `ConnectionError::AlreadyListening` on a second call
    /// - `ConnectionError::Closed` if the connection is already down
    pub fn start_listen(self: &Arc<Self>) -> Result<(), ConnectionError> {
        let mut task = lock(&self.receive_task);

        // close() already ran or is running; it will not see a new task
        if self.cancel.is_cancelled() {
            return Err(ConnectionError::Closed);
        }

        if let Err(current) = self.state.compare_exchange(
            STATE_CREATED,
            STATE_LISTENING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            return Err(if current == STATE_LISTENING {
                ConnectionError::AlreadyListening
            } else {
                ConnectionError::Closed
            });
        }

        let reader = lock(&self.reader).take().ok_or(ConnectionError::Closed)?;
        let connection = Arc::clone(self);
        *task = Some(tokio::spawn(connection.receive_loop(reader)));

        debug!(peer = %self.peer, "Receive task started");
        Ok(())
    }

    /// Writes the whole payload.
    ///
    /// A failed write does not mark the connection disconnected; only the
    /// receive task decides liveness.
    pub async fn send(&self, payload: &[u8]) -> Result<(), ConnectionError> {
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(ConnectionError::Closed)?;

        match timeout(self.settings.write_timeout, async {
            writer.write_all(payload).await?;
            writer.flush().await
        })
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ConnectionError::Io(e.to_string())),
            Err(_) => Err(ConnectionError::WriteTimeout),
        }
    }

    /// Shuts the socket down, stops and joins the receive task.
    ///
    /// Idempotent. Concurrent callers all return after the receive task
    /// has finished. Must not be called from this connection's own event
    /// callbacks, since it waits for the receive task to finish.
    pub async fn close(&self) -> Result<(), ConnectionError> {
        self.cancel.cancel();
        let _closing = self.closing.lock().await;

        let shutdown = match self.writer.lock().await.take() {
            Some(mut writer) => writer.shutdown().await,
            None => Ok(()),
        };

        let handle = lock(&self.receive_task).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(peer = %self.peer, error = %e, "Receive task ended abnormally");
            }
        }

        // Never listened: release the read half here
        drop(lock(&self.reader).take());

        self.mark_disconnected(REASON_CLOSED_LOCALLY);

        match shutdown {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(ConnectionError::Io(e.to_string())),
        }
    }

    async fn receive_loop(self: Arc<Self>, mut reader: OwnedReadHalf) {
        let mut guard = DisconnectGuard {
            connection: Arc::clone(&self),
            reason: REASON_TASK_ABORTED.to_string(),
        };
        let mut buf = vec![0u8; self.settings.read_buffer_size.max(1)];

        guard.reason = loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    break REASON_CLOSED_LOCALLY.to_string();
                }

                result = reader.read(&mut buf) => match result {
                    Ok(0) => break REASON_PEER_CLOSED.to_string(),
                    Ok(n) => {
                        debug!(peer = %self.peer, bytes = n, "Received payload");
                        self.events.on_message(&self, &buf[..n]);
                    }
                    Err(e) => break e.to_string(),
                },
            }
        };
    }

    /// Moves to DISCONNECTED and raises the event if this call made the transition.
    fn mark_disconnected(&self, reason: &str) {
        if self.state.swap(STATE_DISCONNECTED, Ordering::AcqRel) == STATE_DISCONNECTED {
            return;
        }

        info!(peer = %self.peer, reason, "Connection disconnected");
        self.events.on_disconnect(self, reason);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}

/// Marks the connection disconnected when the receive task ends, including
/// by panic or abort.
struct DisconnectGuard {
    connection: Arc<Connection>,
    reason: String,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        self.connection.mark_disconnected(&self.reason);
    }
}

/// Remote IP as used for lookups. IPv4-mapped IPv6 peers map to plain IPv4.
fn address_of(peer: &SocketAddr) -> String {
    peer.ip().to_canonical().to_string()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
