//! TCP connection registry.
//!
//! The server:
//! - Binds and listens on a TCP port (`start`)
//! - Accepts one connection per `accept_connection` call, optionally bounded
//! - Sends to one address or broadcasts to every registered connection
//! - Fans connection events out to observers through [`ObserverBus`]
//! - Evicts dead connections with a background reaper
//!
//! # Locking
//!
//! ```text
//! connections lock (tokio Mutex)          observers lock (std Mutex)
//! ├── accept: append                      ├── subscribe: append
//! ├── broadcast / send_to: iterate        └── dispatch: snapshot
//! ├── reaper: close + remove
//! └── shutdown: close all + clear
//! ```
//!
//! The two locks are never nested. The event handler only touches the
//! observers lock and an atomic live counter, so a receive task can always
//! finish while the reaper or `shutdown` holds the connections lock and
//! waits for it.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Per-connection failures are reported and never abort other connections

mod reaper;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::net::{TcpListener, TcpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionEvents, ConnectionInfo, ConnectionSettings};
use crate::error::ServerError;
use crate::observer::{Observer, ObserverBus};
use crate::wait::{self, WaitOutcome};

use self::reaper::{reap_dead, Reaper};

/// Registered connections in insertion order.
pub(crate) type ConnectionList = Arc<tokio::sync::Mutex<Vec<Arc<Connection>>>>;

/// An open listening socket.
struct ListenerHandle {
    listener: Arc<TcpListener>,
    local_addr: SocketAddr,

    /// Cancelled when the listener is closed; wakes pending accepts
    closed: CancellationToken,
}

/// Event handler injected into every accepted connection.
struct ServerEvents {
    observers: ObserverBus,
    live: AtomicUsize,
}

impl ConnectionEvents for ServerEvents {
    fn on_message(&self, connection: &Connection, payload: &[u8]) {
        self.observers.dispatch_message(connection.address(), payload);
    }

    fn on_disconnect(&self, connection: &Connection, reason: &str) {
        // Counted down first so observers already see the new live count.
        // Saturating: never wraps below zero.
        let _ = self
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        self.observers.dispatch_disconnection(connection.address(), reason);
    }
}

/// TCP server owning every live inbound connection on one listening port.
pub struct TcpServer {
    config: ServerConfig,

    listener: Mutex<Option<ListenerHandle>>,

    connections: ConnectionList,

    events: Arc<ServerEvents>,

    reaper: Mutex<Option<Reaper>>,
}

impl Default for TcpServer {
    fn default() -> Self {
        Self::new(ServerConfig::default())
    }
}

impl TcpServer {
    /// Creates a stopped server. Nothing is bound until [`start`](Self::start).
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            listener: Mutex::new(None),
            connections: Arc::new(tokio::sync::Mutex::new(Vec::new())),
            events: Arc::new(ServerEvents {
                observers: ObserverBus::new(),
                live: AtomicUsize::new(0),
            }),
            reaper: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Creates the listening socket and, if `auto_reap`, starts the reaper.
    ///
    /// The socket binds to `config.bind_address:port` with address reuse
    /// enabled. Port 0 picks a free port; see [`local_addr`](Self::local_addr).
    ///
    /// # Errors
    ///
    /// - `ServerError::Config` if the server was built with an unusable config
    /// - `ServerError::AlreadyStarted` if the listener is already open
    /// - `ServerError::Setup` if socket creation, bind or listen fails
    pub async fn start(&self, port: u16, backlog: u32, auto_reap: bool) -> Result<(), ServerError> {
        self.config.validate()?;

        if lock(&self.listener).is_some() {
            return Err(ServerError::AlreadyStarted);
        }

        let address = SocketAddr::new(self.config.bind_address, port);
        let listener = bind_listener(address, backlog)?;
        let local_addr = listener.local_addr().map_err(|e| ServerError::Setup {
            address,
            error: e.to_string(),
        })?;

        {
            let mut slot = lock(&self.listener);
            if slot.is_some() {
                return Err(ServerError::AlreadyStarted);
            }
            *slot = Some(ListenerHandle {
                listener: Arc::new(listener),
                local_addr,
                closed: CancellationToken::new(),
            });
        }

        if auto_reap {
            let reaper = Reaper::spawn(Arc::clone(&self.connections), self.config.reap_interval());
            if let Some(previous) = lock(&self.reaper).replace(reaper) {
                previous.cancel();
            }
        }

        info!(address = %local_addr, backlog, auto_reap, "Server listening");
        Ok(())
    }

    /// Accepts one connection and registers it.
    ///
    /// With `timeout_secs > 0` the wait for a peer is bounded; zero blocks
    /// until a peer arrives or the listener is closed. Call repeatedly to
    /// accept many connections.
    ///
    /// # Errors
    ///
    /// - `ServerError::ListenerClosed` before `start` or after `shutdown`
    /// - `ServerError::AcceptTimeout` if no peer arrived in time
    /// - `ServerError::Accept` if the accept itself failed
    pub async fn accept_connection(&self, timeout_secs: u32) -> Result<Arc<Connection>, ServerError> {
        let (listener, closed) = {
            let slot = lock(&self.listener);
            let handle = slot.as_ref().ok_or(ServerError::ListenerClosed)?;
            (Arc::clone(&handle.listener), handle.closed.clone())
        };

        let outcome = tokio::select! {
            _ = closed.cancelled() => return Err(ServerError::ListenerClosed),
            outcome = wait::bounded(timeout_secs, listener.accept()) => outcome,
        };
        drop(listener);

        let stream = match outcome {
            WaitOutcome::Ready((stream, _)) => stream,
            WaitOutcome::Timeout => {
                return Err(ServerError::AcceptTimeout { secs: timeout_secs });
            }
            WaitOutcome::Failure(e) => return Err(ServerError::Accept(e.to_string())),
        };

        let events: Arc<dyn ConnectionEvents> = self.events.clone();
        let connection = Connection::open(stream, events, ConnectionSettings::from(&self.config))
            .map_err(|e| ServerError::Accept(e.to_string()))?;

        let mut connections = self.connections.lock().await;

        // Shutdown may have cleared the registry while we were accepting
        if closed.is_cancelled() {
            drop(connections);
            // Counted so that its disconnection event balances out
            self.events.live.fetch_add(1, Ordering::AcqRel);
            let _ = connection.close().await;
            return Err(ServerError::ListenerClosed);
        }

        connections.push(Arc::clone(&connection));
        self.events.live.fetch_add(1, Ordering::AcqRel);

        if let Err(e) = connection.start_listen() {
            connections.pop();
            drop(connections);
            let _ = connection.close().await;
            return Err(ServerError::Accept(e.to_string()));
        }

        info!(
            peer = %connection.peer(),
            registered = connections.len(),
            "Accepted connection"
        );
        Ok(connection)
    }

    /// Sends `payload` to every registered connection in insertion order.
    ///
    /// Stops at the first failure and returns it. Connections before the
    /// failing one have already received the payload.
    pub async fn broadcast(&self, payload: &[u8]) -> Result<(), ServerError> {
        let connections = self.connections.lock().await;

        for connection in connections.iter() {
            Self::send_to_connection(connection, payload).await?;
        }

        debug!(recipients = connections.len(), bytes = payload.len(), "Broadcast sent");
        Ok(())
    }

    /// Sends `payload` to the first registered connection whose address is `address`.
    ///
    /// # Errors
    ///
    /// - `ServerError::ClientNotFound` if no connection has that address
    /// - `ServerError::Send` if the write fails
    pub async fn send_to(&self, address: &str, payload: &[u8]) -> Result<(), ServerError> {
        let connections = self.connections.lock().await;

        let connection = connections
            .iter()
            .find(|c| c.address() == address)
            .ok_or_else(|| ServerError::ClientNotFound {
                address: address.to_string(),
            })?;

        Self::send_to_connection(connection, payload).await
    }

    /// Sends `payload` to one connection, wrapping failures with its address.
    pub async fn send_to_connection(connection: &Connection, payload: &[u8]) -> Result<(), ServerError> {
        connection
            .send(payload)
            .await
            .map_err(|source| ServerError::Send {
                address: connection.address().to_string(),
                source,
            })
    }

    /// Registers an observer. Takes effect for events raised after this call.
    pub fn subscribe(&self, observer: Observer) {
        debug!(filter = ?observer.filter(), "Observer subscribed");
        self.events.observers.subscribe(observer);
    }

    /// Stops the reaper, closes every connection, then closes the listener.
    ///
    /// Every step runs even if an earlier one failed; the first error is
    /// returned. Calling it again is a no-op.
    pub async fn shutdown(&self) -> Result<(), ServerError> {
        let mut first_error: Option<ServerError> = None;

        // Refuse new registrations before touching the registry
        let listener = lock(&self.listener).take();
        if let Some(handle) = &listener {
            handle.closed.cancel();
        }

        let reaper = lock(&self.reaper).take();
        if let Some(reaper) = reaper {
            if let Err(e) = reaper.stop().await {
                warn!(error = %e, "Reaper ended abnormally");
                first_error.get_or_insert(ServerError::Shutdown(format!("reaper: {e}")));
            }
        }

        {
            let mut connections = self.connections.lock().await;
            for connection in connections.iter() {
                if let Err(e) = connection.close().await {
                    warn!(peer = %connection.peer(), error = %e, "Failed to close connection");
                    first_error.get_or_insert(ServerError::Shutdown(format!(
                        "{}: {e}",
                        connection.peer()
                    )));
                }
            }
            connections.clear();
        }

        if let Some(handle) = listener {
            info!(address = %handle.local_addr, "Server listener closed");
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Address the listener is bound to, if started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.listener).as_ref().map(|h| h.local_addr)
    }

    pub fn is_listening(&self) -> bool {
        lock(&self.listener).is_some()
    }

    /// Connections accepted and not yet reported disconnected.
    pub fn live_count(&self) -> usize {
        self.events.live.load(Ordering::Acquire)
    }

    /// Connections currently in the registry, including dead ones not yet reaped.
    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// Snapshot of the registry in insertion order.
    pub async fn connections(&self) -> Vec<ConnectionInfo> {
        self.connections
            .lock()
            .await
            .iter()
            .map(|c| c.info())
            .collect()
    }

    /// Evicts dead connections now instead of waiting for the reaper.
    pub async fn reap(&self) -> usize {
        reap_dead(&self.connections).await
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.listener).take() {
            handle.closed.cancel();
        }
        if let Some(reaper) = lock(&self.reaper).take() {
            reaper.cancel();
        }
    }
}

fn bind_listener(address: SocketAddr, backlog: u32) -> Result<TcpListener, ServerError> {
    let setup = |e: std::io::Error| ServerError::Setup {
        address,
        error: e.to_string(),
    };

    let socket = if address.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(setup)?;

    socket.set_reuseaddr(true).map_err(setup)?;
    socket.bind(address).map_err(setup)?;
    socket.listen(backlog).map_err(setup)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
