//! Client side of the connection engine.
//!
//! A `TcpClient` holds at most one outbound [`Connection`] and reuses the
//! server's event model: payloads and the disconnection are dispatched to
//! subscribed observers from the connection's receive task.
//!
//! Unlike the server, a client delivers its disconnection to every
//! observer regardless of filter, since there is only one peer.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionEvents, ConnectionSettings};
use crate::error::ClientError;
use crate::observer::{Observer, ObserverBus};
use crate::wait::{self, WaitOutcome};

struct ClientEvents {
    observers: ObserverBus,
}

impl ConnectionEvents for ClientEvents {
    fn on_message(&self, connection: &Connection, payload: &[u8]) {
        self.observers.dispatch_message(connection.address(), payload);
    }

    fn on_disconnect(&self, connection: &Connection, reason: &str) {
        self.observers
            .dispatch_disconnection_to_all(connection.address(), reason);
    }
}

/// Single outbound TCP connection with observer dispatch.
pub struct TcpClient {
    config: ClientConfig,

    /// Current connection (None = never connected or closed)
    connection: Mutex<Option<Arc<Connection>>>,

    events: Arc<ClientEvents>,
}

impl Default for TcpClient {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

impl TcpClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            connection: Mutex::new(None),
            events: Arc::new(ClientEvents {
                observers: ObserverBus::new(),
            }),
        }
    }

    /// Connects to `ip:port` and starts receiving.
    ///
    /// A client whose previous connection went down may connect again.
    ///
    /// # Errors
    ///
    /// - `ClientError::Config` if the client was built with an unusable config
    /// - `ClientError::AlreadyConnected` if the current connection is alive
    /// - `ClientError::ConnectTimeout` if `connect_timeout_secs` elapsed
    /// - `ClientError::Connect` if the connect failed
    pub async fn connect_to(&self, ip: &str, port: u16) -> Result<(), ClientError> {
        self.config.validate()?;

        if self.is_connected() {
            return Err(ClientError::AlreadyConnected);
        }

        let address = format!("{ip}:{port}");
        let secs = self.config.connect_timeout_secs;

        let stream = match wait::bounded(secs, TcpStream::connect((ip, port))).await {
            WaitOutcome::Ready(stream) => stream,
            WaitOutcome::Timeout => return Err(ClientError::ConnectTimeout { address, secs }),
            WaitOutcome::Failure(e) => {
                return Err(ClientError::Connect {
                    address,
                    error: e.to_string(),
                })
            }
        };

        let events: Arc<dyn ConnectionEvents> = self.events.clone();
        let connection = Connection::open(stream, events, ConnectionSettings::from(&self.config))
            .map_err(|e| ClientError::Connect {
                address: address.clone(),
                error: e.to_string(),
            })?;

        let previous = {
            let mut slot = lock(&self.connection);
            if slot.as_ref().is_some_and(|c| c.is_connected()) {
                None
            } else {
                Some(slot.replace(Arc::clone(&connection)))
            }
        };

        let Some(previous) = previous else {
            // Lost a race with a concurrent connect
            let _ = connection.close().await;
            return Err(ClientError::AlreadyConnected);
        };

        if let Some(stale) = previous {
            let _ = stale.close().await;
        }

        connection.start_listen().map_err(|e| ClientError::Connect {
            address: address.clone(),
            error: e.to_string(),
        })?;

        info!(server = %address, "Connected");
        Ok(())
    }

    /// Writes `payload` to the server.
    pub async fn send_msg(&self, payload: &[u8]) -> Result<(), ClientError> {
        let connection = lock(&self.connection)
            .clone()
            .ok_or(ClientError::NotConnected)?;

        connection.send(payload).await.map_err(ClientError::Send)
    }

    /// Closes the connection, if any. Safe to call repeatedly.
    pub async fn close(&self) -> Result<(), ClientError> {
        let connection = lock(&self.connection).take();

        match connection {
            Some(connection) => {
                debug!(server = %connection.peer(), "Closing client connection");
                connection.close().await.map_err(ClientError::Close)
            }
            None => Ok(()),
        }
    }

    /// Registers an observer for payloads and the disconnection.
    pub fn subscribe(&self, observer: Observer) {
        self.events.observers.subscribe(observer);
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.connection)
            .as_ref()
            .is_some_and(|c| c.is_connected())
    }

    /// Server address of the current connection.
    pub fn peer(&self) -> Option<SocketAddr> {
        lock(&self.connection).as_ref().map(|c| c.peer())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
