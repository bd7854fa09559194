//! Error types for the connection engine.
//!
//! Every failure surfaced to a caller is an explicit `Result` carrying a
//! human-readable diagnostic. Background tasks (receive loops, the reaper)
//! never return errors; they turn read and close failures into
//! disconnection events and log the rest.

use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Coarse classification of server failures.
///
/// Callers use this to decide whether a failure is fatal (`Setup`) or
/// whether the operation may simply be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Socket creation, bind or listen failed, or the listener is closed.
    Setup,
    /// Waiting for or accepting a connection failed. Retry is allowed.
    Accept,
    /// Writing to one connection failed. Other connections are unaffected.
    Send,
    /// No registered connection matches the requested address.
    Lookup,
}

/// Errors raised by a single [`Connection`](crate::Connection).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Connection is closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Write timeout")]
    WriteTimeout,

    #[error("Receive task already started")]
    AlreadyListening,
}

/// Errors raised by [`TcpServer`](crate::TcpServer) operations.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to setup listener at {address}: {error}")]
    Setup { address: SocketAddr, error: String },

    #[error("Server is already started")]
    AlreadyStarted,

    #[error("Listener is not open")]
    ListenerClosed,

    #[error("Timeout waiting for client ({secs}s)")]
    AcceptTimeout { secs: u32 },

    #[error("Failed to accept client: {0}")]
    Accept(String),

    #[error("Failed to send to {address}: {source}")]
    Send {
        address: String,
        #[source]
        source: ConnectionError,
    },

    #[error("Client not found: {address}")]
    ClientNotFound { address: String },

    #[error("Shutdown failed: {0}")]
    Shutdown(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ServerError {
    /// Classifies this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServerError::Setup { .. }
            | ServerError::AlreadyStarted
            | ServerError::ListenerClosed
            | ServerError::Shutdown(_)
            | ServerError::Config(_) => ErrorKind::Setup,
            ServerError::AcceptTimeout { .. } | ServerError::Accept(_) => ErrorKind::Accept,
            ServerError::Send { .. } => ErrorKind::Send,
            ServerError::ClientNotFound { .. } => ErrorKind::Lookup,
        }
    }
}

/// Errors raised by [`TcpClient`](crate::TcpClient) operations.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Failed to connect to {address}: {error}")]
    Connect { address: String, error: String },

    #[error("Timeout connecting to {address} ({secs}s)")]
    ConnectTimeout { address: String, secs: u32 },

    #[error("Client is not connected")]
    NotConnected,

    #[error("Client is already connected")]
    AlreadyConnected,

    #[error("Send failed: {0}")]
    Send(#[source] ConnectionError),

    #[error("Close failed: {0}")]
    Close(#[source] ConnectionError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {error}")]
    Read { path: PathBuf, error: String },

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}
