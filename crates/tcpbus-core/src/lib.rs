//! tcpbus core - TCP connection registry with observer dispatch
//!
//! This crate provides the connection engine behind the `tcpbus` server and client:
//! - `server` - Connection registry: listener setup, accept, send/broadcast, shutdown
//! - `server::reaper` - Background eviction of dead connections
//! - `connection` - One TCP stream plus its dedicated receive task
//! - `observer` - Observer registrations and event dispatch
//! - `client` - Single outbound connection with the same event model
//! - `wait` - Bounded waits in front of blocking operations
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        TcpServer                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐   │
//! │  │  TcpListener    │────▶│  Mutex<Vec<Arc<Connection>>>│   │
//! │  │ (accept + wait) │     │  (connection registry)      │   │
//! │  └─────────────────┘     └──────────────┬──────────────┘   │
//! │                                         │                   │
//! │           ┌─────────────────────────────┤                   │
//! │           │ receive task                │ reaper (interval) │
//! │           ▼ (per connection)            ▼                   │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐   │
//! │  │  ServerEvents   │────▶│      ObserverBus            │   │
//! │  │ (event handler) │     │  (filter + callbacks)       │   │
//! │  └─────────────────┘     └─────────────────────────────┘   │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate is panic-free:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Poisoned locks are recovered instead of propagated

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod observer;
pub mod server;
pub mod wait;

pub use client::TcpClient;
pub use config::{ClientConfig, ServerConfig};
pub use connection::{
    Connection, ConnectionEvents, ConnectionInfo, ConnectionSettings, ConnectionState,
};
pub use error::{ClientError, ConfigError, ConnectionError, ErrorKind, ServerError};
pub use observer::{Observer, ObserverBus};
pub use server::TcpServer;
pub use wait::WaitOutcome;
