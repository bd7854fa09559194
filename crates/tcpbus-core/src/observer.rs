//! Observer registrations and event dispatch.
//!
//! An [`Observer`] pairs an address filter with two optional callbacks.
//! The [`ObserverBus`] owns the registrations and fans connection events
//! out to them in registration order.
//!
//! # Filter Semantics
//!
//! | Event          | No filter | Filter == address | Filter != address |
//! |----------------|-----------|-------------------|-------------------|
//! | message        | called    | called            | skipped           |
//! | disconnection  | skipped   | called            | skipped           |
//!
//! Catch-all observers see every message but are not told about every
//! disconnect; only observers that asked for a specific address are.
//!
//! Callbacks run on a connection's receive task. They must return quickly
//! and must not call back into [`TcpServer`](crate::TcpServer) operations
//! that take the connections lock.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Callback for incoming payloads: `(address, payload)`.
pub type MessageHandler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Callback for disconnections: `(address, reason)`.
pub type DisconnectionHandler = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// A registered interest in connection events.
#[derive(Clone, Default)]
pub struct Observer {
    /// Address filter (None = all addresses)
    filter: Option<String>,

    /// Called for each payload received from a matching connection
    on_message: Option<MessageHandler>,

    /// Called when a matching connection disconnects
    on_disconnect: Option<DisconnectionHandler>,
}

impl Observer {
    /// Creates an observer with no address filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an observer for a single remote address.
    ///
    /// An empty address is the same as no filter.
    pub fn for_address(address: impl Into<String>) -> Self {
        let address = address.into();
        Self {
            filter: (!address.is_empty()).then_some(address),
            ..Self::default()
        }
    }

    /// Sets the message callback.
    pub fn on_message<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str, &[u8]) + Send + Sync + 'static,
    {
        self.on_message = Some(Arc::new(handler));
        self
    }

    /// Sets the disconnection callback.
    pub fn on_disconnect<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        self.on_disconnect = Some(Arc::new(handler));
        self
    }

    /// Returns the address filter, if any.
    pub fn filter(&self) -> Option<&str> {
        self.filter.as_deref()
    }

    fn wants_message_from(&self, address: &str) -> bool {
        match &self.filter {
            Some(filter) => filter == address,
            None => true,
        }
    }

    fn wants_disconnection_of(&self, address: &str) -> bool {
        self.filter.as_deref() == Some(address)
    }
}

impl fmt::Debug for Observer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observer")
            .field("filter", &self.filter)
            .field("on_message", &self.on_message.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .finish()
    }
}

/// Registered observers, guarded by their own lock.
///
/// Registrations only grow; there is no unsubscribe.
#[derive(Debug, Default)]
pub struct ObserverBus {
    observers: Mutex<Vec<Observer>>,
}

impl ObserverBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an observer. Safe to call while events are being dispatched.
    pub fn subscribe(&self, observer: Observer) {
        self.lock().push(observer);
    }

    /// Number of registered observers.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivers a payload to every observer whose filter is empty or equals `address`.
    pub fn dispatch_message(&self, address: &str, payload: &[u8]) {
        let handlers: Vec<MessageHandler> = self
            .lock()
            .iter()
            .filter(|o| o.wants_message_from(address))
            .filter_map(|o| o.on_message.clone())
            .collect();

        for handler in handlers {
            handler(address, payload);
        }
    }

    /// Delivers a disconnection to every observer whose filter equals `address` exactly.
    pub fn dispatch_disconnection(&self, address: &str, reason: &str) {
        self.dispatch_disconnection_where(address, reason, |o| o.wants_disconnection_of(address));
    }

    /// Delivers a disconnection to every observer regardless of filter.
    ///
    /// Used by [`TcpClient`](crate::TcpClient), which only ever has one peer.
    pub fn dispatch_disconnection_to_all(&self, address: &str, reason: &str) {
        self.dispatch_disconnection_where(address, reason, |_| true);
    }

    fn dispatch_disconnection_where<P>(&self, address: &str, reason: &str, wanted: P)
    where
        P: Fn(&Observer) -> bool,
    {
        // Snapshot so callbacks run without the lock held
        let handlers: Vec<DisconnectionHandler> = self
            .lock()
            .iter()
            .filter(|o| wanted(o))
            .filter_map(|o| o.on_disconnect.clone())
            .collect();

        for handler in handlers {
            handler(address, reason);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Observer>> {
        self.observers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
