//! Lifecycle events and the subscriber list they are delivered to

use singularity_shared::PeerHandle;
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;

/// Events emitted by the connection manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Transport opened; `peer` identifies the new connection
    Connected { peer: PeerHandle },
    /// One decoded message from the peer
    MessageReceived(String),
    /// Any failure: connect, send, or connection loss
    Error(String),
}

/// Receiving end handed to each subscriber
pub type EventReceiver = mpsc::UnboundedReceiver<ConnectionEvent>;

/// Fan-out of events to every live subscriber, in emission order
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ConnectionEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber. It sees events emitted from now on.
    pub fn subscribe(&self) -> EventReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Deliver an event to all subscribers, dropping those that went away
    pub fn emit(&self, event: ConnectionEvent) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Number of subscribers still registered
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
