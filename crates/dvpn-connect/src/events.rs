//! Event stream relayed to the facade

use crate::error::ConnectionError;
use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::trace;

/// Info message sent once subscriptions were cancelled
pub const SUBSCRIPTION_CANCELED: &str = "subscription_canceled";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A request was accepted and is being worked on. Resolved by the next
    /// [`ConnectionEvent::TunnelActivityChanged`].
    Loading,
    Error(ConnectionError),
    /// Something looks off but the flow carries on
    Warning(ConnectionError),
    Info(String),
    /// Current tunnel activity; also ends any loading state
    TunnelActivityChanged { is_active: bool },
}

/// Sending half; dropped events are fine once nobody listens
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Sender<ConnectionEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, Receiver<ConnectionEvent>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }

    pub fn send(&self, event: ConnectionEvent) {
        trace!("Event: {:?}", event);
        let _ = self.tx.send(event);
    }
}
