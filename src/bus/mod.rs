//! In-process message bus standing in for the platform transport.
//!
//! Delivery is fan-out: every subscriber sees every message, including the
//! emitter's own. Senders never block; a bus with no subscribers drops
//! messages silently.

mod message;

pub use message::{events, ForceClose, Message, OverrideDirective, PageInteraction, PageShown};

use tokio::sync::broadcast;
use tracing::debug;

/// Cloneable handle to the shared broadcast channel.
#[derive(Debug, Clone)]
pub struct MessageBus {
    tx: broadcast::Sender<Message>,
}

impl MessageBus {
    /// Create a bus retaining up to `capacity` undelivered messages per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish a message to all current subscribers.
    pub fn emit(&self, message: Message) {
        if let Err(dropped) = self.tx.send(message) {
            debug!(event = %dropped.0.event, "no bus subscribers, message dropped");
        }
    }

    /// Subscribe to all messages emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.tx.subscribe()
    }
}
