//! Decoupled event bus for lifecycle and delivery notices.
//!
//! The broker and worker emit through [`EventBus::emit`]; the REPL and
//! tests subscribe via [`EventBus::subscribe`]. Built on
//! [`tokio::sync::broadcast`] so every listener sees every event.

use tokio::sync::broadcast;

/// Events that flow through the system.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// The broker's reply listener is subscribed and routing replies.
    ListenerReady { topic: String },
    /// The reply subscription broke. Every waiter live at that moment was
    /// failed; the listener is resubscribing.
    ListenerLost {
        reason: String,
        failed_waiters: usize,
    },
    /// A worker started consuming requests.
    WorkerStarted { topic: String, group: String },
    /// A reply could not be appended after every retry and was dropped.
    DeliveryLost {
        correlation_id: String,
        topic: String,
        error: String,
    },
}

/// A broadcast channel that any component can emit to or subscribe from.
#[derive(Debug)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Emit an event to all current subscribers.
    /// Returns the number of receivers that will see it.
    pub fn emit(&self, event: Event) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// Future events only; nothing is replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}
