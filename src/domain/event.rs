//! Event Broker
//!
//! Multi-producer/multi-subscriber fan-out used by the task store to
//! publish typed change events. Each subscriber receives its own queue;
//! late subscribers do not receive events published before they joined.

use std::sync::Mutex;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// The kind of change an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
}

/// A typed change event carrying its payload.
#[derive(Debug, Clone)]
pub struct Event<T> {
    pub kind: EventKind,
    pub payload: T,
}

impl<T> Event<T> {
    pub fn new(kind: EventKind, payload: T) -> Self {
        Self { kind, payload }
    }
}

/// Fans events out to any number of subscribers.
///
/// Subscriber queues are unbounded; consumers are expected to drain
/// promptly. Dropped receivers are pruned on the next publish.
pub struct Broker<T> {
    subscribers: Mutex<Vec<UnboundedSender<T>>>,
}

impl<T: Clone> Broker<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Register a new subscriber and return its receiving end.
    pub fn subscribe(&self) -> UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().expect("broker lock poisoned").push(tx);
        rx
    }

    /// Deliver `event` to every live subscriber.
    pub fn publish(&self, event: T) {
        let mut subscribers = self.subscribers.lock().expect("broker lock poisoned");
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("broker lock poisoned").len()
    }

    /// Close every subscription channel.
    pub fn shutdown(&self) {
        self.subscribers.lock().expect("broker lock poisoned").clear();
    }
}

impl<T: Clone> Default for Broker<T> {
    fn default() -> Self {
        Self::new()
    }
}
