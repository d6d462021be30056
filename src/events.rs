//! Typed publish/subscribe used by every component to fan events out
//! to its consumers.
//!
//! Built on `tokio::sync::broadcast` so publishing is O(1) regardless
//! of subscriber count. Each [`Subscription`] is an independent handle;
//! dropping it unsubscribes, so listeners cannot leak across reconnect
//! cycles.

use tokio::sync::broadcast;

/// A per-component event bus.
///
/// `T` is the component's event type (`ConnectionEvent`, `ChatEvent`, …).
pub struct EventBus<T> {
    sender: broadcast::Sender<T>,
    capacity: usize,
}

impl<T: Clone> EventBus<T> {
    /// Create a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    /// Publish an event to all current subscribers.
    ///
    /// Returns the number of subscribers that received it. Publishing
    /// with no subscribers is not an error; the event is dropped.
    pub fn publish(&self, event: T) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Subscribe to this bus. Drop the handle to unsubscribe.
    pub fn subscribe(&self) -> Subscription<T> {
        Subscription {
            rx: self.sender.subscribe(),
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Per-subscriber buffer capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// A live subscription to an [`EventBus`].
pub struct Subscription<T> {
    rx: broadcast::Receiver<T>,
}

impl<T: Clone> Subscription<T> {
    /// Wait for the next event.
    ///
    /// Returns `None` when the bus has been dropped. A slow subscriber
    /// that falls more than the bus capacity behind skips the missed
    /// events and continues from the oldest retained one.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("event subscriber lagged, {n} events skipped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking poll for a pending event.
    pub fn try_recv(&mut self) -> Option<T> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    log::warn!("event subscriber lagged, {n} events skipped");
                    continue;
                }
                Err(_) => return None,
            }
        }
    }
}
