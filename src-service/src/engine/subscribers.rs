//! Fan-out of streaming engine output to registered subscribers.
//!
//! Every subscriber gets its own bounded queue. Publishing never waits: a
//! subscriber whose queue is full loses that line, the others are unaffected.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;

pub type SubscriptionId = u64;

/// Receiving end handed to a subscriber.
pub struct Subscription {
    pub id: SubscriptionId,
    pub receiver: mpsc::Receiver<String>,
}

#[derive(Default)]
struct Registry {
    senders: Vec<(SubscriptionId, mpsc::Sender<String>)>,
    closed: bool,
}

#[derive(Default)]
pub struct Subscribers {
    next_id: AtomicU64,
    registry: Mutex<Registry>,
}

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber with a queue of `capacity` lines.
    ///
    /// After [`close`](Self::close) the returned receiver is already finished.
    pub fn subscribe(&self, capacity: usize) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let mut registry = self.lock();
        if !registry.closed {
            registry.senders.push((id, tx));
        }
        Subscription { id, receiver: rx }
    }

    /// Stop delivering to `id`. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut registry = self.lock();
        let before = registry.senders.len();
        registry.senders.retain(|(sid, _)| *sid != id);
        registry.senders.len() != before
    }

    /// Deliver `line` to every subscriber in registration order.
    ///
    /// Returns how many subscribers accepted it.
    pub fn publish(&self, line: &str) -> usize {
        let mut registry = self.lock();
        let mut delivered = 0;
        registry.senders.retain(|(id, tx)| match tx.try_send(line.to_string()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!("[Subscribers] Queue full for subscriber {}, dropping hypothesis", id);
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
        delivered
    }

    /// Drop every sender so subscribers observe end of stream.
    pub fn close(&self) {
        let mut registry = self.lock();
        registry.closed = true;
        registry.senders.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn slow_subscriber_does_not_starve_others() {
        let subscribers = Subscribers::new();
        let mut slow = subscribers.subscribe(1);
        let mut fast = subscribers.subscribe(8);

        for i in 0..4 {
            subscribers.publish(&format!("line {}", i));
        }

        assert_eq!(slow.receiver.recv().await.as_deref(), Some("line 0"));
        assert!(slow.receiver.try_recv().is_err());
        for i in 0..4 {
            assert_eq!(fast.receiver.recv().await, Some(format!("line {}", i)));
        }
    }

    #[tokio::test]
    async fn unsubscribed_receiver_sees_end_of_stream() {
        let subscribers = Subscribers::new();
        let mut sub = subscribers.subscribe(4);
        assert!(subscribers.unsubscribe(sub.id));
        assert!(!subscribers.unsubscribe(sub.id));
        assert_eq!(subscribers.publish("ignored"), 0);
        assert_eq!(sub.receiver.recv().await, None);
    }

    #[tokio::test]
    async fn dropped_receivers_are_pruned() {
        let subscribers = Subscribers::new();
        let sub = subscribers.subscribe(4);
        drop(sub);
        assert_eq!(subscribers.publish("x"), 0);
        assert!(subscribers.is_empty());
    }

    #[tokio::test]
    async fn close_finishes_current_and_future_subscribers() {
        let subscribers = Subscribers::new();
        let mut before = subscribers.subscribe(4);
        subscribers.close();
        let mut after = subscribers.subscribe(4);
        assert_eq!(before.receiver.recv().await, None);
        assert_eq!(after.receiver.recv().await, None);
    }
}
