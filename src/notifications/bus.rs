//! # Broadcast bus for lifecycle notifications.
//!
//! [`Bus`] is a thin wrapper around [`tokio::sync::broadcast`] that provides
//! non-blocking publishing from multiple producers (the input queue, state
//! holder, event dispatcher, side-job supervisor, coordinator).
//!
//! ## Architecture
//! ```text
//! Producers (many):                      Consumers (independent):
//!   Input queue  ──┐
//!   State holder ──┼────► Bus ──────► interceptor fan-out listener
//!   Dispatcher   ──┤  (broadcast)  └─► raw subscribers (tests, tooling)
//!   Side jobs    ──┘
//! ```
//!
//! ## Rules
//! - **Non-blocking publish**: `publish()` never blocks or awaits; delivery
//!   to consumers never gates a producer's own progress.
//! - **Bounded capacity**: a single ring buffer stores recent notifications.
//! - **Lag handling**: slow receivers get `RecvError::Lagged(n)` and skip
//!   the `n` oldest items.
//! - **No persistence**: notifications are lost if nobody is subscribed at
//!   publish time.

use tokio::sync::broadcast;

use super::notification::Notification;
use crate::machine::Machine;

/// Broadcast channel for lifecycle notifications.
///
/// Cheap to clone (internally holds an `Arc`-backed sender); every actor in
/// the container carries its own clone.
pub struct Bus<M: Machine> {
    tx: broadcast::Sender<Notification<M>>,
}

impl<M: Machine> Bus<M> {
    /// Creates a new bus with the given channel capacity.
    ///
    /// Capacity is shared across all receivers; the minimum is 1 (clamped).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _rx) = broadcast::channel::<Notification<M>>(capacity);
        Self { tx }
    }

    /// Publishes a notification to all active subscribers.
    ///
    /// If there are no receivers, the notification is dropped; this function
    /// still returns immediately.
    pub fn publish(&self, note: Notification<M>) {
        let _ = self.tx.send(note);
    }

    /// Creates a new receiver that observes subsequent notifications.
    ///
    /// Each call creates an independent receiver; a receiver only gets
    /// notifications sent after it subscribed.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification<M>> {
        self.tx.subscribe()
    }
}

impl<M: Machine> Clone for Bus<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::NotificationKind;

    struct TestMachine;

    impl Machine for TestMachine {
        type Input = u32;
        type Event = u32;
        type State = u32;
    }

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let bus: Bus<TestMachine> = Bus::new(8);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(Notification::now(NotificationKind::InputQueued).with_item(1));

        let a = rx1.recv().await.unwrap();
        let b = rx2.recv().await.unwrap();
        assert_eq!(a.item, Some(1));
        assert_eq!(b.item, Some(1));
        assert_eq!(a.seq, b.seq);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_does_not_block() {
        let bus: Bus<TestMachine> = Bus::new(1);
        // No receivers; both publishes must return immediately.
        bus.publish(Notification::now(NotificationKind::InputQueued));
        bus.publish(Notification::now(NotificationKind::InputHandled));
    }
}
