// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// What happened to the published payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
    Notification,
}

/// A single pub/sub event.  The payload is cloned per subscriber before
/// dispatch so no subscriber can observe another's mutations.
#[derive(Debug, Clone)]
pub struct Event<T: Clone> {
    pub kind: EventKind,
    pub payload: T,
}

/// Fan-out broker used by every store service.
///
/// Events are delivered in publish order per subscriber.  Subscribers that
/// drop their receiver are pruned on the next publish.
pub struct Broker<T: Clone> {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Event<T>>>>,
}

impl<T: Clone> Broker<T> {
    pub fn new() -> Self {
        Self { subscribers: Mutex::new(Vec::new()) }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Event<T>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn publish(&self, kind: EventKind, payload: T) {
        let mut subs = self.subscribers.lock();
        subs.retain(|tx| {
            tx.send(Event { kind, payload: payload.clone() }).is_ok()
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl<T: Clone> Default for Broker<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_events_in_order() {
        let broker: Broker<u32> = Broker::new();
        let mut rx = broker.subscribe();
        broker.publish(EventKind::Created, 1);
        broker.publish(EventKind::Updated, 2);
        broker.publish(EventKind::Deleted, 3);

        assert_eq!(rx.recv().await.unwrap().payload, 1);
        assert_eq!(rx.recv().await.unwrap().payload, 2);
        let last = rx.recv().await.unwrap();
        assert_eq!(last.payload, 3);
        assert_eq!(last.kind, EventKind::Deleted);
    }

    #[tokio::test]
    async fn multiple_subscribers_all_receive() {
        let broker: Broker<&'static str> = Broker::new();
        let mut a = broker.subscribe();
        let mut b = broker.subscribe();
        broker.publish(EventKind::Created, "x");
        assert_eq!(a.recv().await.unwrap().payload, "x");
        assert_eq!(b.recv().await.unwrap().payload, "x");
    }

    #[test]
    fn dropped_subscriber_is_pruned_on_publish() {
        let broker: Broker<u8> = Broker::new();
        let rx = broker.subscribe();
        assert_eq!(broker.subscriber_count(), 1);
        drop(rx);
        broker.publish(EventKind::Created, 0);
        assert_eq!(broker.subscriber_count(), 0);
    }
}
