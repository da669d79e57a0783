//! In-process publish/subscribe bus.
//!
//! Subscribers receive events through an unbounded queue, so `emit` never runs
//! subscriber code. A handler that emits while processing an event only
//! enqueues; it cannot observe a half-finished emit.

use crate::events::BusEvent;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Identifier of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Debug, Default)]
struct BusInner {
    next_id: u64,
    subscribers: HashMap<String, Vec<(SubscriptionId, mpsc::UnboundedSender<BusEvent>)>>,
}

/// Cloneable handle to a shared bus.
#[derive(Debug, Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

/// Receiving side of a subscription.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    event: String,
    rx: mpsc::UnboundedReceiver<BusEvent>,
}

impl Subscription {
    /// Subscription identifier.
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Event name this subscription listens to.
    #[must_use]
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Wait for the next event. Returns `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        self.rx.recv().await
    }

    /// Take the next queued event without waiting.
    pub fn try_recv(&mut self) -> Option<BusEvent> {
        self.rx.try_recv().ok()
    }
}

impl EventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to `event`.
    #[must_use]
    pub fn subscribe(&self, event: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = SubscriptionId(inner.next_id);
        inner
            .subscribers
            .entry(event.to_string())
            .or_default()
            .push((id, tx));
        tracing::trace!(event, id = id.0, "Subscribed");
        Subscription {
            id,
            event: event.to_string(),
            rx,
        }
    }

    /// Remove a subscription; its queue drains and then ends.
    pub fn unsubscribe(&self, subscription: &Subscription) {
        let mut inner = self.inner.lock();
        if let Some(subs) = inner.subscribers.get_mut(&subscription.event) {
            subs.retain(|(id, _)| *id != subscription.id);
        }
    }

    /// Publish `event` to every subscriber of its name.
    ///
    /// Returns the number of subscribers reached. Dropped subscriptions are
    /// pruned along the way.
    pub fn emit(&self, event: BusEvent) -> usize {
        let name = event.name();
        let mut inner = self.inner.lock();
        let Some(subs) = inner.subscribers.get_mut(name) else {
            tracing::trace!(event = name, "No subscribers");
            return 0;
        };
        subs.retain(|(_, tx)| tx.send(event.clone()).is_ok());
        subs.len()
    }

    /// Number of live subscriptions for `event`.
    #[must_use]
    pub fn subscriber_count(&self, event: &str) -> usize {
        self.inner
            .lock()
            .subscribers
            .get(event)
            .map_or(0, |subs| subs.iter().filter(|(_, tx)| !tx.is_closed()).count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ReadRequest, READ_REQUEST, WRITE_REQUEST};

    fn read(point_id: u32) -> BusEvent {
        BusEvent::ReadRequest(ReadRequest {
            point_id,
            source_node_id: "n1".into(),
        })
    }

    #[test]
    fn emit_reaches_matching_subscribers_only() {
        let bus = EventBus::new();
        let mut reads = bus.subscribe(READ_REQUEST);
        let mut writes = bus.subscribe(WRITE_REQUEST);

        assert_eq!(bus.emit(read(1)), 1);

        assert_eq!(reads.try_recv(), Some(read(1)));
        assert!(writes.try_recv().is_none());
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let first = bus.subscribe(READ_REQUEST);
        let mut second = bus.subscribe(READ_REQUEST);

        bus.unsubscribe(&first);
        assert_eq!(bus.emit(read(2)), 1);
        assert_eq!(second.try_recv(), Some(read(2)));
    }

    #[test]
    fn dropped_subscriptions_are_pruned() {
        let bus = EventBus::new();
        drop(bus.subscribe(READ_REQUEST));

        assert_eq!(bus.subscriber_count(READ_REQUEST), 0);
        assert_eq!(bus.emit(read(3)), 0);
    }

    #[test]
    fn recv_waits_for_event() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(READ_REQUEST);
        bus.emit(read(4));

        let event = tokio_test::block_on(sub.recv());
        assert_eq!(event, Some(read(4)));
    }
}
