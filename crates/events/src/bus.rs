//! Event bus implementation using tokio broadcast channels

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::types::{Event, EventEnvelope};

/// Capacity for the broadcast channel
const DEFAULT_CAPACITY: usize = 1000;

/// Event bus for publishing and subscribing to events.
///
/// Every published envelope is stamped with a monotonically increasing
/// sequence number shared by all clones of the bus.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
    sequence: Arc<AtomicU64>,
}

impl EventBus {
    /// Create a new event bus with default capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a new event bus with specified capacity
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish an envelope to all subscribers
    ///
    /// Returns the number of subscribers that received the event.
    /// If there are no subscribers, returns 0 (the event is dropped).
    pub fn publish(&self, mut envelope: EventEnvelope) -> usize {
        envelope.sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        self.sender.send(envelope).unwrap_or(0)
    }

    /// Wrap and publish an event
    pub fn emit(&self, event: Event) -> usize {
        self.publish(EventEnvelope::new(event))
    }

    /// Subscribe to events
    ///
    /// Note: Events published before subscribing will not be received.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    /// Get the number of current subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Sequence number of the last published event
    pub fn last_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .field("last_sequence", &self.last_sequence())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paused(step: usize) -> Event {
        Event::RunPaused {
            project_id: "proj".to_string(),
            step,
        }
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        let envelope = EventEnvelope::new(paused(1));
        let sent = bus.publish(envelope.clone());
        assert_eq!(sent, 1);

        let received = rx.recv().await.unwrap();
        assert_eq!(received.id, envelope.id);
        assert_eq!(received.sequence, 1);
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        let sent = bus.emit(paused(2));
        assert_eq!(sent, 2);

        let received1 = rx1.recv().await.unwrap();
        let received2 = rx2.recv().await.unwrap();
        assert_eq!(received1.id, received2.id);
    }

    #[tokio::test]
    async fn test_no_subscribers() {
        let bus = EventBus::new();

        // No subscribers, event is dropped but still sequenced
        assert_eq!(bus.emit(paused(0)), 0);
        assert_eq!(bus.last_sequence(), 1);
    }

    #[tokio::test]
    async fn test_sequence_is_monotonic() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        for step in 0..3 {
            bus.emit(paused(step));
        }

        let mut last = 0;
        for _ in 0..3 {
            let envelope = rx.recv().await.unwrap();
            assert!(envelope.sequence > last);
            last = envelope.sequence;
        }
        assert_eq!(last, 3);
    }

    #[test]
    fn test_clone_shares_channel_and_sequence() {
        let bus1 = EventBus::new();
        let bus2 = bus1.clone();

        let _rx = bus2.subscribe();
        assert_eq!(bus1.subscriber_count(), 1);

        bus1.emit(paused(0));
        bus2.emit(paused(1));
        assert_eq!(bus1.last_sequence(), 2);
        assert_eq!(bus2.last_sequence(), 2);
    }
}
