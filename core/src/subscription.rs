//! In-process push notifications for newly appended events.
//!
//! After a successful push the [`Eventstore`](crate::eventstore::Eventstore)
//! hands the persisted events to [`Subscriptions::notify`], which forwards
//! each event to every subscriber interested in its aggregate type.
//!
//! # Delivery
//!
//! Delivery is best-effort: a subscriber whose buffer is full misses the
//! notification. Subscribers are projections that also poll on a schedule,
//! so a missed notification only delays them until the next poll.

use crate::aggregate::AggregateType;
use crate::event::StoredEvent;
use futures::Stream;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

/// Buffered notifications per subscriber.
pub const SUBSCRIPTION_BUFFER: usize = 1024;

/// Stream of newly appended events.
pub type EventStream = Pin<Box<dyn Stream<Item = StoredEvent> + Send>>;

struct Subscriber {
    aggregate_types: Vec<AggregateType>,
    sender: mpsc::Sender<StoredEvent>,
}

impl Subscriber {
    fn wants(&self, event: &StoredEvent) -> bool {
        self.aggregate_types.is_empty()
            || self
                .aggregate_types
                .contains(&event.aggregate.aggregate_type)
    }
}

/// Registry of live subscribers.
#[derive(Clone, Default)]
pub struct Subscriptions {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
}

impl Subscriptions {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events of the given aggregate types (all types if empty).
    pub fn subscribe<I, T>(&self, aggregate_types: I) -> Subscription
    where
        I: IntoIterator<Item = T>,
        T: Into<AggregateType>,
    {
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let subscriber = Subscriber {
            aggregate_types: aggregate_types.into_iter().map(Into::into).collect(),
            sender,
        };
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(subscriber);
        Subscription { receiver }
    }

    /// Forward events to interested subscribers, dropping closed ones.
    pub fn notify(&self, events: &[StoredEvent]) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        subscribers.retain(|subscriber| {
            for event in events.iter().filter(|e| subscriber.wants(e)) {
                match subscriber.sender.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::debug!(
                            sequence = event.sequence,
                            instance = %event.aggregate.instance_id,
                            "Subscriber buffer full, dropping notification"
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => return false,
                }
            }
            true
        });
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether nobody is subscribed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Receiving end of a subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    receiver: mpsc::Receiver<StoredEvent>,
}

impl Subscription {
    /// Wait for the next event. Returns `None` once the hub is gone.
    pub async fn recv(&mut self) -> Option<StoredEvent> {
        self.receiver.recv().await
    }

    /// Convert into a stream of events.
    #[must_use]
    pub fn into_stream(self) -> EventStream {
        Box::pin(futures::stream::unfold(self, |mut subscription| async move {
            subscription
                .recv()
                .await
                .map(|event| (event, subscription))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{Aggregate, EventType};
    use crate::event::Editor;
    use chrono::Utc;
    use futures::StreamExt;

    fn event(aggregate_type: &str, sequence: u64) -> StoredEvent {
        StoredEvent {
            aggregate: Aggregate::new(aggregate_type, "a", "inst", "org", "v1"),
            event_type: EventType::new("added"),
            sequence,
            aggregate_sequence: sequence,
            payload: Vec::new(),
            created_at: Utc::now(),
            editor: Editor::default(),
        }
    }

    #[tokio::test]
    async fn delivers_only_matching_aggregate_types() {
        let hub = Subscriptions::new();
        let mut users = hub.subscribe(["user"]);
        let mut everything = hub.subscribe(Vec::<AggregateType>::new());

        hub.notify(&[event("org", 1), event("user", 2)]);

        assert_eq!(users.recv().await.map(|e| e.sequence), Some(2));
        assert_eq!(everything.recv().await.map(|e| e.sequence), Some(1));
        assert_eq!(everything.recv().await.map(|e| e.sequence), Some(2));
    }

    #[tokio::test]
    async fn dropped_subscribers_are_removed() {
        let hub = Subscriptions::new();
        let subscription = hub.subscribe(["user"]);
        assert_eq!(hub.len(), 1);

        drop(subscription);
        hub.notify(&[event("user", 1)]);
        assert!(hub.is_empty());
    }

    #[tokio::test]
    async fn stream_yields_notified_events() {
        let hub = Subscriptions::new();
        let mut stream = hub.subscribe(["user"]).into_stream();

        hub.notify(&[event("user", 3)]);
        assert_eq!(stream.next().await.map(|e| e.sequence), Some(3));
    }
}
