//! Publish/subscribe event bus for Lodestar services.
//!
//! The bus is fire-and-forget: every subscriber owns an unbounded channel,
//! so a slow or stalled subscriber never blocks a publisher. Subscribers
//! whose channel has been dropped are pruned on the next publish.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Subscriber identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    /// Generate a new subscriber ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Trait for event subscribers driven by [`spawn_subscriber`].
#[async_trait]
pub trait EventSubscriber<E>: Send + Sync
where
    E: Clone + Send + 'static,
{
    /// Handle an event.
    async fn handle(&self, event: E);

    /// Get the subscriber name.
    fn name(&self) -> &str;

    /// Filter events (return true to handle the event).
    fn filter(&self, event: &E) -> bool {
        let _ = event;
        true
    }
}

/// Subscription handle holding the receiving end of a subscriber channel.
pub struct Subscription<E> {
    id: SubscriberId,
    name: String,
    receiver: mpsc::UnboundedReceiver<E>,
}

impl<E> Subscription<E> {
    fn new(id: SubscriberId, name: String, receiver: mpsc::UnboundedReceiver<E>) -> Self {
        Self { id, name, receiver }
    }

    /// Get the subscription ID.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Get the subscription name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Receive the next event.
    pub async fn next(&mut self) -> Option<E> {
        self.receiver.recv().await
    }

    /// Try to receive an event without blocking.
    pub fn try_next(&mut self) -> Option<E> {
        self.receiver.try_recv().ok()
    }
}

/// Event bus for publishing and subscribing to events of one type.
pub struct EventBus<E> {
    subscribers: Arc<RwLock<HashMap<SubscriberId, mpsc::UnboundedSender<E>>>>,
    subscriber_names: Arc<RwLock<HashMap<SubscriberId, String>>>,
}

impl<E> Default for EventBus<E>
where
    E: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<E> EventBus<E>
where
    E: Clone + Send + 'static,
{
    /// Create a new event bus.
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            subscriber_names: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Subscribe to events.
    pub fn subscribe(&self, name: impl Into<String>) -> Subscription<E> {
        let id = SubscriberId::new();
        let name = name.into();
        let (tx, rx) = mpsc::unbounded_channel();

        self.subscribers.write().insert(id, tx);
        self.subscriber_names.write().insert(id, name.clone());

        debug!("Subscriber {} registered on event bus", name);
        Subscription::new(id, name, rx)
    }

    /// Unsubscribe from events.
    pub fn unsubscribe(&self, id: SubscriberId) {
        self.subscribers.write().remove(&id);
        self.subscriber_names.write().remove(&id);
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: E) {
        let subscribers = self.subscribers.read();
        let mut failed = Vec::new();

        for (id, sender) in subscribers.iter() {
            if sender.send(event.clone()).is_err() {
                failed.push(*id);
            }
        }

        drop(subscribers);

        // Prune subscribers whose receiving end is gone
        for id in failed {
            warn!("Removing dead subscriber {} from event bus", id);
            self.unsubscribe(id);
        }
    }

    /// Get the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Get subscriber names.
    pub fn subscriber_names(&self) -> Vec<String> {
        self.subscriber_names.read().values().cloned().collect()
    }
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            subscribers: Arc::clone(&self.subscribers),
            subscriber_names: Arc::clone(&self.subscriber_names),
        }
    }
}

/// Simple subscriber implementation wrapping a closure.
pub struct SimpleSubscriber<E, F>
where
    F: Fn(E) + Send + Sync,
{
    name: String,
    handler: F,
    _marker: std::marker::PhantomData<fn(E)>,
}

impl<E, F> SimpleSubscriber<E, F>
where
    F: Fn(E) + Send + Sync,
{
    /// Create a new simple subscriber.
    pub fn new(name: impl Into<String>, handler: F) -> Self {
        Self {
            name: name.into(),
            handler,
            _marker: std::marker::PhantomData,
        }
    }
}

#[async_trait]
impl<E, F> EventSubscriber<E> for SimpleSubscriber<E, F>
where
    E: Clone + Send + 'static,
    F: Fn(E) + Send + Sync,
{
    async fn handle(&self, event: E) {
        (self.handler)(event)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Pump a subscription through a subscriber on its own task.
///
/// The returned handle finishes when the bus (all senders) is dropped or the
/// subscriber is unsubscribed; abort it for an early stop.
pub fn spawn_subscriber<E>(
    mut subscription: Subscription<E>,
    subscriber: Arc<dyn EventSubscriber<E>>,
) -> JoinHandle<()>
where
    E: Clone + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(event) = subscription.next().await {
            if subscriber.filter(&event) {
                subscriber.handle(event).await;
            }
        }
        debug!("Subscriber {} drained", subscriber.name());
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_subscriber_id_generation() {
        let id1 = SubscriberId::new();
        let id2 = SubscriberId::new();
        assert_ne!(id1, id2);
    }

    #[tokio::test]
    async fn test_subscribe_and_publish() {
        let bus: EventBus<String> = EventBus::new();
        let mut sub = bus.subscribe("test-subscriber");

        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(sub.name(), "test-subscriber");

        bus.publish("hello".to_string());

        let received = sub.next().await;
        assert_eq!(received.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let bus: EventBus<u32> = EventBus::new();
        let sub = bus.subscribe("gone");

        bus.unsubscribe(sub.id());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_dead_subscriber_pruned_on_publish() {
        let bus: EventBus<u32> = EventBus::new();
        let sub = bus.subscribe("dropped");
        drop(sub);

        bus.publish(1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_publish_fans_out() {
        let bus: EventBus<u32> = EventBus::new();
        let mut sub1 = bus.subscribe("one");
        let mut sub2 = bus.subscribe("two");

        bus.publish(7);

        assert_eq!(sub1.next().await, Some(7));
        assert_eq!(sub2.next().await, Some(7));
    }

    #[tokio::test]
    async fn test_spawn_subscriber_handles_events() {
        let bus: EventBus<u32> = EventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let counted = Arc::clone(&counter);
        let subscriber = Arc::new(SimpleSubscriber::new("counter", move |_event: u32| {
            counted.fetch_add(1, Ordering::SeqCst);
        }));

        let sub = bus.subscribe("counter");
        let handle = spawn_subscriber(sub, subscriber);

        bus.publish(1);
        bus.publish(2);
        drop(bus);

        handle.await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
