//! The synchronous event bus.
//!
//! `publish`/`publishID` dispatch to matching handlers before returning,
//! in subscription order, aborting on the first handler error. A bus is
//! scoped: once [`EventBus::close`] has been called, further publishes fail
//! with [`BusError::Closed`] rather than silently dropping. [`NoopBus`] is a
//! zero-cost stand-in for tests and configurations that don't need the bus.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, trace};

use crate::error::BusError;
use crate::events::Event;

/// A subscriber callback. Returning `Err` aborts delivery of the current
/// publish to any handlers still pending.
pub type Handler = Box<dyn Fn(&Event) -> Result<(), BusError> + Send + Sync>;

/// An opaque subscription handle. Currently unused for unsubscription (the
/// bus has no unsubscribe operation); kept distinct from a bare `u64` so one
/// can be added without a breaking change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

/// The bus contract, implemented by [`Bus`] and [`NoopBus`].
pub trait EventBus: Send + Sync {
    /// Publishes `payload` on `topic` with no session id. Synchronous:
    /// returns only after every matching handler has run or one has failed.
    fn publish(&self, topic: &str, payload: Value) -> Result<(), BusError>;

    /// Publishes `payload` on `topic` scoped to `id`, additionally notifying
    /// any id-scoped subscribers for `id`.
    fn publish_id(&self, topic: &str, id: &str, payload: Value) -> Result<(), BusError>;

    /// Subscribes `handler` to every topic in `topics`.
    fn subscribe_topics(&self, topics: &[&str], handler: Handler) -> SubscriptionId;

    /// Subscribes `handler` to every event published with session id `id`,
    /// regardless of topic.
    fn subscribe_id(&self, id: &str, handler: Handler) -> SubscriptionId;

    /// Subscribes `handler` to every event on the bus, regardless of topic or id.
    fn subscribe_all(&self, handler: Handler) -> SubscriptionId;

    /// Total number of live subscriptions across all three registries.
    fn num_subscribers(&self) -> usize;

    /// Closes the bus's scope. Subsequent publishes fail with [`BusError::Closed`].
    fn close(&self);
}

/// Convenience helper for publishing a typed payload via `dyn EventBus`.
pub fn publish_value<T: Serialize>(bus: &dyn EventBus, topic: &str, payload: &T) -> Result<(), BusError> {
    let value = serde_json::to_value(payload).map_err(|e| BusError::Handler {
        topic: topic.to_string(),
        reason: format!("payload serialization failed: {e}"),
    })?;
    bus.publish(topic, value)
}

/// Convenience helper for publishing a typed payload scoped to an id via `dyn EventBus`.
pub fn publish_id_value<T: Serialize>(bus: &dyn EventBus, topic: &str, id: &str, payload: &T) -> Result<(), BusError> {
    let value = serde_json::to_value(payload).map_err(|e| BusError::Handler {
        topic: topic.to_string(),
        reason: format!("payload serialization failed: {e}"),
    })?;
    bus.publish_id(topic, id, value)
}

type SharedHandler = std::sync::Arc<dyn Fn(&Event) -> Result<(), BusError> + Send + Sync>;

struct Subscription {
    #[allow(dead_code)]
    id: u64,
    handler: SharedHandler,
}

/// In-memory, lock-backed synchronous event bus.
#[derive(Default)]
pub struct Bus {
    closed: AtomicBool,
    next_id: AtomicU64,
    by_topic: RwLock<HashMap<String, Vec<Subscription>>>,
    by_id: RwLock<HashMap<String, Vec<Subscription>>>,
    all: RwLock<Vec<Subscription>>,
}

impl Bus {
    /// A fresh, open bus with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn next_subscription_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn dispatch(&self, event: &Event) -> Result<(), BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        trace!(topic = %event.topic, session_id = %event.session_id, "publishing event");

        if let Some(subs) = self.by_topic.read().expect("bus lock poisoned").get(&event.topic) {
            for sub in subs {
                (*sub.handler)(event)?;
            }
        }
        if !event.session_id.is_empty() {
            if let Some(subs) = self.by_id.read().expect("bus lock poisoned").get(&event.session_id) {
                for sub in subs {
                    (*sub.handler)(event)?;
                }
            }
        }
        for sub in self.all.read().expect("bus lock poisoned").iter() {
            (*sub.handler)(event)?;
        }
        Ok(())
    }
}

impl EventBus for Bus {
    fn publish(&self, topic: &str, payload: Value) -> Result<(), BusError> {
        let event = Event {
            topic: topic.to_string(),
            session_id: String::new(),
            published_at: Utc::now(),
            payload,
        };
        self.dispatch(&event)
    }

    fn publish_id(&self, topic: &str, id: &str, payload: Value) -> Result<(), BusError> {
        let event = Event {
            topic: topic.to_string(),
            session_id: id.to_string(),
            published_at: Utc::now(),
            payload,
        };
        self.dispatch(&event)
    }

    fn subscribe_topics(&self, topics: &[&str], handler: Handler) -> SubscriptionId {
        let id = self.next_subscription_id();
        debug!(?topics, "subscribing handler to topics");
        let shared: SharedHandler = std::sync::Arc::from(handler);
        let mut by_topic = self.by_topic.write().expect("bus lock poisoned");
        for topic in topics {
            by_topic.entry((*topic).to_string()).or_default().push(Subscription {
                id,
                handler: shared.clone(),
            });
        }
        SubscriptionId(id)
    }

    fn subscribe_id(&self, id: &str, handler: Handler) -> SubscriptionId {
        let sub_id = self.next_subscription_id();
        debug!(session_id = %id, "subscribing handler to id");
        self.by_id
            .write()
            .expect("bus lock poisoned")
            .entry(id.to_string())
            .or_default()
            .push(Subscription {
                id: sub_id,
                handler: std::sync::Arc::from(handler),
            });
        SubscriptionId(sub_id)
    }

    fn subscribe_all(&self, handler: Handler) -> SubscriptionId {
        let sub_id = self.next_subscription_id();
        debug!("subscribing handler to all events");
        self.all.write().expect("bus lock poisoned").push(Subscription {
            id: sub_id,
            handler: std::sync::Arc::from(handler),
        });
        SubscriptionId(sub_id)
    }

    fn num_subscribers(&self) -> usize {
        let by_topic: usize = self
            .by_topic
            .read()
            .expect("bus lock poisoned")
            .values()
            .map(Vec::len)
            .sum();
        let by_id: usize = self.by_id.read().expect("bus lock poisoned").values().map(Vec::len).sum();
        let all = self.all.read().expect("bus lock poisoned").len();
        by_topic + by_id + all
    }

    fn close(&self) {
        debug!("closing event bus");
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// A bus that accepts subscriptions and silently discards every publish.
/// Useful when wiring an orchestrator for a test or a CLI invocation that has
/// no use for the event stream.
#[derive(Default)]
pub struct NoopBus;

impl NoopBus {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl EventBus for NoopBus {
    fn publish(&self, _topic: &str, _payload: Value) -> Result<(), BusError> {
        Ok(())
    }

    fn publish_id(&self, _topic: &str, _id: &str, _payload: Value) -> Result<(), BusError> {
        Ok(())
    }

    fn subscribe_topics(&self, _topics: &[&str], _handler: Handler) -> SubscriptionId {
        SubscriptionId(0)
    }

    fn subscribe_id(&self, _id: &str, _handler: Handler) -> SubscriptionId {
        SubscriptionId(0)
    }

    fn subscribe_all(&self, _handler: Handler) -> SubscriptionId {
        SubscriptionId(0)
    }

    fn num_subscribers(&self) -> usize {
        0
    }

    fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn topic_handlers_run_in_subscription_order() {
        let bus = Bus::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let o1 = order.clone();
        bus.subscribe_topics(&["x"], Box::new(move |_| {
            o1.lock().unwrap().push(1);
            Ok(())
        }));
        let o2 = order.clone();
        bus.subscribe_topics(&["x"], Box::new(move |_| {
            o2.lock().unwrap().push(2);
            Ok(())
        }));

        bus.publish("x", Value::Null).unwrap();
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn id_subscriber_only_sees_matching_session() {
        let bus = Bus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        bus.subscribe_id("run_1", Box::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        bus.publish_id("transform:Start", "run_1", Value::Null).unwrap();
        bus.publish_id("transform:Start", "run_2", Value::Null).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handler_error_aborts_remaining_delivery() {
        let bus = Bus::new();
        let second_ran = Arc::new(AtomicBool::new(false));

        bus.subscribe_topics(
            &["x"],
            Box::new(|_| {
                Err(BusError::Handler {
                    topic: "x".to_string(),
                    reason: "boom".to_string(),
                })
            }),
        );
        let flag = second_ran.clone();
        bus.subscribe_topics(&["x"], Box::new(move |_| {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        }));

        let result = bus.publish("x", Value::Null);
        assert!(result.is_err());
        assert!(!second_ran.load(Ordering::SeqCst));
    }

    #[test]
    fn closed_bus_rejects_publish() {
        let bus = Bus::new();
        bus.close();
        assert_eq!(bus.publish("x", Value::Null), Err(BusError::Closed));
    }

    #[test]
    fn num_subscribers_counts_all_three_registries() {
        let bus = Bus::new();
        bus.subscribe_topics(&["x", "y"], Box::new(|_| Ok(())));
        bus.subscribe_id("run_1", Box::new(|_| Ok(())));
        bus.subscribe_all(Box::new(|_| Ok(())));
        assert_eq!(bus.num_subscribers(), 4);
    }

    #[test]
    fn noop_bus_accepts_everything() {
        let bus = NoopBus::new();
        bus.subscribe_all(Box::new(|_| Ok(())));
        assert!(bus.publish("x", Value::Null).is_ok());
        assert_eq!(bus.num_subscribers(), 0);
    }
}
