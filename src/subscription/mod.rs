//! Subscription dispatch.
//!
//! - [`SubscriptionCollection`]: per-map fan-out to topic, key, entry and
//!   downstream listeners, with bootstrap replay
//! - [`SimpleSubscription`]: single-value listeners on a child node, fed by
//!   the parent map's collection
//!
//! Subscribers are plain trait objects. A subscriber that returns
//! [`InvalidSubscriber`] from a delivery is removed and receives exactly one
//! end-of-subscription callback; nobody else notices.

mod collection;
mod registration;
mod simple;

pub use collection::SubscriptionCollection;
pub use simple::SimpleSubscription;

use crate::error::InvalidSubscriber;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Outcome of a single delivery.
pub type Delivery = std::result::Result<(), InvalidSubscriber>;

/// Receives values of type `T`.
pub trait Subscriber<T>: Send + Sync {
    fn on_message(&self, message: T) -> Delivery;

    /// Called exactly once when the subscription ends, for whatever reason.
    fn on_end_of_subscription(&self) {}
}

/// Receives `(topic, message)` pairs. For a map the topic is the key and the
/// message the new value (`None` on removal).
pub trait TopicSubscriber: Send + Sync {
    fn on_message(&self, topic: String, message: Option<String>) -> Delivery;

    fn on_end_of_subscription(&self) {}
}

/// Downstream consumer of raw map events (replication bridges, remote
/// proxies). Never bootstrapped.
pub trait EventConsumer: Send + Sync {
    fn accept(&self, event: &MapEvent) -> Delivery;

    fn on_end_of_subscription(&self) {}
}

/// A change to one key of a map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MapEvent {
    Insert {
        asset: String,
        key: String,
        value: String,
    },
    Update {
        asset: String,
        key: String,
        old_value: String,
        value: String,
    },
    Remove {
        asset: String,
        key: String,
        old_value: String,
    },
}

impl MapEvent {
    /// Event for a transition between two optional values; `None` when
    /// nothing visible changed (tombstone over tombstone).
    pub fn between(
        asset: &str,
        key: &str,
        old_value: Option<String>,
        new_value: Option<String>,
    ) -> Option<Self> {
        let asset = asset.to_string();
        let key = key.to_string();
        match (old_value, new_value) {
            (None, Some(value)) => Some(MapEvent::Insert { asset, key, value }),
            (Some(old_value), Some(value)) => Some(MapEvent::Update {
                asset,
                key,
                old_value,
                value,
            }),
            (Some(old_value), None) => Some(MapEvent::Remove {
                asset,
                key,
                old_value,
            }),
            (None, None) => None,
        }
    }

    /// Full name of the map asset the event happened on.
    pub fn asset(&self) -> &str {
        match self {
            MapEvent::Insert { asset, .. }
            | MapEvent::Update { asset, .. }
            | MapEvent::Remove { asset, .. } => asset,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            MapEvent::Insert { key, .. }
            | MapEvent::Update { key, .. }
            | MapEvent::Remove { key, .. } => key,
        }
    }

    /// New value; `None` for a removal.
    pub fn value(&self) -> Option<&str> {
        match self {
            MapEvent::Insert { value, .. } | MapEvent::Update { value, .. } => Some(value),
            MapEvent::Remove { .. } => None,
        }
    }

    pub fn old_value(&self) -> Option<&str> {
        match self {
            MapEvent::Insert { .. } => None,
            MapEvent::Update { old_value, .. } | MapEvent::Remove { old_value, .. } => {
                Some(old_value)
            }
        }
    }
}

/// Adapts a closure into a [`Subscriber`].
pub struct FnSubscriber<F> {
    f: F,
}

impl<F> FnSubscriber<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<T, F> Subscriber<T> for FnSubscriber<F>
where
    F: Fn(T) -> Delivery + Send + Sync,
{
    fn on_message(&self, message: T) -> Delivery {
        (self.f)(message)
    }
}

/// Closure subscriber as a shareable trait object.
pub fn subscriber_fn<T, F>(f: F) -> Arc<dyn Subscriber<T>>
where
    T: 'static,
    F: Fn(T) -> Delivery + Send + Sync + 'static,
{
    Arc::new(FnSubscriber::new(f))
}

/// Identity of a shared subscriber (data pointer, vtable ignored).
pub(crate) fn same_subscriber<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_between() {
        let insert = MapEvent::between("/m", "k", None, Some("v".into())).unwrap();
        assert!(matches!(insert, MapEvent::Insert { .. }));
        assert_eq!(insert.value(), Some("v"));
        assert_eq!(insert.old_value(), None);

        let update = MapEvent::between("/m", "k", Some("a".into()), Some("b".into())).unwrap();
        assert_eq!(update.old_value(), Some("a"));
        assert_eq!(update.value(), Some("b"));

        let remove = MapEvent::between("/m", "k", Some("a".into()), None).unwrap();
        assert_eq!(remove.value(), None);
        assert_eq!(remove.key(), "k");
        assert_eq!(remove.asset(), "/m");

        assert!(MapEvent::between("/m", "k", None, None).is_none());
    }

    #[test]
    fn test_fn_subscriber() {
        let s = subscriber_fn(|n: u32| if n < 3 { Ok(()) } else { Err(InvalidSubscriber) });
        assert!(s.on_message(1).is_ok());
        assert_eq!(s.on_message(3), Err(InvalidSubscriber));
    }

    #[test]
    fn test_same_subscriber() {
        let a = subscriber_fn(|_: u32| Ok(()));
        let b = Arc::clone(&a);
        let c = subscriber_fn(|_: u32| Ok(()));
        assert!(same_subscriber(&a, &b));
        assert!(!same_subscriber(&a, &c));
    }

    #[test]
    fn test_event_serde_shape() {
        let event = MapEvent::between("/m", "k", None, Some("v".into())).unwrap();
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"insert\""));
        let back: MapEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
