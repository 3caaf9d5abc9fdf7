//! Views addressing a single key of a map.
//!
//! A child node `/orders/42` of a map node `/orders` can be viewed as a
//! [`Reference`] to key `42`, or as a [`Publisher`] writing to it. A
//! [`TopicPublisher`] sits on the map node itself and publishes
//! `(topic, message)` pairs as `(key, value)`.

use super::MapView;
use crate::context::RequestContext;
use crate::subscription::{SimpleSubscription, Subscriber, TopicSubscriber};
use std::sync::Arc;

/// Read/write handle on one key of the parent map.
pub struct Reference {
    key: String,
    map: Arc<MapView>,
    subscription: Arc<SimpleSubscription>,
}

impl Reference {
    pub fn new(key: impl Into<String>, map: Arc<MapView>, subscription: Arc<SimpleSubscription>) -> Self {
        Self {
            key: key.into(),
            map,
            subscription,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn get(&self) -> Option<String> {
        self.map.get(&self.key)
    }

    pub fn set(&self, value: &str) {
        self.map.store().put(&self.key, value);
    }

    pub fn get_and_set(&self, value: &str) -> Option<String> {
        self.map.store().get_and_put(&self.key, value)
    }

    pub fn remove(&self) {
        self.map.store().remove(&self.key);
    }

    /// Follow the value; bootstraps with the current value by default.
    pub fn register_subscriber(&self, ctx: &RequestContext, subscriber: Arc<dyn Subscriber<Option<String>>>) {
        self.subscription.register_subscriber(ctx, subscriber);
    }

    pub fn unregister_subscriber(&self, subscriber: &Arc<dyn Subscriber<Option<String>>>) {
        self.subscription.unregister_subscriber(subscriber);
    }
}

impl std::fmt::Debug for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reference")
            .field("map", &self.map.full_name())
            .field("key", &self.key)
            .finish()
    }
}

/// Publishes values under its node's name into the parent map.
pub struct Publisher {
    key: String,
    map: Arc<MapView>,
}

impl Publisher {
    pub fn new(key: impl Into<String>, map: Arc<MapView>) -> Self {
        Self {
            key: key.into(),
            map,
        }
    }

    pub fn publish(&self, value: &str) {
        self.map.store().put(&self.key, value);
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("map", &self.map.full_name())
            .field("key", &self.key)
            .finish()
    }
}

/// Publishes `(topic, message)` pairs into its node's map.
pub struct TopicPublisher {
    map: Arc<MapView>,
}

impl TopicPublisher {
    pub fn new(map: Arc<MapView>) -> Self {
        Self { map }
    }

    pub fn publish(&self, topic: &str, message: &str) {
        self.map.store().put(topic, message);
    }

    pub fn register_topic_subscriber(&self, ctx: &RequestContext, subscriber: Arc<dyn TopicSubscriber>) {
        self.map
            .subscription()
            .register_topic_subscriber(ctx, subscriber);
    }

    pub fn unregister_topic_subscriber(&self, subscriber: &Arc<dyn TopicSubscriber>) {
        self.map.subscription().unregister_topic_subscriber(subscriber);
    }
}

impl std::fmt::Debug for TopicPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicPublisher")
            .field("map", &self.map.full_name())
            .finish()
    }
}
