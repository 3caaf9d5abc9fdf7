use super::KeyValueStore;
use crate::context::RequestContext;
use crate::subscription::{MapEvent, Subscriber, SubscriptionCollection, TopicSubscriber};
use std::sync::Arc;

/// User-facing map over a [`KeyValueStore`].
///
/// The `putReturnsNull` / `removeReturnsNull` context flags make `put` and
/// `remove` skip returning the previous value.
pub struct MapView {
    ctx: RequestContext,
    store: Arc<dyn KeyValueStore>,
}

impl MapView {
    pub fn new(ctx: RequestContext, store: Arc<dyn KeyValueStore>) -> Self {
        Self { ctx, store }
    }

    pub fn full_name(&self) -> &str {
        self.ctx.full_name()
    }

    pub fn context(&self) -> &RequestContext {
        &self.ctx
    }

    pub fn key_type(&self) -> Option<&str> {
        self.ctx.key_type()
    }

    pub fn value_type(&self) -> Option<&str> {
        self.ctx.value_type()
    }

    pub fn store(&self) -> Arc<dyn KeyValueStore> {
        Arc::clone(&self.store)
    }

    pub fn subscription(&self) -> Arc<SubscriptionCollection> {
        self.store.subscription()
    }

    /// Store `value`; returns the previous value unless `putReturnsNull`.
    pub fn put(&self, key: &str, value: &str) -> Option<String> {
        if self.ctx.put_returns_null() {
            self.store.put(key, value);
            None
        } else {
            self.store.get_and_put(key, value)
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.store.get(key)
    }

    /// Remove `key`; returns the previous value unless `removeReturnsNull`.
    pub fn remove(&self, key: &str) -> Option<String> {
        if self.ctx.remove_returns_null() {
            self.store.remove(key);
            None
        } else {
            self.store.get_and_remove(key)
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.store.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.store.long_size() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.store.long_size() == 0
    }

    /// All keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys = Vec::with_capacity(self.len());
        for segment in 0..self.store.segments() {
            self.store.keys_for(segment, &mut |k| keys.push(k.to_string()));
        }
        keys.sort();
        keys
    }

    /// All entries, sorted by key.
    pub fn entries(&self) -> Vec<(String, String)> {
        let mut entries = Vec::with_capacity(self.len());
        for segment in 0..self.store.segments() {
            self.store
                .entries_for(segment, &mut |k, v| entries.push((k.to_string(), v.to_string())));
        }
        entries.sort();
        entries
    }

    pub fn clear(&self) {
        self.store.clear();
    }

    /// Subscribe to map events using this map's bootstrap settings.
    pub fn register_subscriber(&self, subscriber: Arc<dyn Subscriber<MapEvent>>) {
        self.subscription().register_subscriber(&self.ctx, subscriber);
    }

    pub fn unregister_subscriber(&self, subscriber: &Arc<dyn Subscriber<MapEvent>>) {
        self.subscription().unregister_subscriber(subscriber);
    }

    pub fn register_key_subscriber(&self, subscriber: Arc<dyn Subscriber<String>>) {
        self.subscription().register_key_subscriber(&self.ctx, subscriber);
    }

    pub fn unregister_key_subscriber(&self, subscriber: &Arc<dyn Subscriber<String>>) {
        self.subscription().unregister_key_subscriber(subscriber);
    }

    pub fn register_topic_subscriber(&self, subscriber: Arc<dyn TopicSubscriber>) {
        self.subscription().register_topic_subscriber(&self.ctx, subscriber);
    }

    pub fn unregister_topic_subscriber(&self, subscriber: &Arc<dyn TopicSubscriber>) {
        self.subscription().unregister_topic_subscriber(subscriber);
    }
}

impl std::fmt::Debug for MapView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapView")
            .field("path", &self.full_name())
            .field("key_type", &self.key_type())
            .field("value_type", &self.value_type())
            .field("len", &self.len())
            .finish()
    }
}
