use super::registration::{Admission, Listener, Registration, Registrations};
use super::{same_subscriber, Delivery, EventConsumer, MapEvent, SimpleSubscription, Subscriber, TopicSubscriber};
use crate::context::RequestContext;
use crate::metrics;
use crate::store::KeyValueStore;
use crate::tree::{Closeable, ViewType, WeakAsset};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use tracing::{debug, trace, warn};

type Set<T> = RwLock<Vec<Arc<T>>>;

/// Listeners of one map node.
///
/// The store calls [`SubscriptionCollection::notify_event`] after every
/// visible mutation, with its own locks released.
pub struct SubscriptionCollection {
    asset: WeakAsset,
    store: RwLock<Option<Weak<dyn KeyValueStore>>>,
    topic_subscribers: Registrations<dyn TopicSubscriber, (String, Option<String>)>,
    key_subscribers: Registrations<dyn Subscriber<String>, String>,
    entry_subscribers: Registrations<dyn Subscriber<MapEvent>, MapEvent>,
    downstream: Set<dyn EventConsumer>,
    closed: AtomicBool,
}

impl SubscriptionCollection {
    pub fn new(asset: WeakAsset) -> Self {
        Self {
            asset,
            store: RwLock::new(None),
            topic_subscribers: Registrations::new(),
            key_subscribers: Registrations::new(),
            entry_subscribers: Registrations::new(),
            downstream: RwLock::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Attach the store whose contents are replayed on bootstrap.
    pub fn set_kv_store(&self, store: Weak<dyn KeyValueStore>) {
        *self.store.write().unwrap_or_else(PoisonError::into_inner) = Some(store);
    }

    fn kv_store(&self) -> Option<Arc<dyn KeyValueStore>> {
        self.store
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
    }

    fn path(&self) -> &str {
        self.asset.full_name()
    }

    /// Current entries, one segment at a time, copied out of the store.
    fn bootstrap_entries(&self) -> Vec<(String, String)> {
        let Some(store) = self.kv_store() else {
            return Vec::new();
        };
        let mut entries = Vec::new();
        for segment in 0..store.segments() {
            store.entries_for(segment, &mut |k, v| entries.push((k.to_string(), v.to_string())));
        }
        entries
    }

    /// Shared registration path: join the live set (holding live messages),
    /// replay the current entries, then release what was held.
    fn register<S, M>(
        &self,
        set: &Registrations<S, M>,
        kind: &'static str,
        ctx: &RequestContext,
        subscriber: Arc<S>,
        replay: impl Fn(String, String) -> M,
        deliver: impl Fn(&S, M) -> Delivery,
    ) where
        S: ?Sized + Listener,
    {
        if ctx.end_subscription_after_bootstrap() {
            if ctx.bootstrap() {
                for (key, value) in self.bootstrap_entries() {
                    if deliver(&*subscriber, replay(key, value)).is_err() {
                        break;
                    }
                }
            }
            subscriber.end();
            return;
        }

        let registration = Registration::new(Arc::clone(&subscriber));
        match set.admit(&registration, &self.closed) {
            Admission::Admitted => metrics::record_subscriber_registered(kind),
            Admission::Duplicate => return,
            Admission::Closed => {
                subscriber.end();
                return;
            }
        }

        if ctx.bootstrap() {
            for (key, value) in self.bootstrap_entries() {
                if deliver(&*subscriber, replay(key, value)).is_err() {
                    debug!(path = %self.path(), kind, "Subscriber declined during bootstrap");
                    self.reject(set, &registration, kind);
                    return;
                }
            }
        }
        if registration.go_live(&deliver).is_err() {
            self.reject(set, &registration, kind);
            return;
        }
        debug!(path = %self.path(), kind, "Subscriber registered");
    }

    fn unregister<S, M>(&self, set: &Registrations<S, M>, kind: &'static str, subscriber: &Arc<S>)
    where
        S: ?Sized + Listener,
    {
        match set.remove(subscriber) {
            Some(registration) => {
                metrics::record_subscriber_removed(kind, "unregistered");
                registration.end();
            }
            None => subscriber.end(),
        }
    }

    fn reject<S, M>(&self, set: &Registrations<S, M>, registration: &Arc<Registration<S, M>>, kind: &'static str)
    where
        S: ?Sized + Listener,
    {
        if set.remove(registration.subscriber()).is_some() {
            warn!(path = %self.path(), kind, "Subscriber no longer interested, removed");
            metrics::record_subscriber_removed(kind, "invalid");
        }
        registration.end();
    }

    // ── entry subscribers ───────────────────────────────────────────────────

    /// Register a subscriber to every [`MapEvent`] of the map.
    ///
    /// With bootstrap (the default) every current entry is first delivered as
    /// an `Insert`; changes racing the replay follow it. If the context asks
    /// to end after bootstrap the subscriber is ended right after the replay
    /// and never goes live.
    pub fn register_subscriber(&self, ctx: &RequestContext, subscriber: Arc<dyn Subscriber<MapEvent>>) {
        let asset = self.path().to_string();
        self.register(
            &self.entry_subscribers,
            "entry",
            ctx,
            subscriber,
            |key, value| MapEvent::Insert {
                asset: asset.clone(),
                key,
                value,
            },
            |s, event| s.on_message(event),
        );
    }

    pub fn unregister_subscriber(&self, subscriber: &Arc<dyn Subscriber<MapEvent>>) {
        self.unregister(&self.entry_subscribers, "entry", subscriber);
    }

    // ── key subscribers ─────────────────────────────────────────────────────

    /// Register a subscriber to the keys that change. Bootstraps with every
    /// current key.
    pub fn register_key_subscriber(&self, ctx: &RequestContext, subscriber: Arc<dyn Subscriber<String>>) {
        self.register(
            &self.key_subscribers,
            "key",
            ctx,
            subscriber,
            |key, _| key,
            |s, key| s.on_message(key),
        );
    }

    pub fn unregister_key_subscriber(&self, subscriber: &Arc<dyn Subscriber<String>>) {
        self.unregister(&self.key_subscribers, "key", subscriber);
    }

    // ── topic subscribers ───────────────────────────────────────────────────

    /// Register a `(key, value)` subscriber. Bootstraps with every current
    /// entry.
    pub fn register_topic_subscriber(&self, ctx: &RequestContext, subscriber: Arc<dyn TopicSubscriber>) {
        self.register(
            &self.topic_subscribers,
            "topic",
            ctx,
            subscriber,
            |key, value| (key, Some(value)),
            |s, (topic, message)| s.on_message(topic, message),
        );
    }

    pub fn unregister_topic_subscriber(&self, subscriber: &Arc<dyn TopicSubscriber>) {
        self.unregister(&self.topic_subscribers, "topic", subscriber);
    }

    // ── downstream ──────────────────────────────────────────────────────────

    pub fn register_downstream(&self, consumer: Arc<dyn EventConsumer>) {
        if self.is_closed() {
            consumer.on_end_of_subscription();
            return;
        }
        let mut items = self.downstream.write().unwrap_or_else(PoisonError::into_inner);
        if !items.iter().any(|c| same_subscriber(c, &consumer)) {
            items.push(consumer);
            metrics::record_subscriber_registered("downstream");
        }
    }

    pub fn unregister_downstream(&self, consumer: &Arc<dyn EventConsumer>) {
        if self.remove_downstream(consumer) {
            metrics::record_subscriber_removed("downstream", "unregistered");
        }
        consumer.on_end_of_subscription();
    }

    fn remove_downstream(&self, consumer: &Arc<dyn EventConsumer>) -> bool {
        let mut items = self.downstream.write().unwrap_or_else(PoisonError::into_inner);
        let before = items.len();
        items.retain(|c| !same_subscriber(c, consumer));
        items.len() != before
    }

    // ── dispatch ────────────────────────────────────────────────────────────

    /// Deliver `event` to topic, entry, key and downstream listeners in that
    /// order, then forward the new value to a child node named like the key.
    pub fn notify_event(&self, event: &MapEvent) {
        if self.is_closed() {
            return;
        }
        let mut delivered = 0usize;

        for registration in self.topic_subscribers.snapshot() {
            delivered += 1;
            let message = (event.key().to_string(), event.value().map(str::to_string));
            let Some((topic, value)) = registration.hold(message) else {
                continue;
            };
            if registration.subscriber().on_message(topic, value).is_err() {
                self.reject(&self.topic_subscribers, &registration, "topic");
            }
        }

        for registration in self.entry_subscribers.snapshot() {
            delivered += 1;
            let Some(event) = registration.hold(event.clone()) else {
                continue;
            };
            if registration.subscriber().on_message(event).is_err() {
                self.reject(&self.entry_subscribers, &registration, "entry");
            }
        }

        for registration in self.key_subscribers.snapshot() {
            delivered += 1;
            let Some(key) = registration.hold(event.key().to_string()) else {
                continue;
            };
            if registration.subscriber().on_message(key).is_err() {
                self.reject(&self.key_subscribers, &registration, "key");
            }
        }

        let consumers = self.downstream.read().unwrap_or_else(PoisonError::into_inner).clone();
        for consumer in consumers {
            delivered += 1;
            if consumer.accept(event).is_err() && self.remove_downstream(&consumer) {
                warn!(path = %self.path(), kind = "downstream", "Subscriber no longer interested, removed");
                metrics::record_subscriber_removed("downstream", "invalid");
                consumer.on_end_of_subscription();
            }
        }

        if delivered > 0 {
            metrics::record_events_dispatched(delivered);
        }
        trace!(path = %self.path(), key = %event.key(), delivered, "Event dispatched");

        self.forward_to_child(event);
    }

    /// A child named like the key with its own single-value subscription
    /// gets the new value.
    fn forward_to_child(&self, event: &MapEvent) {
        let Some(asset) = self.asset.upgrade() else {
            return;
        };
        let Some(child) = asset.get_child(event.key()) else {
            return;
        };
        if let Some(simple) = child.get::<Arc<SimpleSubscription>>(ViewType::SimpleSubscription) {
            simple.notify(event.value().map(str::to_string));
        }
    }

    // ── bookkeeping ─────────────────────────────────────────────────────────

    pub fn topic_subscriber_count(&self) -> usize {
        self.topic_subscribers.len()
    }

    pub fn key_subscriber_count(&self) -> usize {
        self.key_subscribers.len()
    }

    pub fn entry_subscriber_count(&self) -> usize {
        self.entry_subscribers.len()
    }

    pub fn downstream_count(&self) -> usize {
        self.downstream.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn subscription_count(&self) -> usize {
        self.topic_subscriber_count()
            + self.key_subscriber_count()
            + self.entry_subscriber_count()
            + self.downstream_count()
    }

    pub fn has_subscribers(&self) -> bool {
        self.subscription_count() > 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Closeable for SubscriptionCollection {
    /// End every listener; later registrations end immediately.
    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut ended = 0usize;
        for r in self.topic_subscribers.drain() {
            r.end();
            ended += 1;
        }
        for r in self.entry_subscribers.drain() {
            r.end();
            ended += 1;
        }
        for r in self.key_subscribers.drain() {
            r.end();
            ended += 1;
        }
        let consumers =
            std::mem::take(&mut *self.downstream.write().unwrap_or_else(PoisonError::into_inner));
        for c in consumers {
            c.on_end_of_subscription();
            ended += 1;
        }
        debug!(path = %self.path(), ended, "Subscription collection closed");
    }
}

impl std::fmt::Debug for SubscriptionCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionCollection")
            .field("path", &self.path())
            .field("topic", &self.topic_subscriber_count())
            .field("key", &self.key_subscriber_count())
            .field("entry", &self.entry_subscriber_count())
            .field("downstream", &self.downstream_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InvalidSubscriber;
    use crate::subscription::Delivery;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<MapEvent>>,
        ended: AtomicUsize,
        fail_on: Option<usize>,
    }

    impl Recorder {
        fn failing_on(n: usize) -> Arc<Self> {
            Arc::new(Self {
                fail_on: Some(n),
                ..Default::default()
            })
        }

        fn count(&self) -> usize {
            self.events.lock().unwrap().len()
        }
    }

    impl Subscriber<MapEvent> for Recorder {
        fn on_message(&self, event: MapEvent) -> Delivery {
            let mut events = self.events.lock().unwrap();
            events.push(event);
            if Some(events.len()) == self.fail_on {
                return Err(InvalidSubscriber);
            }
            Ok(())
        }

        fn on_end_of_subscription(&self) {
            self.ended.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn collection() -> SubscriptionCollection {
        // A detached collection: no asset to forward to, no store to replay
        let tree = crate::tree::AssetTree::new(crate::cluster::ClusterContext::standalone(1));
        let asset = tree.acquire_asset("/m").unwrap();
        SubscriptionCollection::new(asset.downgrade())
    }

    fn insert_event(key: &str, value: &str) -> MapEvent {
        MapEvent::Insert {
            asset: "/m".into(),
            key: key.into(),
            value: value.into(),
        }
    }

    #[test]
    fn test_fan_out_isolation() {
        let subs = collection();
        let ctx = RequestContext::for_path("/m");
        let s1 = Recorder::failing_on(2);
        let s2 = Arc::new(Recorder::default());
        subs.register_subscriber(&ctx, s1.clone());
        subs.register_subscriber(&ctx, s2.clone());

        for i in 1..=3 {
            subs.notify_event(&insert_event(&format!("k{}", i), "v"));
        }

        assert_eq!(s1.count(), 2);
        assert_eq!(s1.ended.load(Ordering::SeqCst), 1);
        assert_eq!(s2.count(), 3);
        assert_eq!(s2.ended.load(Ordering::SeqCst), 0);
        assert_eq!(subs.entry_subscriber_count(), 1);
    }

    #[test]
    fn test_unregister_ends_exactly_once() {
        let subs = collection();
        let ctx = RequestContext::for_path("/m");
        let s = Arc::new(Recorder::default());
        let as_dyn: Arc<dyn Subscriber<MapEvent>> = s.clone();
        subs.register_subscriber(&ctx, Arc::clone(&as_dyn));
        assert_eq!(subs.subscription_count(), 1);

        subs.unregister_subscriber(&as_dyn);
        assert_eq!(s.ended.load(Ordering::SeqCst), 1);
        assert!(!subs.has_subscribers());

        // Not registered any more: still ended, immediately
        subs.unregister_subscriber(&as_dyn);
        assert_eq!(s.ended.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_duplicate_registration_is_ignored() {
        let subs = collection();
        let ctx = RequestContext::for_path("/m");
        let s: Arc<dyn Subscriber<MapEvent>> = Arc::new(Recorder::default());
        subs.register_subscriber(&ctx, Arc::clone(&s));
        subs.register_subscriber(&ctx, Arc::clone(&s));
        assert_eq!(subs.entry_subscriber_count(), 1);
    }

    #[test]
    fn test_order_topic_entry_key_downstream() {
        let subs = collection();
        let ctx = RequestContext::builder("/m").bootstrap(false).build();
        let order = Arc::new(Mutex::new(Vec::new()));

        struct Topic(Arc<Mutex<Vec<&'static str>>>);
        impl TopicSubscriber for Topic {
            fn on_message(&self, _: String, _: Option<String>) -> Delivery {
                self.0.lock().unwrap().push("topic");
                Ok(())
            }
        }
        struct Down(Arc<Mutex<Vec<&'static str>>>);
        impl EventConsumer for Down {
            fn accept(&self, _: &MapEvent) -> Delivery {
                self.0.lock().unwrap().push("downstream");
                Ok(())
            }
        }

        let o = Arc::clone(&order);
        subs.register_key_subscriber(
            &ctx,
            crate::subscription::subscriber_fn(move |_: String| {
                o.lock().unwrap().push("key");
                Ok(())
            }),
        );
        subs.register_downstream(Arc::new(Down(Arc::clone(&order))));
        let o = Arc::clone(&order);
        subs.register_subscriber(
            &ctx,
            crate::subscription::subscriber_fn(move |_: MapEvent| {
                o.lock().unwrap().push("entry");
                Ok(())
            }),
        );
        subs.register_topic_subscriber(&ctx, Arc::new(Topic(Arc::clone(&order))));

        subs.notify_event(&insert_event("k", "v"));
        assert_eq!(
            *order.lock().unwrap(),
            vec!["topic", "entry", "key", "downstream"]
        );
    }

    fn map_at(tree: &crate::tree::AssetTree, path: &str) -> Arc<crate::store::MapView> {
        tree.acquire_map(&RequestContext::for_path(path)).unwrap()
    }

    #[test]
    fn test_change_during_bootstrap_follows_replay() {
        let tree = crate::tree::AssetTree::with_default_rules(crate::cluster::ClusterContext::standalone(1));
        let map = map_at(&tree, "/m");
        map.put("a", "1");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let writer = Arc::clone(&map);
        map.register_subscriber(crate::subscription::subscriber_fn(move |e: MapEvent| {
            // Written after the snapshot was read, before the subscriber is live
            if e.key() == "a" {
                writer.put("b", "2");
            }
            sink.lock().unwrap().push((e.key().to_string(), e.value().map(str::to_string)));
            Ok(())
        }));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ("a".to_string(), Some("1".to_string())),
                ("b".to_string(), Some("2".to_string()))
            ]
        );
        map.put("c", "3");
        assert_eq!(seen.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_registration_racing_writer_sees_last_value() {
        for _ in 0..50 {
            let tree = crate::tree::AssetTree::with_default_rules(crate::cluster::ClusterContext::standalone(1));
            let map = map_at(&tree, "/race");
            map.put("k", "0");

            let writer_map = Arc::clone(&map);
            let writer = std::thread::spawn(move || {
                for i in 1..=200 {
                    writer_map.put("k", &i.to_string());
                }
            });

            let latest = Arc::new(Mutex::new(None));
            let sink = Arc::clone(&latest);
            map.register_subscriber(crate::subscription::subscriber_fn(move |e: MapEvent| {
                *sink.lock().unwrap() = e.value().map(str::to_string);
                Ok(())
            }));
            writer.join().unwrap();

            assert_eq!(latest.lock().unwrap().as_deref(), Some("200"));
        }
    }

    #[test]
    fn test_key_and_topic_registration_keep_changes_made_during_replay() {
        let tree = crate::tree::AssetTree::with_default_rules(crate::cluster::ClusterContext::standalone(1));
        let map = map_at(&tree, "/kt");
        map.put("a", "1");
        let ctx = RequestContext::for_path("/kt");

        let keys = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&keys);
        let writer = Arc::clone(&map);
        map.subscription().register_key_subscriber(
            &ctx,
            crate::subscription::subscriber_fn(move |k: String| {
                if k == "a" {
                    writer.put("b", "2");
                }
                sink.lock().unwrap().push(k);
                Ok(())
            }),
        );
        assert_eq!(*keys.lock().unwrap(), vec!["a", "b"]);

        struct Topics(Arc<crate::store::MapView>, Mutex<Vec<(String, Option<String>)>>);
        impl TopicSubscriber for Topics {
            fn on_message(&self, topic: String, message: Option<String>) -> Delivery {
                if topic == "a" {
                    self.0.remove("b");
                }
                self.1.lock().unwrap().push((topic, message));
                Ok(())
            }
        }
        let topics = Arc::new(Topics(Arc::clone(&map), Mutex::new(Vec::new())));
        map.subscription().register_topic_subscriber(&ctx, topics.clone());
        let seen = topics.1.lock().unwrap().clone();
        assert_eq!(seen.last(), Some(&("b".to_string(), None)));
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_close_ends_everyone_and_rejects_new() {
        let subs = collection();
        let ctx = RequestContext::for_path("/m");
        let a = Arc::new(Recorder::default());
        subs.register_subscriber(&ctx, a.clone());

        subs.close();
        assert_eq!(a.ended.load(Ordering::SeqCst), 1);
        assert_eq!(subs.subscription_count(), 0);

        let late = Arc::new(Recorder::default());
        subs.register_subscriber(&ctx, late.clone());
        assert_eq!(late.ended.load(Ordering::SeqCst), 1);
        assert_eq!(subs.subscription_count(), 0);

        // Closing twice does not end anyone again
        subs.close();
        assert_eq!(a.ended.load(Ordering::SeqCst), 1);
    }
}
