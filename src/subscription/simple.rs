use super::registration::{Admission, Listener, Registration, Registrations};
use super::Subscriber;
use crate::context::RequestContext;
use crate::metrics;
use crate::store::KeyValueStore;
use crate::tree::Closeable;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

type ValueSubscriber = dyn Subscriber<Option<String>>;

/// Single-value subscription of a child node: follows one key of the
/// parent map.
///
/// The parent's [`SubscriptionCollection`](super::SubscriptionCollection)
/// forwards every change of the key here; no separate index is kept.
pub struct SimpleSubscription {
    key: String,
    path: String,
    parent_store: Weak<dyn KeyValueStore>,
    subscribers: Registrations<ValueSubscriber, Option<String>>,
    closed: AtomicBool,
}

impl SimpleSubscription {
    pub fn new(path: impl Into<String>, key: impl Into<String>, parent_store: Weak<dyn KeyValueStore>) -> Self {
        Self {
            key: key.into(),
            path: path.into(),
            parent_store,
            subscribers: Registrations::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// The parent-map key this subscription follows.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current value of the key in the parent map.
    pub fn current_value(&self) -> Option<String> {
        self.parent_store.upgrade()?.get(&self.key)
    }

    /// Register a subscriber; with bootstrap it first receives the current
    /// value (`None` if the key is absent), followed by any change made
    /// while that value was being read.
    pub fn register_subscriber(&self, ctx: &RequestContext, subscriber: Arc<ValueSubscriber>) {
        if ctx.end_subscription_after_bootstrap() {
            if ctx.bootstrap() {
                let _ = subscriber.on_message(self.current_value());
            }
            subscriber.end();
            return;
        }

        let registration = Registration::new(Arc::clone(&subscriber));
        match self.subscribers.admit(&registration, &self.closed) {
            Admission::Admitted => metrics::record_subscriber_registered("simple"),
            Admission::Duplicate => return,
            Admission::Closed => {
                subscriber.end();
                return;
            }
        }

        let bootstrapped = !ctx.bootstrap() || subscriber.on_message(self.current_value()).is_ok();
        if !bootstrapped || registration.go_live(|s, v| s.on_message(v)).is_err() {
            self.reject(&registration);
            return;
        }
        debug!(path = %self.path, "Value subscriber registered");
    }

    pub fn unregister_subscriber(&self, subscriber: &Arc<ValueSubscriber>) {
        match self.subscribers.remove(subscriber) {
            Some(registration) => {
                metrics::record_subscriber_removed("simple", "unregistered");
                registration.end();
            }
            None => subscriber.end(),
        }
    }

    fn reject(&self, registration: &Arc<Registration<ValueSubscriber, Option<String>>>) {
        if self.subscribers.remove(registration.subscriber()).is_some() {
            warn!(path = %self.path, "Value subscriber no longer interested, removed");
            metrics::record_subscriber_removed("simple", "invalid");
        }
        registration.end();
    }

    /// Deliver a new value (`None` when the key was removed).
    pub fn notify(&self, value: Option<String>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        for registration in self.subscribers.snapshot() {
            let Some(value) = registration.hold(value.clone()) else {
                continue;
            };
            if registration.subscriber().on_message(value).is_err() {
                self.reject(&registration);
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl Closeable for SimpleSubscription {
    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for registration in self.subscribers.drain() {
            registration.end();
        }
    }
}

impl std::fmt::Debug for SimpleSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimpleSubscription")
            .field("path", &self.path)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
