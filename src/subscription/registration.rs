//! Listener registrations with held-back live delivery.
//!
//! A listener joins its live set before its bootstrap snapshot is read, so
//! no change can fall between the snapshot and going live. Changes that
//! arrive while the replay runs are queued on the registration and
//! delivered after it, in arrival order. A change can therefore be seen
//! twice (once in the snapshot, once live) but never missed.

use super::{same_subscriber, Delivery, Subscriber, TopicSubscriber};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// A listener that can be told its subscription ended.
pub(crate) trait Listener {
    fn end(&self);
}

impl<T> Listener for dyn Subscriber<T> {
    fn end(&self) {
        self.on_end_of_subscription();
    }
}

impl Listener for dyn TopicSubscriber {
    fn end(&self) {
        self.on_end_of_subscription();
    }
}

/// One registered listener.
pub(crate) struct Registration<S: ?Sized, M> {
    subscriber: Arc<S>,
    /// `Some` while the bootstrap replay runs
    held: Mutex<Option<Vec<M>>>,
    ended: AtomicBool,
}

impl<S: ?Sized + Listener, M> Registration<S, M> {
    /// A registration that holds live messages until [`go_live`](Self::go_live).
    pub(crate) fn new(subscriber: Arc<S>) -> Arc<Self> {
        Arc::new(Self {
            subscriber,
            held: Mutex::new(Some(Vec::new())),
            ended: AtomicBool::new(false),
        })
    }

    pub(crate) fn subscriber(&self) -> &Arc<S> {
        &self.subscriber
    }

    /// Queue `message` while the replay runs; otherwise hand it back for
    /// direct delivery.
    pub(crate) fn hold(&self, message: M) -> Option<M> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        match held.as_mut() {
            Some(queue) => {
                queue.push(message);
                None
            }
            None => Some(message),
        }
    }

    /// Deliver queued messages until the queue stays empty, then switch to
    /// direct delivery. Stops at the first refused message.
    pub(crate) fn go_live(&self, mut deliver: impl FnMut(&S, M) -> Delivery) -> Delivery {
        loop {
            let batch = {
                let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
                match held.as_mut() {
                    Some(queue) if !queue.is_empty() => std::mem::take(queue),
                    _ => {
                        *held = None;
                        return Ok(());
                    }
                }
            };
            for message in batch {
                deliver(&self.subscriber, message)?;
            }
        }
    }

    /// End the subscription. Only the first call reaches the listener.
    pub(crate) fn end(&self) {
        if !self.ended.swap(true, Ordering::AcqRel) {
            self.subscriber.end();
        }
    }
}

/// Result of [`Registrations::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    Admitted,
    Duplicate,
    Closed,
}

/// The live set of one listener kind.
pub(crate) struct Registrations<S: ?Sized, M> {
    items: RwLock<Vec<Arc<Registration<S, M>>>>,
}

impl<S: ?Sized + Listener, M> Registrations<S, M> {
    pub(crate) fn new() -> Self {
        Self {
            items: RwLock::new(Vec::new()),
        }
    }

    /// Add `registration` unless its listener is already present or the
    /// owner is closed. `closed` is read under the set's write lock, so a
    /// concurrent close either rejects the registration or drains it.
    pub(crate) fn admit(&self, registration: &Arc<Registration<S, M>>, closed: &AtomicBool) -> Admission {
        let mut items = self.items.write().unwrap_or_else(PoisonError::into_inner);
        if closed.load(Ordering::Acquire) {
            return Admission::Closed;
        }
        if items
            .iter()
            .any(|r| same_subscriber(&r.subscriber, &registration.subscriber))
        {
            return Admission::Duplicate;
        }
        items.push(Arc::clone(registration));
        Admission::Admitted
    }

    pub(crate) fn remove(&self, subscriber: &Arc<S>) -> Option<Arc<Registration<S, M>>> {
        let mut items = self.items.write().unwrap_or_else(PoisonError::into_inner);
        let index = items
            .iter()
            .position(|r| same_subscriber(&r.subscriber, subscriber))?;
        Some(items.remove(index))
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<Registration<S, M>>> {
        self.items.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn drain(&self) -> Vec<Arc<Registration<S, M>>> {
        std::mem::take(&mut *self.items.write().unwrap_or_else(PoisonError::into_inner))
    }

    pub(crate) fn len(&self) -> usize {
        self.items.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}
