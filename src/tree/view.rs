//! View types and type-erased view handles.

use crate::error::TreeError;
use std::any::Any;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Tag identifying a kind of view that can be materialized on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ViewType {
    /// User-facing map facade ([`MapView`](crate::store::MapView)).
    Map,
    /// Underlying key-value store.
    KeyValueStore,
    /// Subscription collection of a map node.
    ObjectSubscription,
    /// Single-value subscription of a child node (one key of the parent map).
    SimpleSubscription,
    /// Replication engine of the node's store.
    Replication,
    /// Reference to one key of the parent map.
    Reference,
    /// Publishes values under the node's name into the parent map.
    Publisher,
    /// Publishes (topic, message) pairs into the node's map.
    TopicPublisher,
    /// Application-defined view.
    Custom(&'static str),
}

impl ViewType {
    /// Query-string selector name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ViewType::Map => "map",
            ViewType::KeyValueStore => "kvstore",
            ViewType::ObjectSubscription => "subscription",
            ViewType::SimpleSubscription => "simpleSubscription",
            ViewType::Replication => "replication",
            ViewType::Reference => "reference",
            ViewType::Publisher => "publisher",
            ViewType::TopicPublisher => "topicPublisher",
            ViewType::Custom(name) => *name,
        }
    }
}

impl fmt::Display for ViewType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ViewType {
    type Err = TreeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "map" => Ok(ViewType::Map),
            "kvstore" | "keyValueStore" => Ok(ViewType::KeyValueStore),
            "subscription" | "objectSubscription" => Ok(ViewType::ObjectSubscription),
            "simpleSubscription" => Ok(ViewType::SimpleSubscription),
            "replication" => Ok(ViewType::Replication),
            "reference" | "ref" => Ok(ViewType::Reference),
            "publisher" => Ok(ViewType::Publisher),
            "topicPublisher" => Ok(ViewType::TopicPublisher),
            other => Err(TreeError::Config(format!("unknown view type '{}'", other))),
        }
    }
}

/// A view with resources to release when its node goes away.
pub trait Closeable: Send + Sync {
    /// Called on every view of a node before any of them is closed.
    fn notify_closing(&self) {}

    fn close(&self);
}

/// Hook run once, after a view wins registration on its node.
pub type RegisteredHook = dyn Fn() + Send + Sync;

/// Type-erased, cheaply cloneable holder of a materialized view.
///
/// The stored value is usually an `Arc<Concrete>` or an `Arc<dyn Trait>`;
/// [`ViewHandle::get`] hands back a clone of it.
#[derive(Clone)]
pub struct ViewHandle {
    value: Arc<dyn Any + Send + Sync>,
    closer: Option<Arc<dyn Closeable>>,
    on_registered: Option<Arc<RegisteredHook>>,
    type_name: &'static str,
}

impl ViewHandle {
    /// Wrap a view that needs no cleanup.
    pub fn new<T>(value: T) -> Self
    where
        T: Clone + Send + Sync + 'static,
    {
        Self {
            value: Arc::new(value),
            closer: None,
            on_registered: None,
            type_name: std::any::type_name::<T>(),
        }
    }

    /// Wrap a view that is closed along with its node.
    pub fn closeable<C>(view: Arc<C>) -> Self
    where
        C: Closeable + 'static,
    {
        let closer: Arc<dyn Closeable> = view.clone();
        Self {
            value: Arc::new(view),
            closer: Some(closer),
            on_registered: None,
            type_name: std::any::type_name::<Arc<C>>(),
        }
    }

    /// Attach a close hook to a handle built with [`ViewHandle::new`].
    pub fn with_closer(mut self, closer: Arc<dyn Closeable>) -> Self {
        self.closer = Some(closer);
        self
    }

    /// Run `hook` once this handle has been registered on its node.
    ///
    /// Views that attach themselves to shared state (stores binding a
    /// replication engine) do it here: a handle that loses a resolution
    /// race is closed without its hook ever running.
    pub fn on_registered(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_registered = Some(Arc::new(hook));
        self
    }

    pub(crate) fn registered(&self) {
        if let Some(hook) = &self.on_registered {
            hook();
        }
    }

    /// Downcast to the stored type, returning a clone.
    pub fn get<T>(&self) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.value.downcast_ref::<T>().cloned()
    }

    /// Whether the handle stores a `T`.
    pub fn is<T: Send + Sync + 'static>(&self) -> bool {
        self.value.is::<T>()
    }

    /// Name of the stored type (diagnostics only).
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub(crate) fn notify_closing(&self) {
        if let Some(closer) = &self.closer {
            closer.notify_closing();
        }
    }

    pub(crate) fn close(&self) {
        if let Some(closer) = &self.closer {
            closer.close();
        }
    }

    /// Whether two handles hold the same view instance.
    pub fn same_view(&self, other: &ViewHandle) -> bool {
        Arc::ptr_eq(&self.value, &other.value)
    }
}

impl fmt::Debug for ViewHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewHandle")
            .field("type", &self.type_name)
            .field("closeable", &self.closer.is_some())
            .field("on_registered", &self.on_registered.is_some())
            .finish()
    }
}
