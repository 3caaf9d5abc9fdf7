//! Key-value stores and the views layered on them.
//!
//! - [`KeyValueStore`]: the underlying store contract (the `kvstore` view)
//! - [`ReplicableStore`]: the hooks replication needs on top of it
//! - [`MemoryKeyValueStore`]: segmented in-memory implementation
//! - [`MapView`]: user-facing map facade (the `map` view)
//! - [`Reference`], [`Publisher`], [`TopicPublisher`]: views addressing one
//!   key of a map
//!
//! Keys and values are strings; the request context carries the type
//! names so rules can tell maps apart.

mod map_view;
mod memory;
mod reference;

pub use map_view::MapView;
pub use memory::MemoryKeyValueStore;
pub use reference::{Publisher, Reference, TopicPublisher};

use crate::replication::ReplicationEntry;
use crate::subscription::SubscriptionCollection;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// `(timestamp, identifier)` version of an entry. Higher wins; the
/// identifier breaks timestamp ties deterministically.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Stamp {
    /// Milliseconds since the Unix epoch (or later, see local stamping).
    pub timestamp: u64,
    /// Host that produced the write.
    pub identifier: u8,
}

impl Stamp {
    pub fn new(timestamp: u64, identifier: u8) -> Self {
        Self {
            timestamp,
            identifier,
        }
    }
}

/// Result of applying a replicated entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Entry was newer and is now stored.
    Applied,
    /// Same stamp already stored (re-delivery).
    Duplicate,
    /// An entry with a higher stamp is already stored.
    Stale,
    /// Entry originated on this host and was dropped.
    Echo,
}

impl ApplyOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyOutcome::Applied => "applied",
            ApplyOutcome::Duplicate => "duplicate",
            ApplyOutcome::Stale => "stale",
            ApplyOutcome::Echo => "echo",
        }
    }
}

/// Underlying store contract.
///
/// Mutations are synchronous. Listeners and replication are notified after
/// the store's own locks are released.
pub trait KeyValueStore: Send + Sync {
    fn put(&self, key: &str, value: &str);

    /// Put, returning the previous value.
    fn get_and_put(&self, key: &str, value: &str) -> Option<String>;

    fn remove(&self, key: &str);

    /// Remove, returning the previous value.
    fn get_and_remove(&self, key: &str) -> Option<String>;

    fn get(&self, key: &str) -> Option<String>;

    fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Number of live entries.
    fn long_size(&self) -> u64;

    /// Number of segments for bootstrap iteration.
    fn segments(&self) -> usize;

    /// Visit the live keys of one segment.
    fn keys_for(&self, segment: usize, f: &mut dyn FnMut(&str));

    /// Visit the live entries of one segment.
    fn entries_for(&self, segment: usize, f: &mut dyn FnMut(&str, &str));

    /// Remove every entry (each removal is a normal, notified mutation).
    fn clear(&self);

    /// Collection notified of every mutation.
    fn subscription(&self) -> Arc<SubscriptionCollection>;
}

/// Replication hooks of a store.
pub trait ReplicableStore: KeyValueStore {
    /// Apply a remote entry under the conflict rule: it is stored only if its
    /// stamp is strictly greater than the stored one.
    fn apply_replication(&self, entry: &ReplicationEntry) -> ApplyOutcome;

    fn entry_stamp(&self, key: &str) -> Option<Stamp>;

    /// Current state of `key` as a replication entry (tombstones included).
    fn replication_entry(&self, key: &str) -> Option<ReplicationEntry>;

    /// Visit every entry of one segment with its stamp, tombstones included.
    fn stamped_entries_for(&self, segment: usize, f: &mut dyn FnMut(&str, Stamp));
}
