//! Per-remote dirty-key tracking.
//!
//! A [`ModificationIterator`] remembers which keys of one store still have
//! to be sent to one remote host. It holds keys and stamps only; the value
//! is read from the store when the entry is actually sent, so a key written
//! ten times while the remote was away is sent once with its latest value.

use crate::replication::{current_time_millis, ReplicationEntry};
use crate::store::{ReplicableStore, Stamp};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use tracing::{debug, trace};

/// Callback run whenever an iterator gains dirty entries.
pub type ModificationNotifier = dyn Fn() + Send + Sync;

/// Dirty keys indexed both by key and by stamp.
#[derive(Debug, Default)]
struct DirtySet {
    by_key: HashMap<String, Stamp>,
    ordered: BTreeSet<(Stamp, String)>,
}

impl DirtySet {
    /// Returns whether the set changed.
    fn mark(&mut self, key: &str, stamp: Stamp) -> bool {
        match self.by_key.get(key).copied() {
            Some(existing) if existing >= stamp => false,
            Some(existing) => {
                self.ordered.remove(&(existing, key.to_string()));
                self.ordered.insert((stamp, key.to_string()));
                self.by_key.insert(key.to_string(), stamp);
                true
            }
            None => {
                self.ordered.insert((stamp, key.to_string()));
                self.by_key.insert(key.to_string(), stamp);
                true
            }
        }
    }

    fn first(&self) -> Option<(Stamp, String)> {
        self.ordered.iter().next().cloned()
    }

    /// Clear `key` unless it was re-marked with a stamp newer than `sent`.
    fn clear_up_to(&mut self, key: &str, sent: Stamp) {
        if let Some(stamp) = self.by_key.get(key).copied() {
            if stamp <= sent {
                self.by_key.remove(key);
                self.ordered.remove(&(stamp, key.to_string()));
            }
        }
    }

    fn remove(&mut self, key: &str) {
        if let Some(stamp) = self.by_key.remove(key) {
            self.ordered.remove(&(stamp, key.to_string()));
        }
    }

    fn len(&self) -> usize {
        self.by_key.len()
    }
}

/// Dirty set of one store towards one remote host.
pub struct ModificationIterator {
    remote_identifier: u8,
    dirty: Mutex<DirtySet>,
    /// Highest timestamp handed to a sink (monotonic).
    last_update_time: AtomicU64,
    bootstrap_timestamp: AtomicU64,
    notifier: RwLock<Option<Arc<ModificationNotifier>>>,
    store: RwLock<Option<Weak<dyn ReplicableStore>>>,
}

impl ModificationIterator {
    pub fn new(remote_identifier: u8) -> Self {
        Self {
            remote_identifier,
            dirty: Mutex::new(DirtySet::default()),
            last_update_time: AtomicU64::new(0),
            bootstrap_timestamp: AtomicU64::new(0),
            notifier: RwLock::new(None),
            store: RwLock::new(None),
        }
    }

    pub fn remote_identifier(&self) -> u8 {
        self.remote_identifier
    }

    pub(crate) fn set_store(&self, store: Option<Weak<dyn ReplicableStore>>) {
        *self.store.write().unwrap_or_else(PoisonError::into_inner) = store;
    }

    fn store(&self) -> Option<Arc<dyn ReplicableStore>> {
        self.store
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
    }

    fn dirty(&self) -> std::sync::MutexGuard<'_, DirtySet> {
        self.dirty.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        let notifier = self
            .notifier
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(notifier) = notifier {
            notifier();
        }
    }

    /// Mark `key` as needing to be sent. A stamp older than the one already
    /// recorded for the key is ignored.
    pub fn mark_dirty(&self, key: &str, stamp: Stamp) {
        let changed = self.dirty().mark(key, stamp);
        if changed {
            trace!(remote_id = self.remote_identifier, key = %key, "Marked dirty");
            self.notify();
        }
    }

    pub fn has_next(&self) -> bool {
        self.dirty().len() > 0
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty().len()
    }

    /// Offer the pending entry with the lowest stamp to `sink`.
    ///
    /// Returns `true` if an entry was accepted. An entry whose current stamp
    /// originates from the remote itself is dropped without being offered.
    /// An entry the sink refuses stays dirty.
    pub fn next_entry(&self, sink: &mut dyn FnMut(&ReplicationEntry) -> bool) -> bool {
        let Some(store) = self.store() else {
            return false;
        };
        loop {
            let Some((_, key)) = self.dirty().first() else {
                return false;
            };
            let Some(mut entry) = store.replication_entry(&key) else {
                self.dirty().remove(&key);
                continue;
            };
            if entry.identifier == self.remote_identifier {
                self.dirty().clear_up_to(&key, entry.stamp());
                continue;
            }

            entry.bootstrap_timestamp = self.bootstrap_timestamp.load(Ordering::Acquire);
            if !sink(&entry) {
                return false;
            }
            self.dirty().clear_up_to(&key, entry.stamp());
            self.last_update_time
                .fetch_max(entry.timestamp, Ordering::AcqRel);
            return true;
        }
    }

    /// Mark every stored entry (tombstones included) with a timestamp at or
    /// after `from_time` dirty, except entries originating from the remote.
    ///
    /// Returns the number of entries marked.
    pub fn dirty_entries(&self, from_time: u64) -> usize {
        let Some(store) = self.store() else {
            return 0;
        };
        self.bootstrap_timestamp
            .store(current_time_millis(), Ordering::Release);

        let mut marked = 0;
        for segment in 0..store.segments() {
            let mut candidates = Vec::new();
            store.stamped_entries_for(segment, &mut |key, stamp| {
                if stamp.timestamp >= from_time && stamp.identifier != self.remote_identifier {
                    candidates.push((key.to_string(), stamp));
                }
            });
            let mut dirty = self.dirty();
            for (key, stamp) in candidates {
                if dirty.mark(&key, stamp) {
                    marked += 1;
                }
            }
        }
        debug!(
            remote_id = self.remote_identifier,
            from_time,
            marked,
            "Bootstrap marked entries dirty"
        );
        if marked > 0 {
            self.notify();
        }
        marked
    }

    /// Highest timestamp delivered to this remote so far.
    pub fn last_update_time(&self) -> u64 {
        self.last_update_time.load(Ordering::Acquire)
    }

    pub fn bootstrap_timestamp(&self) -> u64 {
        self.bootstrap_timestamp.load(Ordering::Acquire)
    }

    pub fn set_modification_notifier(&self, notifier: Arc<ModificationNotifier>) {
        *self.notifier.write().unwrap_or_else(PoisonError::into_inner) = Some(notifier);
        if self.has_next() {
            self.notify();
        }
    }

    pub fn clear_modification_notifier(&self) {
        *self.notifier.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl std::fmt::Debug for ModificationIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModificationIterator")
            .field("remote_identifier", &self.remote_identifier)
            .field("dirty", &self.dirty_count())
            .field("last_update_time", &self.last_update_time())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterContext;
    use crate::context::RequestContext;
    use crate::store::{KeyValueStore, MemoryKeyValueStore};
    use crate::subscription::SubscriptionCollection;
    use crate::tree::AssetTree;
    use std::sync::atomic::AtomicUsize;

    fn store(local: u8) -> (AssetTree, Arc<MemoryKeyValueStore>) {
        let tree = AssetTree::new(ClusterContext::standalone(local));
        let asset = tree.acquire_asset("/it").unwrap();
        let subscription = Arc::new(SubscriptionCollection::new(asset.downgrade()));
        let store = MemoryKeyValueStore::new(&RequestContext::for_path("/it"), local, subscription);
        (tree, store)
    }

    fn iterator_for(store: &Arc<MemoryKeyValueStore>, remote: u8) -> ModificationIterator {
        let iterator = ModificationIterator::new(remote);
        let shared: Arc<dyn ReplicableStore> = store.clone();
        iterator.set_store(Some(Arc::downgrade(&shared)));
        iterator
    }

    fn drain(iterator: &ModificationIterator) -> Vec<ReplicationEntry> {
        let mut out = Vec::new();
        while iterator.next_entry(&mut |e| {
            out.push(e.clone());
            true
        }) {}
        out
    }

    #[test]
    fn test_yields_lowest_stamp_first() {
        let (_tree, store) = store(1);
        store.put("b", "2");
        store.put("a", "1");
        let iterator = iterator_for(&store, 2);
        iterator.mark_dirty("b", store.entry_stamp("b").unwrap());
        iterator.mark_dirty("a", store.entry_stamp("a").unwrap());

        let sent = drain(&iterator);
        let keys: Vec<_> = sent.iter().map(|e| e.key.as_str()).collect();
        let stamps: Vec<_> = sent.iter().map(|e| e.stamp()).collect();
        assert_eq!(keys.len(), 2);
        assert!(stamps[0] <= stamps[1]);
        assert!(!iterator.has_next());
    }

    #[test]
    fn test_refused_entry_stays_dirty() {
        let (_tree, store) = store(1);
        store.put("k", "v");
        let iterator = iterator_for(&store, 2);
        iterator.mark_dirty("k", store.entry_stamp("k").unwrap());

        assert!(!iterator.next_entry(&mut |_| false));
        assert!(iterator.has_next());
        assert_eq!(iterator.last_update_time(), 0);

        assert!(iterator.next_entry(&mut |_| true));
        assert!(!iterator.has_next());
        assert_eq!(iterator.last_update_time(), store.entry_stamp("k").unwrap().timestamp);
    }

    #[test]
    fn test_skips_entries_from_remote() {
        let (_tree, store) = store(1);
        store.apply_replication(&ReplicationEntry::put("theirs", "x", Stamp::new(5, 2)));
        store.put("mine", "y");
        let iterator = iterator_for(&store, 2);
        iterator.mark_dirty("theirs", Stamp::new(5, 2));
        iterator.mark_dirty("mine", store.entry_stamp("mine").unwrap());

        let sent = drain(&iterator);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].key, "mine");
    }

    #[test]
    fn test_dirty_entries_from_time() {
        let (_tree, store) = store(1);
        store.apply_replication(&ReplicationEntry::put("old", "1", Stamp::new(10, 3)));
        store.apply_replication(&ReplicationEntry::put("new", "2", Stamp::new(20, 3)));
        store.apply_replication(&ReplicationEntry::tombstone("gone", Stamp::new(30, 3)));
        store.apply_replication(&ReplicationEntry::put("echo", "4", Stamp::new(40, 2)));

        let iterator = iterator_for(&store, 2);
        assert_eq!(iterator.dirty_entries(20), 2);
        assert!(iterator.bootstrap_timestamp() > 0);

        let sent = drain(&iterator);
        assert_eq!(sent[0].key, "new");
        assert_eq!(sent[1].key, "gone");
        assert!(sent[1].is_deleted);
        assert!(sent.iter().all(|e| e.bootstrap_timestamp > 0));
    }

    #[test]
    fn test_notifier_runs_on_mark() {
        let (_tree, store) = store(1);
        let iterator = iterator_for(&store, 2);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        iterator.set_modification_notifier(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        iterator.mark_dirty("k", Stamp::new(5, 1));
        // Same or older stamp changes nothing
        iterator.mark_dirty("k", Stamp::new(4, 1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        iterator.clear_modification_notifier();
        iterator.mark_dirty("k", Stamp::new(6, 1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_missing_key_is_dropped() {
        let (_tree, store) = store(1);
        let iterator = iterator_for(&store, 2);
        iterator.mark_dirty("never-written", Stamp::new(1, 1));
        assert!(!iterator.next_entry(&mut |_| true));
        assert!(!iterator.has_next());
    }

    #[test]
    fn test_no_store_yields_nothing() {
        let iterator = ModificationIterator::new(2);
        iterator.mark_dirty("k", Stamp::new(1, 1));
        assert!(!iterator.next_entry(&mut |_| true));
        assert_eq!(iterator.dirty_entries(0), 0);
        assert!(iterator.has_next());
    }
}
