// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication engine of one store.
//!
//! The engine is the `replication` view of a store's node. It owns one
//! [`ModificationIterator`] per remote host and the last modification time
//! received from each of them.
//!
//! # Lifecycle
//!
//! ```text
//! new() ──→ bind_store() ──→ (sessions stream) ──→ detach() ──→ close()
//! ```
//!
//! `detach()` clears every iterator's notifier before releasing the store so
//! no event-loop wake-up races the store's teardown.

use super::{ModificationIterator, ReplicationEntry};
use crate::error::{Result, TreeError};
use crate::metrics;
use crate::store::{ApplyOutcome, ReplicableStore, Stamp};
use crate::tree::Closeable;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use tracing::{debug, info, trace};

/// Replication state of one store towards every remote host.
pub struct ReplicationEngine {
    path: String,
    local_identifier: u8,
    store: RwLock<Option<Weak<dyn ReplicableStore>>>,
    iterators: DashMap<u8, Arc<ModificationIterator>>,
    /// Last modification time received from each remote (monotonic).
    last_modification: DashMap<u8, u64>,
    closed: AtomicBool,
}

impl ReplicationEngine {
    /// Create an engine for `path`, with iterators for the known `remotes`.
    pub fn new(path: impl Into<String>, local_identifier: u8, remotes: &[u8]) -> Self {
        let iterators = DashMap::new();
        for &remote in remotes.iter().filter(|&&r| r != local_identifier) {
            iterators.insert(remote, Arc::new(ModificationIterator::new(remote)));
        }
        Self {
            path: path.into(),
            local_identifier,
            store: RwLock::new(None),
            iterators,
            last_modification: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn local_identifier(&self) -> u8 {
        self.local_identifier
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Remote identifiers with an iterator, sorted.
    pub fn remote_identifiers(&self) -> Vec<u8> {
        let mut ids: Vec<u8> = self.iterators.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Bind the store this engine replicates.
    pub fn bind_store(&self, store: Weak<dyn ReplicableStore>) {
        *self.store.write().unwrap_or_else(PoisonError::into_inner) = Some(store.clone());
        for iterator in self.iterator_snapshot() {
            iterator.set_store(Some(store.clone()));
        }
        info!(path = %self.path, local_id = self.local_identifier, "Replication engine bound");
    }

    pub fn store(&self) -> Option<Arc<dyn ReplicableStore>> {
        self.store
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
    }

    /// Release the store. Notifiers are cleared first.
    pub fn detach(&self) {
        let iterators = self.iterator_snapshot();
        for iterator in &iterators {
            iterator.clear_modification_notifier();
        }
        for iterator in &iterators {
            iterator.set_store(None);
        }
        *self.store.write().unwrap_or_else(PoisonError::into_inner) = None;
        debug!(path = %self.path, "Replication engine detached");
    }

    fn iterator_snapshot(&self) -> Vec<Arc<ModificationIterator>> {
        self.iterators.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Iterator towards `remote`, created on first use.
    pub fn acquire_modification_iterator(&self, remote: u8) -> Result<Arc<ModificationIterator>> {
        if self.is_closed() {
            return Err(TreeError::Shutdown);
        }
        if remote == self.local_identifier {
            return Err(TreeError::InvalidState {
                expected: "remote identifier".to_string(),
                actual: format!("local identifier {}", remote),
            });
        }
        let iterator = self
            .iterators
            .entry(remote)
            .or_insert_with(|| {
                let iterator = ModificationIterator::new(remote);
                let store = self
                    .store
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                iterator.set_store(store);
                Arc::new(iterator)
            })
            .clone();
        Ok(iterator)
    }

    /// Mark `key` dirty towards every remote except `origin`.
    fn mark_all_except(&self, key: &str, stamp: Stamp, origin: u8) {
        for iterator in self.iterator_snapshot() {
            if iterator.remote_identifier() != origin {
                iterator.mark_dirty(key, stamp);
            }
        }
    }

    /// A local write happened.
    pub fn on_local_change(&self, key: &str, stamp: Stamp) {
        if self.is_closed() {
            return;
        }
        self.mark_all_except(key, stamp, stamp.identifier);
    }

    /// Apply an entry received from a remote host.
    ///
    /// Entries carrying the local identifier are dropped. An applied entry
    /// is relayed to every remote other than its origin.
    pub fn apply_replication(&self, entry: &ReplicationEntry) -> Result<ApplyOutcome> {
        if self.is_closed() {
            return Err(TreeError::Shutdown);
        }
        if entry.identifier == self.local_identifier {
            trace!(path = %self.path, key = %entry.key, "Dropping echoed entry");
            metrics::record_entry_applied(ApplyOutcome::Echo.as_str());
            return Ok(ApplyOutcome::Echo);
        }
        let store = self.store().ok_or_else(|| TreeError::InvalidState {
            expected: "bound store".to_string(),
            actual: "no store".to_string(),
        })?;

        let outcome = store.apply_replication(entry);
        if outcome == ApplyOutcome::Applied {
            self.mark_all_except(&entry.key, entry.stamp(), entry.identifier);
        }
        trace!(
            path = %self.path,
            key = %entry.key,
            origin = entry.identifier,
            outcome = outcome.as_str(),
            "Replication entry"
        );
        metrics::record_entry_applied(outcome.as_str());
        Ok(outcome)
    }

    /// Last modification time received from `remote` (0 if none).
    pub fn last_modification_time(&self, remote: u8) -> u64 {
        self.last_modification.get(&remote).map_or(0, |t| *t)
    }

    /// Record a modification time from `remote`; never moves backwards.
    pub fn set_last_modification_time(&self, remote: u8, time: u64) {
        self.last_modification
            .entry(remote)
            .and_modify(|t| *t = (*t).max(time))
            .or_insert(time);
    }
}

impl Closeable for ReplicationEngine {
    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.detach();
        self.iterators.clear();
        debug!(path = %self.path, "Replication engine closed");
    }
}

impl std::fmt::Debug for ReplicationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationEngine")
            .field("path", &self.path)
            .field("local_identifier", &self.local_identifier)
            .field("remotes", &self.remote_identifiers())
            .field("closed", &self.is_closed())
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

    fn bound(local: u8, remotes: &[u8]) -> (AssetTree, Arc<MemoryKeyValueStore>, ReplicationEngine) {
        let tree = AssetTree::new(ClusterContext::standalone(local));
        let asset = tree.acquire_asset("/e").unwrap();
        let subscription = Arc::new(SubscriptionCollection::new(asset.downgrade()));
        let store = MemoryKeyValueStore::new(&RequestContext::for_path("/e"), local, subscription);
        let engine = ReplicationEngine::new("/e", local, remotes);
        let shared: Arc<dyn ReplicableStore> = store.clone();
        engine.bind_store(Arc::downgrade(&shared));
        (tree, store, engine)
    }

    #[test]
    fn test_local_change_marks_every_remote() {
        let (_tree, store, engine) = bound(1, &[1, 2, 3]);
        assert_eq!(engine.remote_identifiers(), vec![2, 3]);

        store.put("k", "v");
        engine.on_local_change("k", store.entry_stamp("k").unwrap());
        for remote in [2, 3] {
            assert!(engine.acquire_modification_iterator(remote).unwrap().has_next());
        }
    }

    #[test]
    fn test_echo_is_dropped() {
        let (_tree, store, engine) = bound(1, &[2]);
        let entry = ReplicationEntry::put("k", "v", Stamp::new(5, 1));
        assert_eq!(engine.apply_replication(&entry).unwrap(), ApplyOutcome::Echo);
        assert_eq!(store.get("k"), None);
    }

    #[test]
    fn test_relay_skips_origin() {
        let (_tree, store, engine) = bound(1, &[2, 3]);
        let entry = ReplicationEntry::put("k", "v", Stamp::new(5, 2));
        assert_eq!(engine.apply_replication(&entry).unwrap(), ApplyOutcome::Applied);
        assert_eq!(store.get("k"), Some("v".to_string()));

        assert!(!engine.acquire_modification_iterator(2).unwrap().has_next());
        assert!(engine.acquire_modification_iterator(3).unwrap().has_next());

        // Re-delivery is a no-op
        assert_eq!(engine.apply_replication(&entry).unwrap(), ApplyOutcome::Duplicate);
    }

    #[test]
    fn test_last_modification_time_is_monotonic() {
        let (_tree, _store, engine) = bound(1, &[2]);
        assert_eq!(engine.last_modification_time(2), 0);
        engine.set_last_modification_time(2, 100);
        engine.set_last_modification_time(2, 50);
        assert_eq!(engine.last_modification_time(2), 100);
    }

    #[test]
    fn test_iterator_for_local_identifier_rejected() {
        let (_tree, _store, engine) = bound(1, &[2]);
        assert!(engine.acquire_modification_iterator(1).is_err());
        // Unknown remotes get an iterator on demand
        let late = engine.acquire_modification_iterator(9).unwrap();
        assert_eq!(late.remote_identifier(), 9);
    }

    #[test]
    fn test_close_releases_everything() {
        let (_tree, store, engine) = bound(1, &[2]);
        engine.close();
        assert!(engine.is_closed());
        assert!(engine.store().is_none());
        assert!(engine.acquire_modification_iterator(2).is_err());
        let entry = ReplicationEntry::put("k", "v", Stamp::new(5, 2));
        assert!(matches!(engine.apply_replication(&entry), Err(TreeError::Shutdown)));
        assert_eq!(store.get("k"), None);
    }
}
