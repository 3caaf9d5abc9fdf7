// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Segmented in-memory store with replication stamps.
//!
//! # Locking
//!
//! Each segment is an `RwLock<HashMap>`. A mutation holds its segment's
//! write lock only to read the previous entry and store the new one. Event
//! fan-out and replication dirty-marking run after the lock is released, so
//! a subscriber may read or even write the store from its callback.
//!
//! # Stamps
//!
//! Every entry, tombstones included, carries the [`Stamp`] of the write that
//! produced it. A local write is stamped `max(now, previous + 1)` with the
//! local identifier, so it always supersedes what it overwrites even when a
//! remote host's clock runs ahead.

use super::{ApplyOutcome, KeyValueStore, ReplicableStore, Stamp};
use crate::context::RequestContext;
use crate::error::TreeError;
use crate::metrics;
use crate::replication::{current_time_millis, ReplicationEngine, ReplicationEntry};
use crate::subscription::{MapEvent, SubscriptionCollection};
use crate::tree::{Asset, Closeable, ViewType};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use tracing::{debug, info, warn};

const DEFAULT_SEGMENTS: usize = 16;
const MAX_SEGMENTS: usize = 64;
const ENTRIES_PER_SEGMENT_HINT: u64 = 1024;

#[derive(Debug, Clone)]
struct StoredEntry {
    /// `None` is a tombstone.
    value: Option<String>,
    stamp: Stamp,
}

type Segment = RwLock<HashMap<String, StoredEntry>>;

/// In-memory [`KeyValueStore`] and [`ReplicableStore`].
pub struct MemoryKeyValueStore {
    path: String,
    local_identifier: u8,
    segments: Vec<Segment>,
    live: AtomicU64,
    subscription: Arc<SubscriptionCollection>,
    replication: RwLock<Option<Arc<ReplicationEngine>>>,
    attached: AtomicBool,
    closed: AtomicBool,
    this: Weak<MemoryKeyValueStore>,
}

fn segment_count(entries: Option<u64>) -> usize {
    match entries {
        Some(n) => ((n / ENTRIES_PER_SEGMENT_HINT).next_power_of_two() as usize).clamp(1, MAX_SEGMENTS),
        None => DEFAULT_SEGMENTS,
    }
}

impl MemoryKeyValueStore {
    /// Create a store for `ctx.full_name()`, sized from the `entries` hint.
    ///
    /// The store is inert until [`MemoryKeyValueStore::attach`] wires it to
    /// its subscription collection and replication engine.
    pub fn new(
        ctx: &RequestContext,
        local_identifier: u8,
        subscription: Arc<SubscriptionCollection>,
    ) -> Arc<Self> {
        let segments = segment_count(ctx.entries());
        Arc::new_cyclic(|this| Self {
            path: ctx.full_name().to_string(),
            local_identifier,
            segments: (0..segments).map(|_| RwLock::new(HashMap::new())).collect(),
            live: AtomicU64::new(0),
            subscription,
            replication: RwLock::new(None),
            attached: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            this: this.clone(),
        })
    }

    /// Become the store of `asset`: feed bootstrap to the subscription
    /// collection and, when the context names a cluster, bind the asset's
    /// replication engine.
    ///
    /// Replication that cannot be set up is logged; the store keeps working
    /// unreplicated.
    pub fn attach(&self, ctx: &RequestContext, asset: &Asset) {
        if self.attached.swap(true, Ordering::AcqRel) {
            return;
        }
        let this: Weak<dyn KeyValueStore> = self.this.clone();
        self.subscription.set_kv_store(this);

        let Some(cluster) = ctx.cluster() else {
            debug!(path = %self.path, "Store created without replication");
            return;
        };
        match self.attach_replication(ctx, asset) {
            Ok(engine) => {
                info!(
                    path = %self.path,
                    cluster = %cluster,
                    local_id = engine.local_identifier(),
                    "Store replicated"
                );
            }
            Err(e) => {
                warn!(path = %self.path, cluster = %cluster, error = %e, "Replication unavailable, store runs unreplicated");
                metrics::record_replication_unavailable();
            }
        }
    }

    fn attach_replication(
        &self,
        ctx: &RequestContext,
        asset: &Asset,
    ) -> crate::error::Result<Arc<ReplicationEngine>> {
        let engine: Arc<ReplicationEngine> = asset
            .acquire(ViewType::Replication, ctx)
            .map_err(|e| TreeError::ReplicationUnavailable {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;
        let this: Weak<dyn ReplicableStore> = self.this.clone();
        engine.bind_store(this);
        *self.replication.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&engine));
        Ok(engine)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn local_identifier(&self) -> u8 {
        self.local_identifier
    }

    pub fn replication(&self) -> Option<Arc<ReplicationEngine>> {
        self.replication
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_replicated(&self) -> bool {
        self.replication().is_some()
    }

    fn segment_of(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.segments.len() as u64) as usize
    }

    fn read(&self, segment: usize) -> Option<RwLockReadGuard<'_, HashMap<String, StoredEntry>>> {
        self.segments
            .get(segment)
            .map(|s| s.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn write_segment(&self, key: &str) -> RwLockWriteGuard<'_, HashMap<String, StoredEntry>> {
        self.segments[self.segment_of(key)]
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn adjust_live(&self, was_live: bool, is_live: bool) {
        match (was_live, is_live) {
            (false, true) => {
                self.live.fetch_add(1, Ordering::Relaxed);
            }
            (true, false) => {
                self.live.fetch_sub(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    /// Local mutation; `None` removes. Returns the previous value.
    fn write_local(&self, key: &str, value: Option<&str>) -> Option<String> {
        let (old, stamp) = {
            let mut segment = self.write_segment(key);
            let previous = segment.get(key);
            let old = previous.and_then(|e| e.value.clone());
            if value.is_none() && old.is_none() {
                return None;
            }
            let floor = previous.map_or(0, |e| e.stamp.timestamp + 1);
            let stamp = Stamp::new(current_time_millis().max(floor), self.local_identifier);
            segment.insert(
                key.to_string(),
                StoredEntry {
                    value: value.map(str::to_string),
                    stamp,
                },
            );
            (old, stamp)
        };
        self.adjust_live(old.is_some(), value.is_some());

        if let Some(event) =
            MapEvent::between(&self.path, key, old.clone(), value.map(str::to_string))
        {
            self.subscription.notify_event(&event);
        }
        if let Some(engine) = self.replication() {
            engine.on_local_change(key, stamp);
        }
        old
    }

    fn live_snapshot(&self, segment: usize) -> Vec<(String, String)> {
        self.read(segment)
            .map(|map| {
                map.iter()
                    .filter_map(|(k, e)| e.value.as_ref().map(|v| (k.clone(), v.clone())))
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn put(&self, key: &str, value: &str) {
        self.write_local(key, Some(value));
    }

    fn get_and_put(&self, key: &str, value: &str) -> Option<String> {
        self.write_local(key, Some(value))
    }

    fn remove(&self, key: &str) {
        self.write_local(key, None);
    }

    fn get_and_remove(&self, key: &str) -> Option<String> {
        self.write_local(key, None)
    }

    fn get(&self, key: &str) -> Option<String> {
        self.read(self.segment_of(key))?.get(key)?.value.clone()
    }

    fn long_size(&self) -> u64 {
        self.live.load(Ordering::Relaxed)
    }

    fn segments(&self) -> usize {
        self.segments.len()
    }

    fn keys_for(&self, segment: usize, f: &mut dyn FnMut(&str)) {
        for (key, _) in self.live_snapshot(segment) {
            f(&key);
        }
    }

    fn entries_for(&self, segment: usize, f: &mut dyn FnMut(&str, &str)) {
        for (key, value) in self.live_snapshot(segment) {
            f(&key, &value);
        }
    }

    fn clear(&self) {
        for segment in 0..self.segments.len() {
            for (key, _) in self.live_snapshot(segment) {
                self.write_local(&key, None);
            }
        }
    }

    fn subscription(&self) -> Arc<SubscriptionCollection> {
        Arc::clone(&self.subscription)
    }
}

impl ReplicableStore for MemoryKeyValueStore {
    fn apply_replication(&self, entry: &ReplicationEntry) -> ApplyOutcome {
        let incoming = entry.stamp();
        let new_value = entry.effective_value().map(str::to_string);

        let old = {
            let mut segment = self.write_segment(&entry.key);
            let previous = segment.get(&entry.key);
            if let Some(current) = previous {
                if incoming == current.stamp {
                    return ApplyOutcome::Duplicate;
                }
                if incoming < current.stamp {
                    return ApplyOutcome::Stale;
                }
            }
            let old = previous.and_then(|e| e.value.clone());
            segment.insert(
                entry.key.clone(),
                StoredEntry {
                    value: new_value.clone(),
                    stamp: incoming,
                },
            );
            old
        };
        self.adjust_live(old.is_some(), new_value.is_some());

        if let Some(event) = MapEvent::between(&self.path, &entry.key, old, new_value) {
            self.subscription.notify_event(&event);
        }
        ApplyOutcome::Applied
    }

    fn entry_stamp(&self, key: &str) -> Option<Stamp> {
        Some(self.read(self.segment_of(key))?.get(key)?.stamp)
    }

    fn replication_entry(&self, key: &str) -> Option<ReplicationEntry> {
        let segment = self.read(self.segment_of(key))?;
        let stored = segment.get(key)?;
        Some(match &stored.value {
            Some(value) => ReplicationEntry::put(key, value.clone(), stored.stamp),
            None => ReplicationEntry::tombstone(key, stored.stamp),
        })
    }

    fn stamped_entries_for(&self, segment: usize, f: &mut dyn FnMut(&str, Stamp)) {
        let stamped: Vec<(String, Stamp)> = self
            .read(segment)
            .map(|map| map.iter().map(|(k, e)| (k.clone(), e.stamp)).collect())
            .unwrap_or_default();
        for (key, stamp) in stamped {
            f(&key, stamp);
        }
    }
}

impl Closeable for MemoryKeyValueStore {
    /// Detach replication (its notifiers first), then end the subscribers.
    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let engine = self
            .replication
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(engine) = engine {
            engine.detach();
        }
        if self.attached.load(Ordering::Acquire) {
            self.subscription.close();
        }
        debug!(path = %self.path, entries = self.long_size(), "Store closed");
    }
}

impl std::fmt::Debug for MemoryKeyValueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryKeyValueStore")
            .field("path", &self.path)
            .field("segments", &self.segments.len())
            .field("entries", &self.long_size())
            .field("replicated", &self.is_replicated())
            .finish()
    }
}
