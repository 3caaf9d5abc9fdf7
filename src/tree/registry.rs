//! Per-node view registry and rule tables.
//!
//! A registry holds three things:
//!
//! - the views already materialized on the node, keyed by [`ViewType`]
//! - leaf rules: build a view from the context alone
//! - wrapping rules: build a view around an underlying view of another type,
//!   gated by a predicate and ordered by description
//!
//! The registry lock is only ever held for map lookups and the final
//! compare-and-set of a new view. Rules are cloned out before a factory runs,
//! so a factory may freely resolve views on this or any other node.

use super::view::{ViewHandle, ViewType};
use super::Asset;
use crate::context::RequestContext;
use crate::error::Result;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Factory of a leaf view.
pub type LeafFactory =
    dyn Fn(&RequestContext, &Asset) -> Result<Option<ViewHandle>> + Send + Sync;

/// Predicate deciding whether a wrapping rule applies.
pub type WrapPredicate = dyn Fn(&RequestContext, &Asset) -> bool + Send + Sync;

/// Factory of a wrapping view, given the resolved underlying view.
pub type WrappingFactory =
    dyn Fn(&RequestContext, &Asset, ViewHandle) -> Result<Option<ViewHandle>> + Send + Sync;

/// Builds a view with no required underlying view.
#[derive(Clone)]
pub struct LeafRule {
    pub description: String,
    pub factory: Arc<LeafFactory>,
}

/// Builds a view wrapping an underlying view of `underlying` type.
#[derive(Clone)]
pub struct WrappingRule {
    pub description: String,
    pub predicate: Arc<WrapPredicate>,
    pub factory: Arc<WrappingFactory>,
    pub underlying: ViewType,
}

impl std::fmt::Debug for LeafRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafRule")
            .field("description", &self.description)
            .finish()
    }
}

impl std::fmt::Debug for WrappingRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WrappingRule")
            .field("description", &self.description)
            .field("underlying", &self.underlying)
            .finish()
    }
}

#[derive(Default)]
struct RegistryState {
    views: HashMap<ViewType, ViewHandle>,
    leaf_rules: HashMap<ViewType, LeafRule>,
    /// Sorted by description; the first passing rule wins.
    wrapping_rules: HashMap<ViewType, BTreeMap<String, WrappingRule>>,
}

/// Views and rules of one node.
#[derive(Default)]
pub struct ViewRegistry {
    state: Mutex<RegistryState>,
}

impl ViewRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register (or replace) the leaf rule for `view_type`.
    pub fn add_leaf_rule(&self, view_type: ViewType, rule: LeafRule) {
        self.lock().leaf_rules.insert(view_type, rule);
    }

    /// Register a wrapping rule. A rule with the same description replaces
    /// the previous one.
    pub fn add_wrapping_rule(&self, view_type: ViewType, rule: WrappingRule) {
        self.lock()
            .wrapping_rules
            .entry(view_type)
            .or_default()
            .insert(rule.description.clone(), rule);
    }

    pub fn leaf_rule(&self, view_type: ViewType) -> Option<LeafRule> {
        self.lock().leaf_rules.get(&view_type).cloned()
    }

    pub fn has_leaf_rule(&self, view_type: ViewType) -> bool {
        self.lock().leaf_rules.contains_key(&view_type)
    }

    /// Wrapping rules for `view_type`, in description order.
    ///
    /// Empty when a leaf rule for the same type is registered here: the leaf
    /// wins locally.
    pub fn wrapping_rules(&self, view_type: ViewType) -> Vec<WrappingRule> {
        let state = self.lock();
        if state.leaf_rules.contains_key(&view_type) {
            return Vec::new();
        }
        state
            .wrapping_rules
            .get(&view_type)
            .map(|rules| rules.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get_view(&self, view_type: ViewType) -> Option<ViewHandle> {
        self.lock().views.get(&view_type).cloned()
    }

    /// Insert `view` unless one is already registered; returns the winner.
    pub fn add_view_if_absent(&self, view_type: ViewType, view: ViewHandle) -> ViewHandle {
        self.lock().views.entry(view_type).or_insert(view).clone()
    }

    /// Register `view`, replacing any previous one; returns the replaced view.
    pub fn put_view(&self, view_type: ViewType, view: ViewHandle) -> Option<ViewHandle> {
        self.lock().views.insert(view_type, view)
    }

    pub fn remove_view(&self, view_type: ViewType) -> Option<ViewHandle> {
        self.lock().views.remove(&view_type)
    }

    pub fn view_types(&self) -> Vec<ViewType> {
        let mut types: Vec<_> = self.lock().views.keys().copied().collect();
        types.sort();
        types
    }

    /// Remove and return every view (for close).
    pub(crate) fn take_views(&self) -> Vec<(ViewType, ViewHandle)> {
        let mut views: Vec<_> = self.lock().views.drain().collect();
        views.sort_by_key(|(t, _)| *t);
        views
    }

    /// Snapshot of every view.
    pub(crate) fn views(&self) -> Vec<ViewHandle> {
        self.lock().views.values().cloned().collect()
    }
}
