// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The asset tree: hierarchically named nodes with lazily resolved views.
//!
//! # Architecture
//!
//! ```text
//! AssetTree ──► TreeInner { nodes: AssetId → AssetNode, cluster }
//!                   │
//!                   ├── "" (root)      registry: rules for the whole tree
//!                   │    └── /orders   registry: map, kvstore, subscription, ...
//!                   │          └── /orders/42   registry: reference, simpleSubscription
//! ```
//!
//! Nodes live in an arena keyed by [`AssetId`]. A parent owns its children
//! by id and a child stores its parent's id, so there are no reference
//! cycles. Views that need their node back keep a [`WeakAsset`].
//!
//! # View resolution
//!
//! [`Asset::acquire_view`] returns an already registered view if there is
//! one. Otherwise it walks from the node up to the root looking for a leaf
//! rule, then walks again looking for wrapping rules (in description order),
//! resolving the wrapped view through `acquire_view` on the requesting node.
//! The first non-empty result is compare-and-set into the node's registry;
//! a caller that loses the race closes its instance and returns the winner.

mod registry;
mod view;

pub use registry::{
    LeafFactory, LeafRule, ViewRegistry, WrapPredicate, WrappingFactory, WrappingRule,
};
pub use view::{Closeable, RegisteredHook, ViewHandle, ViewType};

use crate::cluster::ClusterContext;
use crate::context::{normalise_path, RequestContext};
use crate::error::{Result, TreeError};
use crate::metrics;
use crate::replication::ReplicationEngine;
use crate::store::MapView;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, info, trace, warn};

/// Bound on nested wrapping resolutions (a wraps b wraps c ...).
const MAX_WRAPPING_DEPTH: usize = 16;

/// Arena index of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AssetId(u64);

impl AssetId {
    pub const ROOT: AssetId = AssetId(0);

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Authorization check for creating child nodes.
///
/// The nearest policy on the ancestor chain (the node itself included)
/// decides. Without any policy every child may be created.
pub trait ChildPolicy: Send + Sync {
    fn can_create_child(&self, path: &str) -> bool;
}

impl<F> ChildPolicy for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn can_create_child(&self, path: &str) -> bool {
        self(path)
    }
}

struct AssetNode {
    id: AssetId,
    name: String,
    full_name: String,
    parent: Option<AssetId>,
    children: Mutex<BTreeMap<String, AssetId>>,
    registry: ViewRegistry,
    policy: Mutex<Option<Arc<dyn ChildPolicy>>>,
    closed: AtomicBool,
}

impl AssetNode {
    fn new(id: AssetId, name: &str, full_name: String, parent: Option<AssetId>) -> Self {
        Self {
            id,
            name: name.to_string(),
            full_name,
            parent,
            children: Mutex::new(BTreeMap::new()),
            registry: ViewRegistry::new(),
            policy: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    fn children(&self) -> MutexGuard<'_, BTreeMap<String, AssetId>> {
        self.children.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn policy(&self) -> Option<Arc<dyn ChildPolicy>> {
        self.policy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

struct TreeInner {
    nodes: DashMap<AssetId, Arc<AssetNode>>,
    root: Arc<AssetNode>,
    next_id: AtomicU64,
    cluster: Arc<ClusterContext>,
}

impl TreeInner {
    fn node(&self, id: AssetId) -> Option<Arc<AssetNode>> {
        self.nodes.get(&id).map(|entry| Arc::clone(entry.value()))
    }
}

/// Handle to a whole tree. Cheap to clone.
#[derive(Clone)]
pub struct AssetTree {
    inner: Arc<TreeInner>,
}

impl AssetTree {
    /// Create an empty tree with no rules.
    pub fn new(cluster: ClusterContext) -> Self {
        let root = Arc::new(AssetNode::new(AssetId::ROOT, "", String::new(), None));
        let nodes = DashMap::new();
        nodes.insert(AssetId::ROOT, Arc::clone(&root));

        info!(
            local_id = cluster.local_identifier(),
            clusters = cluster.cluster_names().len(),
            "Asset tree created"
        );

        Self {
            inner: Arc::new(TreeInner {
                nodes,
                root,
                next_id: AtomicU64::new(1),
                cluster: Arc::new(cluster),
            }),
        }
    }

    /// Create a tree with the standard rule set installed on the root.
    pub fn with_default_rules(cluster: ClusterContext) -> Self {
        let tree = Self::new(cluster);
        crate::rules::install_default_rules(&tree.root());
        tree
    }

    pub fn root(&self) -> Asset {
        Asset {
            tree: Arc::clone(&self.inner),
            node: Arc::clone(&self.inner.root),
        }
    }

    pub fn cluster(&self) -> &Arc<ClusterContext> {
        &self.inner.cluster
    }

    /// Resolve `path`, creating missing nodes on the way.
    pub fn acquire_asset(&self, path: &str) -> Result<Asset> {
        let path = normalise_path(path);
        let mut asset = self.root();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            asset = asset.acquire_child(segment)?;
        }
        Ok(asset)
    }

    /// Resolve `path` without creating anything.
    pub fn get_asset(&self, path: &str) -> Option<Asset> {
        let path = normalise_path(path);
        let mut asset = self.root();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            asset = asset.get_child(segment)?;
        }
        Some(asset)
    }

    /// Remove and close the node at `path`. Returns whether it existed.
    pub fn remove_asset(&self, path: &str) -> bool {
        let path = normalise_path(path);
        let Some((parent, name)) = path.rsplit_once('/') else {
            return false;
        };
        if name.is_empty() {
            return false;
        }
        match self.get_asset(parent) {
            Some(parent) => parent.remove_child(name),
            None => false,
        }
    }

    /// Resolve the view named by `ctx.view_type()` at `ctx.full_name()`.
    pub fn acquire_view(&self, ctx: &RequestContext) -> Result<ViewHandle> {
        let view_type = ctx.view_type().ok_or_else(|| {
            TreeError::Config(format!("no view type requested for '{}'", ctx.full_name()))
        })?;
        self.acquire_asset(ctx.full_name())?
            .acquire_view(view_type, ctx)
    }

    /// Acquire the map at `ctx.full_name()`.
    pub fn acquire_map(&self, ctx: &RequestContext) -> Result<Arc<MapView>> {
        self.acquire_asset(ctx.full_name())?
            .acquire(ViewType::Map, ctx)
    }

    /// Acquire the replication engine of the store at `ctx.full_name()`.
    pub fn acquire_replication(&self, ctx: &RequestContext) -> Result<Arc<ReplicationEngine>> {
        self.acquire_asset(ctx.full_name())?
            .acquire(ViewType::Replication, ctx)
    }

    /// Number of live nodes, root included.
    pub fn node_count(&self) -> usize {
        self.inner.nodes.len()
    }

    /// Close every view and node below (and on) the root.
    pub fn close(&self) {
        info!("Closing asset tree");
        close_node(&self.inner, &self.inner.root);
    }
}

impl fmt::Debug for AssetTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssetTree")
            .field("nodes", &self.inner.nodes.len())
            .field("local_id", &self.inner.cluster.local_identifier())
            .finish()
    }
}

/// Depth-first close: notify this node's views, close the children, then
/// close this node's views and forget them.
fn close_node(tree: &TreeInner, node: &Arc<AssetNode>) {
    if node.closed.swap(true, Ordering::AcqRel) {
        return;
    }

    for view in node.registry.views() {
        view.notify_closing();
    }

    let children: Vec<AssetId> = {
        let mut children = node.children();
        std::mem::take(&mut *children).into_values().collect()
    };
    for id in children {
        if let Some((_, child)) = tree.nodes.remove(&id) {
            close_node(tree, &child);
        }
    }

    for (view_type, view) in node.registry.take_views() {
        trace!(path = %display_path(&node.full_name), view_type = %view_type, "Closing view");
        view.close();
    }

    metrics::record_asset_closed();
    debug!(path = %display_path(&node.full_name), "Asset closed");
}

fn display_path(full_name: &str) -> &str {
    if full_name.is_empty() {
        "/"
    } else {
        full_name
    }
}

/// A node of the tree.
#[derive(Clone)]
pub struct Asset {
    tree: Arc<TreeInner>,
    node: Arc<AssetNode>,
}

impl Asset {
    fn with_node(&self, node: Arc<AssetNode>) -> Asset {
        Asset {
            tree: Arc::clone(&self.tree),
            node,
        }
    }

    pub fn id(&self) -> AssetId {
        self.node.id
    }

    /// Last path segment; empty for the root.
    pub fn name(&self) -> &str {
        &self.node.name
    }

    /// `/`-joined path from the root; the root's is empty.
    pub fn full_name(&self) -> &str {
        &self.node.full_name
    }

    pub fn is_root(&self) -> bool {
        self.node.parent.is_none()
    }

    pub fn is_closed(&self) -> bool {
        self.node.closed.load(Ordering::Acquire)
    }

    pub fn parent(&self) -> Option<Asset> {
        let id = self.node.parent?;
        self.tree.node(id).map(|node| self.with_node(node))
    }

    pub fn tree(&self) -> AssetTree {
        AssetTree {
            inner: Arc::clone(&self.tree),
        }
    }

    pub fn cluster(&self) -> &Arc<ClusterContext> {
        &self.tree.cluster
    }

    /// A handle that does not keep the node or tree alive.
    pub fn downgrade(&self) -> WeakAsset {
        WeakAsset {
            tree: Arc::downgrade(&self.tree),
            node: Arc::downgrade(&self.node),
            full_name: self.node.full_name.clone(),
        }
    }

    // ── children ────────────────────────────────────────────────────────────

    pub fn get_child(&self, name: &str) -> Option<Asset> {
        let id = *self.node.children().get(name)?;
        self.tree.node(id).map(|node| self.with_node(node))
    }

    /// Child nodes, ordered by name.
    pub fn children(&self) -> Vec<Asset> {
        let ids: Vec<AssetId> = self.node.children().values().copied().collect();
        ids.into_iter()
            .filter_map(|id| self.tree.node(id))
            .map(|node| self.with_node(node))
            .collect()
    }

    /// Get or create the child `name`.
    ///
    /// Creation is checked against the nearest [`ChildPolicy`]; a refusal
    /// is [`TreeError::PermissionDenied`] naming the child's path.
    pub fn acquire_child(&self, name: &str) -> Result<Asset> {
        if let Some(child) = self.get_child(name) {
            return Ok(child);
        }
        if name.is_empty() || name.contains('/') {
            return Err(TreeError::Config(format!(
                "invalid asset name '{}' under '{}'",
                name,
                display_path(self.full_name())
            )));
        }
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let path = format!("{}/{}", self.full_name(), name);
        if !self.permits_child(&path) {
            warn!(path = %path, "Child creation denied by policy");
            metrics::record_permission_denied();
            return Err(TreeError::permission_denied(path));
        }

        let mut children = self.node.children();
        if let Some(node) = children.get(name).and_then(|id| self.tree.node(*id)) {
            return Ok(self.with_node(node));
        }
        let id = AssetId(self.tree.next_id.fetch_add(1, Ordering::Relaxed));
        let node = Arc::new(AssetNode::new(id, name, path, Some(self.node.id)));
        self.tree.nodes.insert(id, Arc::clone(&node));
        children.insert(name.to_string(), id);
        drop(children);

        metrics::record_asset_created();
        debug!(path = %node.full_name, "Asset created");
        Ok(self.with_node(node))
    }

    fn permits_child(&self, path: &str) -> bool {
        self.ancestry()
            .into_iter()
            .find_map(|node| node.policy())
            .map_or(true, |policy| policy.can_create_child(path))
    }

    /// Install the policy consulted for children created at or below this node.
    pub fn set_child_policy(&self, policy: impl ChildPolicy + 'static) {
        *self
            .node
            .policy
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(policy));
    }

    /// Remove and close the child `name`. Returns whether it existed.
    pub fn remove_child(&self, name: &str) -> bool {
        let removed = self.node.children().remove(name);
        let Some(id) = removed else {
            return false;
        };
        if let Some((_, child)) = self.tree.nodes.remove(&id) {
            close_node(&self.tree, &child);
        }
        true
    }

    /// Close this node, its views and its subtree.
    ///
    /// A non-root node is also unlinked from its parent. Closing the root
    /// closes the whole tree.
    pub fn close(&self) {
        if let Some(parent) = self.parent() {
            parent.remove_child(self.name());
        }
        close_node(&self.tree, &self.node);
    }

    /// This node followed by its ancestors up to the root.
    fn ancestry(&self) -> Vec<Arc<AssetNode>> {
        let mut chain = vec![Arc::clone(&self.node)];
        let mut parent = self.node.parent;
        while let Some(node) = parent.and_then(|id| self.tree.node(id)) {
            parent = node.parent;
            chain.push(node);
        }
        chain
    }

    fn closed_error(&self) -> TreeError {
        TreeError::InvalidState {
            expected: "open asset".to_string(),
            actual: format!("'{}' closed", display_path(self.full_name())),
        }
    }

    // ── rules and views ─────────────────────────────────────────────────────

    /// Register a leaf rule on this node; it applies to this node and every
    /// descendant without a closer rule.
    pub fn add_leaf_rule<F>(&self, view_type: ViewType, description: impl Into<String>, factory: F)
    where
        F: Fn(&RequestContext, &Asset) -> Result<Option<ViewHandle>> + Send + Sync + 'static,
    {
        self.node.registry.add_leaf_rule(
            view_type,
            LeafRule {
                description: description.into(),
                factory: Arc::new(factory),
            },
        );
    }

    /// Register a wrapping rule building `view_type` around `underlying`.
    pub fn add_wrapping_rule<P, F>(
        &self,
        view_type: ViewType,
        description: impl Into<String>,
        underlying: ViewType,
        predicate: P,
        factory: F,
    ) where
        P: Fn(&RequestContext, &Asset) -> bool + Send + Sync + 'static,
        F: Fn(&RequestContext, &Asset, ViewHandle) -> Result<Option<ViewHandle>>
            + Send
            + Sync
            + 'static,
    {
        self.node.registry.add_wrapping_rule(
            view_type,
            WrappingRule {
                description: description.into(),
                predicate: Arc::new(predicate),
                factory: Arc::new(factory),
                underlying,
            },
        );
    }

    /// Register a view directly, replacing any previous one of that type.
    pub fn add_view(&self, view_type: ViewType, view: ViewHandle) -> Option<ViewHandle> {
        let previous = self.node.registry.put_view(view_type, view.clone());
        view.registered();
        previous
    }

    pub fn get_view(&self, view_type: ViewType) -> Option<ViewHandle> {
        self.node.registry.get_view(view_type)
    }

    /// Typed [`Asset::get_view`].
    pub fn get<T>(&self, view_type: ViewType) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.get_view(view_type)?.get::<T>()
    }

    /// View types currently materialized on this node.
    pub fn view_types(&self) -> Vec<ViewType> {
        self.node.registry.view_types()
    }

    /// Return the `view_type` view of this node, creating it from the rules
    /// of this node or its ancestors if needed.
    pub fn acquire_view(&self, view_type: ViewType, ctx: &RequestContext) -> Result<ViewHandle> {
        self.acquire_view_at_depth(view_type, ctx, 0)
    }

    /// Typed [`Asset::acquire_view`].
    pub fn acquire<T>(&self, view_type: ViewType, ctx: &RequestContext) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let handle = self.acquire_view(view_type, ctx)?;
        handle.get::<T>().ok_or_else(|| {
            TreeError::Internal(format!(
                "{} view at '{}' holds {}, not {}",
                view_type,
                display_path(self.full_name()),
                handle.type_name(),
                std::any::type_name::<T>()
            ))
        })
    }

    fn acquire_view_at_depth(
        &self,
        view_type: ViewType,
        ctx: &RequestContext,
        depth: usize,
    ) -> Result<ViewHandle> {
        if let Some(view) = self.node.registry.get_view(view_type) {
            return Ok(view);
        }
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let ctx = ctx
            .to_builder()
            .full_name(self.full_name())
            .view_type(view_type)
            .build();

        let created = match self.create_leaf_view(view_type, &ctx)? {
            Some(view) => {
                metrics::record_view_resolved(view_type.as_str(), "leaf");
                view
            }
            None => match self.create_wrapping_view(view_type, &ctx, depth)? {
                Some(view) => {
                    metrics::record_view_resolved(view_type.as_str(), "wrapping");
                    view
                }
                None => {
                    metrics::record_resolution_failure(view_type.as_str());
                    debug!(
                        path = %display_path(self.full_name()),
                        view_type = %view_type,
                        "No rule produced view"
                    );
                    return Err(TreeError::resolution(view_type, display_path(self.full_name())));
                }
            },
        };

        let winner = self.node.registry.add_view_if_absent(view_type, created.clone());
        if !winner.same_view(&created) {
            debug!(
                path = %display_path(self.full_name()),
                view_type = %view_type,
                "Lost view resolution race, closing duplicate"
            );
            created.close();
        } else {
            trace!(
                path = %display_path(self.full_name()),
                view_type = %view_type,
                view = created.type_name(),
                "View registered"
            );
            created.registered();
        }
        Ok(winner)
    }

    fn create_leaf_view(
        &self,
        view_type: ViewType,
        ctx: &RequestContext,
    ) -> Result<Option<ViewHandle>> {
        for node in self.ancestry() {
            let Some(rule) = node.registry.leaf_rule(view_type) else {
                continue;
            };
            if let Some(view) = (rule.factory)(ctx, self)? {
                trace!(
                    path = %display_path(self.full_name()),
                    rule = %rule.description,
                    declared_at = %display_path(&node.full_name),
                    "Leaf rule matched"
                );
                return Ok(Some(view));
            }
        }
        Ok(None)
    }

    fn create_wrapping_view(
        &self,
        view_type: ViewType,
        ctx: &RequestContext,
        depth: usize,
    ) -> Result<Option<ViewHandle>> {
        if depth >= MAX_WRAPPING_DEPTH {
            warn!(
                path = %display_path(self.full_name()),
                view_type = %view_type,
                "Wrapping rules nest too deeply, giving up"
            );
            return Ok(None);
        }

        let mut resolved: Vec<(ViewType, ViewHandle)> = Vec::new();
        for node in self.ancestry() {
            for rule in node.registry.wrapping_rules(view_type) {
                if rule.underlying == view_type || !(rule.predicate)(ctx, self) {
                    continue;
                }

                let underlying = match resolved.iter().find(|(t, _)| *t == rule.underlying) {
                    Some((_, view)) => view.clone(),
                    None => {
                        let underlying_ctx = ctx.with_view_type(rule.underlying);
                        match self.acquire_view_at_depth(rule.underlying, &underlying_ctx, depth + 1)
                        {
                            Ok(view) => {
                                resolved.push((rule.underlying, view.clone()));
                                view
                            }
                            Err(TreeError::ResolutionFailure { .. }) => continue,
                            Err(e) => return Err(e),
                        }
                    }
                };

                if let Some(view) = (rule.factory)(ctx, self, underlying)? {
                    trace!(
                        path = %display_path(self.full_name()),
                        rule = %rule.description,
                        declared_at = %display_path(&node.full_name),
                        "Wrapping rule matched"
                    );
                    return Ok(Some(view));
                }
            }
        }
        Ok(None)
    }
}

impl fmt::Debug for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Asset")
            .field("id", &self.node.id)
            .field("path", &display_path(&self.node.full_name))
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Non-owning handle to an [`Asset`].
#[derive(Clone)]
pub struct WeakAsset {
    tree: Weak<TreeInner>,
    node: Weak<AssetNode>,
    full_name: String,
}

impl WeakAsset {
    /// The asset, unless it (or its tree) has been closed or dropped.
    pub fn upgrade(&self) -> Option<Asset> {
        let tree = self.tree.upgrade()?;
        let node = self.node.upgrade()?;
        if node.closed.load(Ordering::Acquire) {
            return None;
        }
        Some(Asset { tree, node })
    }

    pub fn full_name(&self) -> &str {
        &self.full_name
    }
}

impl fmt::Debug for WeakAsset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakAsset")
            .field("path", &display_path(&self.full_name))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn tree() -> AssetTree {
        AssetTree::new(ClusterContext::standalone(1))
    }

    fn ctx(path: &str) -> RequestContext {
        RequestContext::for_path(path)
    }

    #[derive(Clone, Debug, PartialEq)]
    struct Tag(&'static str);

    struct CloseCounter {
        notified: AtomicUsize,
        closed: AtomicUsize,
    }

    impl CloseCounter {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                notified: AtomicUsize::new(0),
                closed: AtomicUsize::new(0),
            })
        }
    }

    impl Closeable for CloseCounter {
        fn notify_closing(&self) {
            self.notified.fetch_add(1, Ordering::SeqCst);
        }

        fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_full_names() {
        let tree = tree();
        assert_eq!(tree.root().full_name(), "");
        assert!(tree.root().is_root());

        let b = tree.acquire_asset("/a/b").unwrap();
        assert_eq!(b.full_name(), "/a/b");
        assert_eq!(b.name(), "b");
        assert_eq!(b.parent().unwrap().full_name(), "/a");
        assert_eq!(tree.node_count(), 3);
    }

    #[test]
    fn test_acquire_asset_is_idempotent() {
        let tree = tree();
        let first = tree.acquire_asset("a/b").unwrap();
        let second = tree.acquire_asset("/a//b/").unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(tree.node_count(), 3);
    }

    #[test]
    fn test_get_asset_does_not_create() {
        let tree = tree();
        assert!(tree.get_asset("/missing").is_none());
        assert_eq!(tree.node_count(), 1);
        assert!(tree.get_asset("").is_some());
    }

    #[test]
    fn test_invalid_child_name() {
        let tree = tree();
        assert!(matches!(
            tree.root().acquire_child(""),
            Err(TreeError::Config(_))
        ));
        assert!(tree.root().acquire_child("a/b").is_err());
    }

    #[test]
    fn test_child_policy_denies() {
        let tree = tree();
        let locked = tree.acquire_asset("/locked").unwrap();
        locked.set_child_policy(|path: &str| !path.ends_with("/secret"));

        assert!(tree.acquire_asset("/locked/open").is_ok());
        let err = tree.acquire_asset("/locked/secret").unwrap_err();
        match err {
            TreeError::PermissionDenied { path } => assert_eq!(path, "/locked/secret"),
            other => panic!("unexpected error: {:?}", other),
        }
        // Policy applies to deeper descendants too
        assert!(tree.acquire_asset("/locked/open/secret").is_err());
        // But not to siblings of the policy node
        assert!(tree.acquire_asset("/other/secret").is_ok());
    }

    #[test]
    fn test_nearest_policy_wins() {
        let tree = tree();
        tree.root().set_child_policy(|_: &str| false);
        assert!(tree.acquire_asset("/a").is_err());

        // Pre-create through a permissive override
        let tree = AssetTree::new(ClusterContext::standalone(1));
        let a = tree.acquire_asset("/a").unwrap();
        tree.root().set_child_policy(|_: &str| false);
        a.set_child_policy(|_: &str| true);
        assert!(tree.acquire_asset("/a/b").is_ok());
        assert!(tree.acquire_asset("/c").is_err());
    }

    #[test]
    fn test_leaf_rule_from_ancestor_gets_requesting_asset() {
        let tree = tree();
        tree.root().add_leaf_rule(ViewType::Custom("name"), "name of asset", |_, asset| {
            Ok(Some(ViewHandle::new(asset.full_name().to_string())))
        });

        let asset = tree.acquire_asset("/x/y").unwrap();
        let name: String = asset.acquire(ViewType::Custom("name"), &ctx("/x/y")).unwrap();
        assert_eq!(name, "/x/y");
    }

    #[test]
    fn test_existing_view_wins() {
        let tree = tree();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        tree.root().add_leaf_rule(ViewType::Custom("t"), "tag", move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Some(ViewHandle::new(Tag("built"))))
        });

        let asset = tree.acquire_asset("/a").unwrap();
        let first = asset.acquire_view(ViewType::Custom("t"), &ctx("/a")).unwrap();
        let second = asset.acquire_view(ViewType::Custom("t"), &ctx("/a")).unwrap();
        assert!(first.same_view(&second));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_closer_leaf_rule_overrides_ancestor() {
        let tree = tree();
        tree.root().add_leaf_rule(ViewType::Custom("t"), "root", |_, _| {
            Ok(Some(ViewHandle::new(Tag("root"))))
        });
        let a = tree.acquire_asset("/a").unwrap();
        a.add_leaf_rule(ViewType::Custom("t"), "a", |_, _| {
            Ok(Some(ViewHandle::new(Tag("a"))))
        });

        let under_a = tree.acquire_asset("/a/b").unwrap();
        let other = tree.acquire_asset("/z").unwrap();
        assert_eq!(
            under_a.acquire::<Tag>(ViewType::Custom("t"), &ctx("")).unwrap(),
            Tag("a")
        );
        assert_eq!(
            other.acquire::<Tag>(ViewType::Custom("t"), &ctx("")).unwrap(),
            Tag("root")
        );
    }

    #[test]
    fn test_leaf_returning_none_continues_up() {
        let tree = tree();
        tree.root().add_leaf_rule(ViewType::Custom("t"), "root", |_, _| {
            Ok(Some(ViewHandle::new(Tag("root"))))
        });
        let a = tree.acquire_asset("/a").unwrap();
        a.add_leaf_rule(ViewType::Custom("t"), "declines", |_, _| Ok(None));

        assert_eq!(
            a.acquire::<Tag>(ViewType::Custom("t"), &ctx("/a")).unwrap(),
            Tag("root")
        );
    }

    #[test]
    fn test_wrapping_rule_wraps_underlying() {
        let tree = tree();
        let root = tree.root();
        root.add_leaf_rule(ViewType::Custom("base"), "base", |_, _| {
            Ok(Some(ViewHandle::new(Tag("base"))))
        });
        root.add_wrapping_rule(
            ViewType::Custom("wrapped"),
            "wrap base",
            ViewType::Custom("base"),
            |_, _| true,
            |_, _, underlying| {
                let base: Tag = underlying.get().unwrap_or(Tag("?"));
                Ok(Some(ViewHandle::new(format!("wrapped({})", base.0))))
            },
        );

        let asset = tree.acquire_asset("/w").unwrap();
        let wrapped: String = asset
            .acquire(ViewType::Custom("wrapped"), &ctx("/w"))
            .unwrap();
        assert_eq!(wrapped, "wrapped(base)");
        // The underlying view was registered on the same asset
        assert!(asset.get_view(ViewType::Custom("base")).is_some());
    }

    #[test]
    fn test_wrapping_rules_in_description_order_with_predicate() {
        let tree = tree();
        let root = tree.root();
        root.add_leaf_rule(ViewType::Custom("base"), "base", |_, _| {
            Ok(Some(ViewHandle::new(Tag("base"))))
        });
        for (description, pass) in [("c", true), ("a", false), ("b", true)] {
            root.add_wrapping_rule(
                ViewType::Custom("w"),
                description,
                ViewType::Custom("base"),
                move |_, _| pass,
                move |_, _, _| Ok(Some(ViewHandle::new(description.to_string()))),
            );
        }

        let asset = tree.acquire_asset("/w").unwrap();
        let chosen: String = asset.acquire(ViewType::Custom("w"), &ctx("/w")).unwrap();
        assert_eq!(chosen, "b");
    }

    #[test]
    fn test_leaf_rule_on_node_skips_its_wrapping_rules() {
        let tree = tree();
        let root = tree.root();
        root.add_leaf_rule(ViewType::Custom("base"), "base", |_, _| {
            Ok(Some(ViewHandle::new(Tag("base"))))
        });
        root.add_wrapping_rule(
            ViewType::Custom("w"),
            "wrapper",
            ViewType::Custom("base"),
            |_, _| true,
            |_, _, _| Ok(Some(ViewHandle::new(Tag("wrapper")))),
        );
        // A leaf for the same type on the root that declines
        root.add_leaf_rule(ViewType::Custom("w"), "leaf", |_, _| Ok(None));

        let asset = tree.acquire_asset("/w").unwrap();
        assert!(matches!(
            asset.acquire_view(ViewType::Custom("w"), &ctx("/w")),
            Err(TreeError::ResolutionFailure { .. })
        ));
    }

    #[test]
    fn test_resolution_failure_names_type_and_path() {
        let tree = tree();
        let asset = tree.acquire_asset("/nothing/here").unwrap();
        let err = asset
            .acquire_view(ViewType::Custom("ghost"), &ctx("/nothing/here"))
            .unwrap_err();
        match err {
            TreeError::ResolutionFailure { view_type, path } => {
                assert_eq!(view_type, "ghost");
                assert_eq!(path, "/nothing/here");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_factory_can_resolve_views_on_other_nodes() {
        let tree = tree();
        let root = tree.root();
        root.add_leaf_rule(ViewType::Custom("leaf"), "leaf", |_, asset| {
            Ok(Some(ViewHandle::new(asset.full_name().to_string())))
        });
        root.add_leaf_rule(ViewType::Custom("parent-name"), "from parent", |ctx, asset| {
            match asset.parent() {
                Some(parent) => {
                    let name: String = parent.acquire(ViewType::Custom("leaf"), ctx)?;
                    Ok(Some(ViewHandle::new(name)))
                }
                None => Ok(None),
            }
        });

        let child = tree.acquire_asset("/p/c").unwrap();
        let name: String = child
            .acquire(ViewType::Custom("parent-name"), &ctx("/p/c"))
            .unwrap();
        assert_eq!(name, "/p");
    }

    #[test]
    fn test_typed_acquire_wrong_type_is_internal_error() {
        let tree = tree();
        tree.root().add_leaf_rule(ViewType::Custom("t"), "tag", |_, _| {
            Ok(Some(ViewHandle::new(Tag("x"))))
        });
        let err = tree
            .root()
            .acquire::<String>(ViewType::Custom("t"), &ctx(""))
            .unwrap_err();
        assert!(matches!(err, TreeError::Internal(_)));
    }

    #[test]
    fn test_remove_cascades_close_depth_first() {
        let tree = tree();
        let parent = tree.acquire_asset("/p").unwrap();
        let child = tree.acquire_asset("/p/c").unwrap();
        let parent_view = CloseCounter::new();
        let child_view = CloseCounter::new();
        parent.add_view(ViewType::Custom("v"), ViewHandle::closeable(Arc::clone(&parent_view)));
        child.add_view(ViewType::Custom("v"), ViewHandle::closeable(Arc::clone(&child_view)));

        assert!(tree.remove_asset("/p"));
        assert_eq!(parent_view.notified.load(Ordering::SeqCst), 1);
        assert_eq!(parent_view.closed.load(Ordering::SeqCst), 1);
        assert_eq!(child_view.notified.load(Ordering::SeqCst), 1);
        assert_eq!(child_view.closed.load(Ordering::SeqCst), 1);
        assert!(parent.is_closed());
        assert!(child.is_closed());
        assert!(tree.get_asset("/p").is_none());
        assert_eq!(tree.node_count(), 1);

        // Second removal is a no-op
        assert!(!tree.remove_asset("/p"));
        parent.close();
        assert_eq!(parent_view.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_closed_asset_refuses_new_views() {
        let tree = tree();
        tree.root().add_leaf_rule(ViewType::Custom("t"), "tag", |_, _| {
            Ok(Some(ViewHandle::new(Tag("x"))))
        });
        let asset = tree.acquire_asset("/gone").unwrap();
        asset.close();
        assert!(matches!(
            asset.acquire_view(ViewType::Custom("t"), &ctx("/gone")),
            Err(TreeError::InvalidState { .. })
        ));
        assert!(asset.downgrade().upgrade().is_none());
    }

    #[test]
    fn test_weak_asset_upgrade() {
        let tree = tree();
        let asset = tree.acquire_asset("/a").unwrap();
        let weak = asset.downgrade();
        assert_eq!(weak.full_name(), "/a");
        assert_eq!(weak.upgrade().unwrap().id(), asset.id());
    }

    struct CountOnClose(Arc<AtomicUsize>);

    impl Closeable for CountOnClose {
        fn close(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_concurrent_acquire_yields_single_instance() {
        let tree = tree();
        let built = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));
        {
            let built = Arc::clone(&built);
            let closed = Arc::clone(&closed);
            tree.root().add_leaf_rule(ViewType::Custom("race"), "race", move |_, _| {
                built.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(std::time::Duration::from_millis(5));
                Ok(Some(
                    ViewHandle::new(Tag("race"))
                        .with_closer(Arc::new(CountOnClose(Arc::clone(&closed)))),
                ))
            });
        }

        let asset = tree.acquire_asset("/race").unwrap();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let asset = asset.clone();
                std::thread::spawn(move || {
                    asset
                        .acquire_view(ViewType::Custom("race"), &RequestContext::for_path("/race"))
                        .unwrap()
                })
            })
            .collect();
        let views: Vec<ViewHandle> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        for view in &views {
            assert!(view.same_view(&views[0]));
        }
        // Every losing instance was closed
        assert_eq!(
            closed.load(Ordering::SeqCst),
            built.load(Ordering::SeqCst) - 1
        );
    }
}
