//! Standard rule set installed on the root of a tree.
//!
//! | View type | Rule | Builds |
//! |-----------|------|--------|
//! | `KeyValueStore` | leaf | [`MemoryKeyValueStore`] bound to the node's subscription collection |
//! | `ObjectSubscription` | leaf | [`SubscriptionCollection`] |
//! | `SimpleSubscription` | leaf | [`SimpleSubscription`] on the parent's store, keyed by the node name |
//! | `Replication` | leaf | [`ReplicationEngine`] when the context names a known cluster |
//! | `Map` | wrapping over `KeyValueStore` | [`MapView`] |
//! | `Reference` | leaf | [`Reference`] to the node's key of the parent map |
//! | `Publisher` | leaf | [`Publisher`] into the parent map |
//! | `TopicPublisher` | wrapping over `Map` | [`TopicPublisher`] |
//!
//! Rules registered on a deeper node take precedence for that subtree.

use crate::context::RequestContext;
use crate::error::{Result, TreeError};
use crate::replication::ReplicationEngine;
use crate::store::{KeyValueStore, MapView, MemoryKeyValueStore, Publisher, Reference, TopicPublisher};
use crate::subscription::{SimpleSubscription, SubscriptionCollection};
use crate::tree::{Asset, ViewHandle, ViewType};
use std::sync::Arc;
use tracing::debug;

/// Install every standard rule on `root`.
pub fn install_default_rules(root: &Asset) {
    root.add_leaf_rule(ViewType::KeyValueStore, "memory kv store", create_kv_store);
    root.add_leaf_rule(ViewType::ObjectSubscription, "subscription collection", |_, asset| {
        Ok(Some(ViewHandle::closeable(Arc::new(SubscriptionCollection::new(
            asset.downgrade(),
        )))))
    });
    root.add_leaf_rule(ViewType::SimpleSubscription, "parent key subscription", create_simple_subscription);
    root.add_leaf_rule(ViewType::Replication, "replication engine", create_replication);
    root.add_wrapping_rule(
        ViewType::Map,
        "map over kv store",
        ViewType::KeyValueStore,
        |_, _| true,
        |ctx, _, underlying| {
            let store = underlying.get::<Arc<dyn KeyValueStore>>().ok_or_else(|| {
                TreeError::Internal(format!(
                    "kv store view at '{}' holds {}",
                    ctx.full_name(),
                    underlying.type_name()
                ))
            })?;
            Ok(Some(ViewHandle::new(Arc::new(MapView::new(ctx.clone(), store)))))
        },
    );
    root.add_leaf_rule(ViewType::Reference, "reference to parent key", |ctx, asset| {
        let Some(map) = parent_map(ctx, asset)? else {
            return Ok(None);
        };
        let subscription: Arc<SimpleSubscription> = asset.acquire(ViewType::SimpleSubscription, ctx)?;
        Ok(Some(ViewHandle::new(Arc::new(Reference::new(
            asset.name(),
            map,
            subscription,
        )))))
    });
    root.add_leaf_rule(ViewType::Publisher, "publisher to parent key", |ctx, asset| {
        let Some(map) = parent_map(ctx, asset)? else {
            return Ok(None);
        };
        Ok(Some(ViewHandle::new(Arc::new(Publisher::new(asset.name(), map)))))
    });
    root.add_wrapping_rule(
        ViewType::TopicPublisher,
        "topic publisher over map",
        ViewType::Map,
        |_, _| true,
        |_, _, underlying| {
            Ok(underlying
                .get::<Arc<MapView>>()
                .map(|map| ViewHandle::new(Arc::new(TopicPublisher::new(map)))))
        },
    );
}

fn create_kv_store(ctx: &RequestContext, asset: &Asset) -> Result<Option<ViewHandle>> {
    let subscription: Arc<SubscriptionCollection> = asset.acquire(ViewType::ObjectSubscription, ctx)?;
    let store = MemoryKeyValueStore::new(ctx, asset.cluster().local_identifier(), subscription);
    let as_kv: Arc<dyn KeyValueStore> = store.clone();

    // Wiring the store to replication is deferred until the handle wins
    // registration on the node.
    let weak_store = Arc::downgrade(&store);
    let weak_asset = asset.downgrade();
    let ctx = ctx.clone();
    let handle = ViewHandle::new(as_kv).with_closer(store).on_registered(move || {
        if let (Some(store), Some(asset)) = (weak_store.upgrade(), weak_asset.upgrade()) {
            store.attach(&ctx, &asset);
        }
    });
    Ok(Some(handle))
}

fn create_simple_subscription(ctx: &RequestContext, asset: &Asset) -> Result<Option<ViewHandle>> {
    let Some(parent) = asset.parent() else {
        return Ok(None);
    };
    let store: Arc<dyn KeyValueStore> = parent.acquire(ViewType::KeyValueStore, ctx)?;
    Ok(Some(ViewHandle::closeable(Arc::new(SimpleSubscription::new(
        asset.full_name(),
        asset.name(),
        Arc::downgrade(&store),
    )))))
}

fn create_replication(ctx: &RequestContext, asset: &Asset) -> Result<Option<ViewHandle>> {
    let Some(cluster) = ctx.cluster() else {
        return Ok(None);
    };
    let context = asset.cluster();
    if !context.contains(cluster) {
        debug!(path = %ctx.full_name(), cluster, "Unknown cluster, no replication");
        return Ok(None);
    }
    let engine = ReplicationEngine::new(
        asset.full_name(),
        context.local_identifier(),
        &context.remote_identifiers(cluster),
    );
    Ok(Some(ViewHandle::closeable(Arc::new(engine))))
}

/// Map of the parent node, or `None` at the root.
fn parent_map(ctx: &RequestContext, asset: &Asset) -> Result<Option<Arc<MapView>>> {
    match asset.parent() {
        Some(parent) => Ok(Some(parent.acquire(ViewType::Map, ctx)?)),
        None => Ok(None),
    }
}
