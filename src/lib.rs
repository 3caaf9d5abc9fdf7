//! # Asset Tree
//!
//! A hierarchical resource tree whose nodes expose lazily resolved views
//! (maps, subscriptions, references, publishers), with identifier-tagged
//! mesh replication of key-value stores between hosts.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                               asset-tree                                  │
//! │                                                                           │
//! │  ┌─────────────┐    ┌──────────────┐    ┌──────────────────────────────┐  │
//! │  │ AssetTree   │───►│ View rules   │───►│ MapView / KeyValueStore      │  │
//! │  │ (nodes)     │    │ (leaf, wrap) │    │ SubscriptionCollection       │  │
//! │  └─────────────┘    └──────────────┘    └──────────────────────────────┘  │
//! │                                                      │                    │
//! │                                                      ▼                    │
//! │  ┌─────────────┐    ┌──────────────┐    ┌──────────────────────────────┐  │
//! │  │ PeerSession │◄──►│ EventLoop    │◄───│ ReplicationEngine            │  │
//! │  │ (wire)      │    │ (handlers)   │    │ (per-remote dirty iterators) │  │
//! │  └─────────────┘    └──────────────┘    └──────────────────────────────┘  │
//! │         │                                                                 │
//! │         ▼                                                                 │
//! │  ┌─────────────┐                                                          │
//! │  │ CursorStore │                                                          │
//! │  │ (SQLite)    │                                                          │
//! │  └─────────────┘                                                          │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## View Resolution
//!
//! A view is asked for by type at a path. An existing view wins; otherwise
//! the nearest leaf rule up the ancestor chain builds it; otherwise a
//! wrapping rule builds it around an underlying view resolved the same way.
//!
//! ## Replication
//!
//! Every entry carries a `(timestamp, identifier)` stamp and the higher stamp
//! wins, so all hosts converge regardless of delivery order. Entries
//! received from a host are never sent back to it.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use asset_tree::{AssetTree, ClusterContext, RequestContext};
//!
//! let tree = AssetTree::with_default_rules(ClusterContext::standalone(1));
//! let ctx = RequestContext::parse("/orders?view=map").expect("valid path");
//! let orders = tree.acquire_map(&ctx).expect("map");
//! orders.put("42", "pending");
//! assert_eq!(orders.get("42").as_deref(), Some("pending"));
//! ```

pub mod cluster;
pub mod config;
pub mod context;
pub mod cursor;
pub mod error;
pub mod metrics;
pub mod replication;
pub mod resilience;
pub mod rules;
pub mod store;
pub mod subscription;
pub mod tree;
pub mod wire;

// Re-exports for convenience
pub use cluster::ClusterContext;
pub use config::{ClusterConfig, CursorConfig, EngineConfig, HostConfig, ReplicationSettings};
pub use context::RequestContext;
pub use cursor::CursorStore;
pub use error::{InvalidSubscriber, Result, TreeError};
pub use replication::{
    EventLoop, PeerLink, PeerSession, PeerState, ReplicationEngine, ReplicationEntry, SessionOptions,
};
pub use store::{KeyValueStore, MapView, MemoryKeyValueStore, Publisher, Reference, TopicPublisher};
pub use subscription::{MapEvent, SimpleSubscription, Subscriber, SubscriptionCollection, TopicSubscriber};
pub use tree::{Asset, AssetTree, ViewHandle, ViewType};
pub use wire::{Frame, SubscriptionService, WireChannel, WireMessage};
