//! Shared test utilities for integration and replication tests.
//!
//! This module provides:
//! - Recording subscribers
//! - Clustered hosts with a replicated map
//! - Session wiring between hosts
//! - A polling `eventually` helper

#![allow(dead_code)]

use asset_tree::config::{ClusterConfig, EngineConfig, HostConfig};
use asset_tree::subscription::Delivery;
use asset_tree::{
    AssetTree, ClusterContext, EventLoop, MapEvent, MapView, PeerSession, ReplicationEngine, RequestContext,
    SessionOptions, Subscriber, WireChannel,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const CLUSTER: &str = "grid";
pub const SHARED: &str = "/shared";

/// Subscriber that keeps everything it receives.
pub struct Recorder<T> {
    messages: Mutex<Vec<T>>,
    ended: AtomicUsize,
}

impl<T: Clone> Recorder<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            messages: Mutex::new(Vec::new()),
            ended: AtomicUsize::new(0),
        })
    }

    pub fn messages(&self) -> Vec<T> {
        self.messages.lock().unwrap().clone()
    }

    pub fn ended(&self) -> usize {
        self.ended.load(Ordering::SeqCst)
    }
}

impl<T: Clone + Send + 'static> Subscriber<T> for Recorder<T> {
    fn on_message(&self, message: T) -> Delivery {
        self.messages.lock().unwrap().push(message);
        Ok(())
    }

    fn on_end_of_subscription(&self) {
        self.ended.fetch_add(1, Ordering::SeqCst);
    }
}

/// One member of a test cluster.
pub struct Host {
    pub id: u8,
    pub tree: AssetTree,
    pub map: Arc<MapView>,
    pub engine: Arc<ReplicationEngine>,
}

impl Host {
    pub fn snapshot(&self) -> Vec<(String, String)> {
        self.map.entries()
    }
}

pub fn shared_ctx() -> RequestContext {
    RequestContext::builder(SHARED).cluster(CLUSTER).build()
}

/// A host `id` in a cluster of `ids`, with the shared map acquired.
pub fn host(id: u8, ids: &[u8]) -> Host {
    let config = EngineConfig::for_testing(id).with_cluster(ClusterConfig {
        name: CLUSTER.to_string(),
        hosts: ids.iter().map(|i| HostConfig::new(*i, format!("host{}:9000", i))).collect(),
    });
    let cluster = ClusterContext::from_config(&config).unwrap();
    let tree = AssetTree::with_default_rules(cluster);
    let ctx = shared_ctx();
    let map = tree.acquire_map(&ctx).unwrap();
    let engine = tree.acquire_replication(&ctx).unwrap();
    Host { id, tree, map, engine }
}

pub fn mesh(ids: &[u8]) -> Vec<Host> {
    ids.iter().map(|id| host(*id, ids)).collect()
}

/// Open a session pair between two hosts; `a` initiates.
pub async fn connect(a: &Host, b: &Host, event_loop: &EventLoop) -> (PeerSession, PeerSession) {
    connect_with(a, b, event_loop, SessionOptions::new(SHARED), SessionOptions::new(SHARED)).await
}

pub async fn connect_with(
    a: &Host,
    b: &Host,
    event_loop: &EventLoop,
    a_options: SessionOptions,
    b_options: SessionOptions,
) -> (PeerSession, PeerSession) {
    let (left, right) = WireChannel::pair(256);
    let (sa, sb) = tokio::join!(
        PeerSession::initiate(Arc::clone(&a.engine), left, event_loop, a_options),
        PeerSession::accept(Arc::clone(&b.engine), right, event_loop, b_options),
    );
    (sa.unwrap(), sb.unwrap())
}

/// Sessions between every pair of hosts.
pub async fn connect_all(hosts: &[Host], event_loop: &EventLoop) -> Vec<PeerSession> {
    let mut sessions = Vec::new();
    for (i, a) in hosts.iter().enumerate() {
        for b in &hosts[i + 1..] {
            let (sa, sb) = connect(a, b, event_loop).await;
            sessions.push(sa);
            sessions.push(sb);
        }
    }
    sessions
}

/// Poll `condition` every few milliseconds until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Whether every host holds exactly `expected` entries, all identical.
pub fn converged(hosts: &[Host], expected: usize) -> bool {
    let first = hosts[0].snapshot();
    first.len() == expected && hosts.iter().all(|h| h.snapshot() == first)
}

pub fn entry_keys(events: &[MapEvent]) -> Vec<String> {
    events.iter().map(|e| e.key().to_string()).collect()
}
