//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Tree shape and view resolution
//! - Subscription fan-out
//! - Replication apply outcomes, handler throughput and catch-up markers
//! - Peer session state
//! - Replication cursor persistence
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `asset_tree_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use asset_tree::metrics;
//!
//! // After a replicated entry was applied
//! metrics::record_entry_applied("applied");
//!
//! // After a handler pushed a batch to host 2
//! metrics::record_entries_sent(2, 64);
//! ```

use crate::error::TreeError;
use metrics::{counter, gauge, histogram};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Tree
// ═══════════════════════════════════════════════════════════════════════════════

/// Record a node added to a tree.
pub fn record_asset_created() {
    counter!("asset_tree_assets_created_total").increment(1);
    gauge!("asset_tree_assets").increment(1.0);
}

/// Record a node closed and removed.
pub fn record_asset_closed() {
    counter!("asset_tree_assets_closed_total").increment(1);
    gauge!("asset_tree_assets").decrement(1.0);
}

/// Record a child creation refused by a policy.
pub fn record_permission_denied() {
    counter!("asset_tree_permission_denied_total").increment(1);
}

/// Record a view materialized by a leaf or wrapping rule.
pub fn record_view_resolved(view_type: &str, rule_kind: &str) {
    counter!(
        "asset_tree_views_resolved_total",
        "view_type" => view_type.to_string(),
        "rule" => rule_kind.to_string()
    )
    .increment(1);
}

/// Record a view request no rule could satisfy.
pub fn record_resolution_failure(view_type: &str) {
    counter!("asset_tree_resolution_failures_total", "view_type" => view_type.to_string()).increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════════
// Subscriptions
// ═══════════════════════════════════════════════════════════════════════════════

/// Record a subscriber registration (`entry`, `key`, `topic`, `downstream`, `simple`).
pub fn record_subscriber_registered(kind: &str) {
    counter!("asset_tree_subscribers_registered_total", "kind" => kind.to_string()).increment(1);
    gauge!("asset_tree_subscribers", "kind" => kind.to_string()).increment(1.0);
}

/// Record a subscriber leaving, by unregistration or because it lost interest.
pub fn record_subscriber_removed(kind: &str, reason: &str) {
    counter!(
        "asset_tree_subscribers_removed_total",
        "kind" => kind.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
    gauge!("asset_tree_subscribers", "kind" => kind.to_string()).decrement(1.0);
}

/// Record one event fan-out.
pub fn record_events_dispatched(deliveries: usize) {
    counter!("asset_tree_events_dispatched_total").increment(1);
    histogram!("asset_tree_event_fanout").record(deliveries as f64);
}

/// Record a remote subscriber dropped by the wire service.
pub fn record_remote_subscriber_dropped(reason: &str) {
    counter!("asset_tree_remote_subscribers_dropped_total", "reason" => reason.to_string()).increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════════
// Replication
// ═══════════════════════════════════════════════════════════════════════════════

/// Record a store that runs without replication because none could attach.
pub fn record_replication_unavailable() {
    counter!("asset_tree_replication_unavailable_total").increment(1);
}

/// Record the outcome of applying one remote entry
/// (`applied`, `duplicate`, `stale`, `echo`).
pub fn record_entry_applied(outcome: &str) {
    counter!("asset_tree_replication_entries_received_total", "outcome" => outcome.to_string()).increment(1);
}

/// Record entries pushed to a remote's outbound queue.
pub fn record_entries_sent(remote_id: u8, count: usize) {
    counter!("asset_tree_replication_entries_sent_total", "remote_id" => remote_id.to_string())
        .increment(count as u64);
}

/// Record an action that stopped on a full outbound queue.
pub fn record_handler_stall(remote_id: u8) {
    counter!("asset_tree_replication_handler_stalls_total", "remote_id" => remote_id.to_string()).increment(1);
}

/// Record a catch-up marker sent.
pub fn record_marker_sent(remote_id: u8) {
    counter!("asset_tree_replication_markers_sent_total", "remote_id" => remote_id.to_string()).increment(1);
}

/// Record a handler leaving its event loop.
pub fn record_handler_deregistered(handler: &str, reason: &TreeError) {
    let reason = match reason {
        TreeError::Shutdown => "shutdown",
        TreeError::TransportClosed { .. } => "transport_closed",
        _ => "error",
    };
    counter!(
        "asset_tree_handlers_deregistered_total",
        "handler" => handler.to_string(),
        "reason" => reason
    )
    .increment(1);
}

/// Record the number of entries marked dirty by a bootstrap request.
pub fn record_bootstrap(remote_id: u8, marked: usize) {
    counter!("asset_tree_replication_bootstraps_total", "remote_id" => remote_id.to_string()).increment(1);
    histogram!("asset_tree_replication_bootstrap_entries").record(marked as f64);
}

// ═══════════════════════════════════════════════════════════════════════════════
// Peers
// ═══════════════════════════════════════════════════════════════════════════════

/// Record a peer connection attempt.
pub fn record_peer_connection(remote_id: u8, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "asset_tree_peer_connections_total",
        "remote_id" => remote_id.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Record a peer session state transition.
pub fn record_peer_state(remote_id: u8, state: &str) {
    counter!(
        "asset_tree_peer_state_transitions_total",
        "remote_id" => remote_id.to_string(),
        "state" => state.to_string()
    )
    .increment(1);
    let streaming = if state == "streaming" { 1.0 } else { 0.0 };
    gauge!("asset_tree_peer_streaming", "remote_id" => remote_id.to_string()).set(streaming);
}

// ═══════════════════════════════════════════════════════════════════════════════
// Cursor persistence
// ═══════════════════════════════════════════════════════════════════════════════

/// Record cursor flush batch (debounced writes).
pub fn record_cursor_flush(flushed: usize, errors: usize, duration: Duration) {
    counter!("asset_tree_cursor_flushes_total").increment(1);
    counter!("asset_tree_cursor_flushed_count").increment(flushed as u64);
    if errors > 0 {
        counter!("asset_tree_cursor_flush_errors_total").increment(errors as u64);
    }
    histogram!("asset_tree_cursor_flush_duration_seconds").record(duration.as_secs_f64());
}

/// Record cursor SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn record_cursor_retry(operation: &str) {
    counter!("asset_tree_cursor_retries_total", "operation" => operation.to_string()).increment(1);
}
