// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Identifier-tagged mesh replication.
//!
//! Every host in a cluster carries a small integer identifier. Each
//! replicated store owns one [`ReplicationEngine`], which keeps one
//! [`ModificationIterator`] per remote host: the set of keys that host has
//! not yet been sent.
//!
//! # Data Flow
//!
//! ```text
//! local put ──→ store ──→ engine.on_local_change ──→ iterator[r].mark_dirty (all r)
//!                                                          │
//!                                 ReplicationHandler ←─────┘ (event loop)
//!                                          │ next_entry
//!                                          ↓
//!                               outbound channel ──→ remote host
//!
//! remote entry ──→ engine.apply_replication ──→ store (conflict rule)
//!                           │
//!                           └─→ iterator[r].mark_dirty (r ≠ origin, relay)
//! ```
//!
//! # Loop Suppression
//!
//! An entry is never sent back to the host that produced it, and an entry
//! arriving with the local identifier is dropped. Together with the
//! `(timestamp, identifier)` conflict rule this makes re-delivery harmless.
//!
//! # Bootstrap
//!
//! On (re)connect each side reports the last modification time it has
//! received from the other ([`peer`]). The counterpart marks every entry at
//! or after that time dirty, so nothing missed during a disconnect is lost.
//! After draining, the handler sends a `lastUpdateTime` catch-up marker.

mod engine;
mod entry;
mod event_loop;
mod handler;
mod iterator;
pub mod peer;

pub use engine::ReplicationEngine;
pub use entry::ReplicationEntry;
pub use event_loop::{EventHandler, EventLoop};
pub use handler::ReplicationHandler;
pub use iterator::ModificationIterator;
pub use peer::{Connector, PeerLink, PeerSession, PeerState, SessionOptions};

/// Milliseconds since the Unix epoch.
pub fn current_time_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
