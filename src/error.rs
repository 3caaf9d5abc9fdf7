// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the asset tree.
//!
//! Errors are categorized by the subsystem that raised them (view resolution,
//! child creation, replication, wire transport, cursor persistence) and carry
//! enough context (view type, path, remote identifier) to be actionable.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Surfaced | Description |
//! |------------|-----------|----------|-------------|
//! | `ResolutionFailure` | No | Yes | No leaf or wrapping rule produced the view |
//! | `PermissionDenied` | No | Yes | Child creation refused by a policy |
//! | `InvalidSubscriber` | No | No | Subscriber lost interest, removed locally |
//! | `ReplicationUnavailable` | No | No | Store runs unreplicated, logged |
//! | `TransportClosed` | Yes | Handler | Outbound channel closed, handler deregistered |
//! | `Handshake` | Yes | Session | Bootstrap exchange failed, retried on reconnect |
//! | `Codec` / `Decompression` | No | Yes | Malformed frame |
//! | `Config` | No | Yes | Configuration invalid |
//! | `CursorStore` | No | Yes | Local SQLite errors |
//! | `InvalidState` | No | Yes | State machine violation |
//! | `Shutdown` | No | Yes | Component is shutting down |
//! | `Internal` | No | Yes | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Use [`TreeError::is_retryable()`] to decide whether an operation should be
//! retried with backoff. Only transport-level failures are retryable: the
//! modification iterators keep their dirty state, so a reconnect replays
//! whatever was not acknowledged.

use thiserror::Error;

/// Result type alias for asset tree operations.
pub type Result<T> = std::result::Result<T, TreeError>;

/// Signal raised by a subscriber that no longer wants events.
///
/// Returned from [`Subscriber::on_message`](crate::subscription::Subscriber::on_message).
/// The delivering collection removes the subscriber and sends it a single
/// end-of-subscription callback; other subscribers are unaffected.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[error("subscriber is no longer interested")]
pub struct InvalidSubscriber;

/// Errors that can occur in the asset tree.
#[derive(Error, Debug)]
pub enum TreeError {
    /// No leaf or wrapping rule anywhere in the ancestor chain produced a view.
    ///
    /// Not retryable - register a rule or request a different view type.
    #[error("View not resolvable: {view_type} at '{path}'")]
    ResolutionFailure { view_type: String, path: String },

    /// A child policy refused to create a node.
    #[error("Permission denied creating '{path}'")]
    PermissionDenied { path: String },

    /// A subscriber signalled that it is no longer interested.
    ///
    /// Recovered locally by removal; never surfaced as a system error.
    #[error("Invalid subscriber")]
    InvalidSubscriber,

    /// No replication engine could be attached to a store.
    ///
    /// The store keeps working unreplicated; this is logged, not fatal.
    #[error("Replication unavailable for '{path}': {reason}")]
    ReplicationUnavailable { path: String, reason: String },

    /// The outbound channel towards a remote host is closed.
    ///
    /// Terminates the replication handler for that host.
    #[error("Transport closed (remote {remote_id})")]
    TransportClosed { remote_id: u8 },

    /// The bootstrap handshake with a peer failed.
    #[error("Handshake error: {0}")]
    Handshake(String),

    /// A frame could not be encoded or decoded.
    #[error("Codec error: {0}")]
    Codec(String),

    /// Zstd decompression failure on a frame payload.
    #[error("Decompression error: {0}")]
    Decompression(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// SQLite error during replication cursor persistence.
    #[error("Cursor store error: {0}")]
    CursorStore(#[from] sqlx::Error),

    /// Operation attempted in the wrong state.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TreeError {
    /// Create a resolution failure naming the requested type and path.
    pub fn resolution(view_type: impl std::fmt::Display, path: impl Into<String>) -> Self {
        Self::ResolutionFailure {
            view_type: view_type.to_string(),
            path: path.into(),
        }
    }

    /// Create a permission error for the given path.
    pub fn permission_denied(path: impl Into<String>) -> Self {
        Self::PermissionDenied { path: path.into() }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TransportClosed { .. } => true,
            Self::Handshake(_) => true,
            Self::ResolutionFailure { .. } => false,
            Self::PermissionDenied { .. } => false,
            Self::InvalidSubscriber => false,
            Self::ReplicationUnavailable { .. } => false,
            Self::Codec(_) => false,
            Self::Decompression(_) => false,
            Self::Config(_) => false,
            Self::CursorStore(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }
}

impl From<InvalidSubscriber> for TreeError {
    fn from(_: InvalidSubscriber) -> Self {
        Self::InvalidSubscriber
    }
}

impl From<serde_json::Error> for TreeError {
    fn from(e: serde_json::Error) -> Self {
        Self::Codec(e.to_string())
    }
}
