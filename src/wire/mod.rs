//! Wire protocol between hosts.
//!
//! Every message travels in a [`Frame`] addressed by a content-stream-path
//! (`csp`, a [`RequestContext`](crate::context::RequestContext) URI), a
//! subscription id (`cid`) and a transaction id (`tid`). Frames move over a
//! [`WireChannel`], a pair of bounded tokio channels; socket handling lives
//! outside this crate and feeds channels through [`codec`].
//!
//! # Replication handshake
//!
//! ```text
//! initiator                               acceptor
//!     │ ── identifier { id } ─────────────→ │
//!     │ ←──────────── identifierReply { id } │
//!     │ ── bootstrap { id, lastUpdatedTime } → │
//!     │ ←─ bootstrap { id, lastUpdatedTime } ─ │
//!     │ ←──── replicationEvent / lastUpdateTime ──→ │
//! ```

pub mod codec;
mod subscription;

pub use subscription::SubscriptionService;

use crate::replication::ReplicationEntry;
use crate::subscription::MapEvent;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Addressed message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    pub csp: String,
    pub cid: u64,
    #[serde(default)]
    pub tid: u64,
    /// More frames follow for this `cid`.
    #[serde(default)]
    pub not_complete: bool,
    pub message: WireMessage,
}

impl Frame {
    pub fn new(csp: impl Into<String>, cid: u64, message: WireMessage) -> Self {
        Self {
            csp: csp.into(),
            cid,
            tid: 0,
            not_complete: false,
            message,
        }
    }

    pub fn with_tid(mut self, tid: u64) -> Self {
        self.tid = tid;
        self
    }

    pub fn streaming(mut self) -> Self {
        self.not_complete = true;
        self
    }
}

/// Message documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WireMessage {
    Identifier {
        id: u8,
    },
    IdentifierReply {
        id: u8,
    },
    Bootstrap {
        id: u8,
        #[serde(rename = "lastUpdatedTime")]
        last_updated_time: u64,
    },
    ReplicationEvent {
        entry: ReplicationEntry,
    },
    /// Catch-up marker: the sender has delivered everything up to `time`.
    LastUpdateTime {
        time: u64,
        id: u8,
    },
    /// Subscribe to map events, or to keys only.
    RegisterSubscriber {
        #[serde(default, rename = "keysOnly")]
        keys_only: bool,
    },
    RegisterTopicSubscriber,
    UnregisterSubscriber,
    UnregisterTopicSubscriber,
    OnEndOfSubscription,
    Reply {
        payload: ReplyPayload,
    },
    /// Request failed; `message` describes why.
    Error {
        message: String,
    },
}

impl WireMessage {
    /// Document type name, as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Identifier { .. } => "identifier",
            WireMessage::IdentifierReply { .. } => "identifierReply",
            WireMessage::Bootstrap { .. } => "bootstrap",
            WireMessage::ReplicationEvent { .. } => "replicationEvent",
            WireMessage::LastUpdateTime { .. } => "lastUpdateTime",
            WireMessage::RegisterSubscriber { .. } => "registerSubscriber",
            WireMessage::RegisterTopicSubscriber => "registerTopicSubscriber",
            WireMessage::UnregisterSubscriber => "unregisterSubscriber",
            WireMessage::UnregisterTopicSubscriber => "unregisterTopicSubscriber",
            WireMessage::OnEndOfSubscription => "onEndOfSubscription",
            WireMessage::Reply { .. } => "reply",
            WireMessage::Error { .. } => "error",
        }
    }
}

/// Body of a subscription reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ReplyPayload {
    Event { event: MapEvent },
    Key { key: String },
    Topic { topic: String, message: Option<String> },
}

/// Bidirectional frame channel to one counterpart.
#[derive(Debug)]
pub struct WireChannel {
    pub outbound: mpsc::Sender<Frame>,
    pub inbound: mpsc::Receiver<Frame>,
}

impl WireChannel {
    /// Two connected ends, each direction bounded to `capacity` frames.
    pub fn pair(capacity: usize) -> (WireChannel, WireChannel) {
        let capacity = capacity.max(1);
        let (a_tx, a_rx) = mpsc::channel(capacity);
        let (b_tx, b_rx) = mpsc::channel(capacity);
        (
            WireChannel {
                outbound: a_tx,
                inbound: b_rx,
            },
            WireChannel {
                outbound: b_tx,
                inbound: a_rx,
            },
        )
    }
}
