use crate::store::Stamp;
use serde::{Deserialize, Serialize};

/// One replicated mutation.
///
/// `value` is `None` for a deletion (`is_deleted` is then set too). When two
/// entries for the same key race, the higher `(timestamp, identifier)` wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationEntry {
    pub key: String,
    pub value: Option<String>,
    pub timestamp: u64,
    /// Host that produced the mutation.
    pub identifier: u8,
    pub is_deleted: bool,
    /// When the sender's bootstrap cursor began (0 outside a bootstrap).
    /// Informational: lets a receiver tell catch-up traffic from live writes.
    #[serde(default)]
    pub bootstrap_timestamp: u64,
}

impl ReplicationEntry {
    pub fn put(key: impl Into<String>, value: impl Into<String>, stamp: Stamp) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
            timestamp: stamp.timestamp,
            identifier: stamp.identifier,
            is_deleted: false,
            bootstrap_timestamp: 0,
        }
    }

    pub fn tombstone(key: impl Into<String>, stamp: Stamp) -> Self {
        Self {
            key: key.into(),
            value: None,
            timestamp: stamp.timestamp,
            identifier: stamp.identifier,
            is_deleted: true,
            bootstrap_timestamp: 0,
        }
    }

    pub fn stamp(&self) -> Stamp {
        Stamp::new(self.timestamp, self.identifier)
    }

    /// Whether this entry wins over what is stored (`None` = nothing stored).
    pub fn supersedes(&self, stored: Option<Stamp>) -> bool {
        stored.map_or(true, |stored| self.stamp() > stored)
    }

    /// Value to store: `None` for deletions, whatever `value` says.
    pub fn effective_value(&self) -> Option<&str> {
        if self.is_deleted {
            None
        } else {
            self.value.as_deref()
        }
    }
}
