//! Configuration for the asset tree and its replication.
//!
//! Configuration is passed to [`ClusterContext::from_config()`](crate::cluster::ClusterContext::from_config)
//! and to the replication peers. It can be constructed programmatically or
//! deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use asset_tree::config::{EngineConfig, ClusterConfig, HostConfig};
//!
//! let config = EngineConfig {
//!     local_identifier: 1,
//!     clusters: vec![ClusterConfig {
//!         name: "cluster".into(),
//!         hosts: vec![
//!             HostConfig::new(1, "host1:8080"),
//!             HostConfig::new(2, "host2:8080"),
//!         ],
//!     }],
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! EngineConfig
//! ├── local_identifier: u8          # This host's identifier (1..=255)
//! ├── clusters: Vec<ClusterConfig>  # cluster name -> hosts
//! ├── replication: ReplicationSettings
//! │   ├── outbound_capacity         # bounded outbound frame queue
//! │   ├── max_entries_per_action    # entries drained per handler call
//! │   ├── idle_pause: "10ms"        # event loop park time when idle
//! │   ├── throttle: Option<ThrottleConfig>
//! │   └── reconnect: ReconnectConfig
//! └── cursor: CursorConfig          # SQLite last-update-time persistence
//! ```

use crate::error::{Result, TreeError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Identifier of this host. Used for conflict tie-breaking and loop suppression.
    pub local_identifier: u8,

    /// Clusters this host takes part in.
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,

    /// Replication tuning.
    #[serde(default)]
    pub replication: ReplicationSettings,

    /// Persistence of per-remote last-update times.
    #[serde(default)]
    pub cursor: CursorConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            local_identifier: 1,
            clusters: Vec::new(),
            replication: ReplicationSettings::default(),
            cursor: CursorConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Create a minimal config for testing.
    pub fn for_testing(local_identifier: u8) -> Self {
        Self {
            local_identifier,
            clusters: Vec::new(),
            replication: ReplicationSettings::testing(),
            cursor: CursorConfig::in_memory(),
        }
    }

    /// Add a cluster (builder style).
    pub fn with_cluster(mut self, cluster: ClusterConfig) -> Self {
        self.clusters.push(cluster);
        self
    }

    /// Check identifiers for consistency.
    ///
    /// Identifier 0 is reserved (it means "no host" on the wire). Within a
    /// cluster identifiers must be unique, and a cluster that lists hosts must
    /// list this one.
    pub fn validate(&self) -> Result<()> {
        if self.local_identifier == 0 {
            return Err(TreeError::Config(
                "local_identifier 0 is reserved".to_string(),
            ));
        }
        self.replication.validate()?;

        let mut names = HashSet::new();
        for cluster in &self.clusters {
            if !names.insert(cluster.name.as_str()) {
                return Err(TreeError::Config(format!(
                    "duplicate cluster '{}'",
                    cluster.name
                )));
            }

            let mut seen = HashSet::new();
            for host in &cluster.hosts {
                if host.identifier == 0 {
                    return Err(TreeError::Config(format!(
                        "cluster '{}': host identifier 0 is reserved",
                        cluster.name
                    )));
                }
                if !seen.insert(host.identifier) {
                    return Err(TreeError::Config(format!(
                        "cluster '{}': duplicate host identifier {}",
                        cluster.name, host.identifier
                    )));
                }
            }

            if !cluster.hosts.is_empty() && !seen.contains(&self.local_identifier) {
                return Err(TreeError::Config(format!(
                    "cluster '{}' does not list local identifier {}",
                    cluster.name, self.local_identifier
                )));
            }
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ClusterConfig: cluster name -> hosts
// ═══════════════════════════════════════════════════════════════════════════════

/// A named set of hosts that replicate to each other.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub name: String,
    #[serde(default)]
    pub hosts: Vec<HostConfig>,
}

/// One member of a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    /// Small integer, unique within the cluster.
    pub identifier: u8,
    /// Connect address, e.g. `"host2:8080"`. Interpreted by the transport.
    pub address: String,
}

impl HostConfig {
    pub fn new(identifier: u8, address: impl Into<String>) -> Self {
        Self {
            identifier,
            address: address.into(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReplicationSettings
// ═══════════════════════════════════════════════════════════════════════════════

/// Replication handler and event loop tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationSettings {
    /// Capacity of the bounded outbound frame queue per peer.
    /// When full, the handler reports "no progress" and retries next tick.
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,

    /// Maximum entries drained per handler action.
    #[serde(default = "default_max_entries_per_action")]
    pub max_entries_per_action: usize,

    /// How long the event loop parks when no handler made progress,
    /// as a duration string (e.g., "10ms").
    #[serde(default = "default_idle_pause")]
    pub idle_pause: String,

    /// Optional rate limit on outbound replication entries.
    #[serde(default)]
    pub throttle: Option<ThrottleConfig>,

    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

fn default_outbound_capacity() -> usize {
    1024
}

fn default_max_entries_per_action() -> usize {
    64
}

fn default_idle_pause() -> String {
    "10ms".to_string()
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            outbound_capacity: 1024,
            max_entries_per_action: 64,
            idle_pause: "10ms".to_string(),
            throttle: None,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl ReplicationSettings {
    /// Small queues and short pauses for tests.
    pub fn testing() -> Self {
        Self {
            outbound_capacity: 64,
            max_entries_per_action: 8,
            idle_pause: "2ms".to_string(),
            throttle: None,
            reconnect: ReconnectConfig::testing(),
        }
    }

    /// Reject settings the replication path cannot run with.
    pub fn validate(&self) -> Result<()> {
        if let Err(e) = humantime::parse_duration(&self.idle_pause) {
            return Err(TreeError::Config(format!(
                "idle_pause '{}' is not a duration: {}",
                self.idle_pause, e
            )));
        }
        if self.outbound_capacity == 0 {
            return Err(TreeError::Config("outbound_capacity must be at least 1".to_string()));
        }
        if self.max_entries_per_action == 0 {
            return Err(TreeError::Config(
                "max_entries_per_action must be at least 1".to_string(),
            ));
        }
        if let Some(throttle) = &self.throttle {
            if throttle.entries_per_sec == 0 {
                return Err(TreeError::Config(
                    "throttle.entries_per_sec must be at least 1".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Parse the idle_pause string to a Duration.
    pub fn idle_pause_duration(&self) -> Duration {
        humantime::parse_duration(&self.idle_pause).unwrap_or(Duration::from_millis(10))
    }

    /// Rate limit configuration for the replication handler.
    ///
    /// Returns `None` if throttling is disabled.
    pub fn rate_limit_config(&self) -> Option<crate::resilience::RateLimitConfig> {
        self.throttle.as_ref().map(|t| crate::resilience::RateLimitConfig {
            burst_size: t.burst,
            refill_rate: t.entries_per_sec,
        })
    }
}

/// Token-bucket throttle for outbound replication entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleConfig {
    pub entries_per_sec: u32,
    #[serde(default = "default_throttle_burst")]
    pub burst: u32,
}

fn default_throttle_burst() -> u32 {
    100
}

/// Reconnect backoff for peer links.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Maximum connect attempts per outage (0 = retry forever).
    #[serde(default)]
    pub max_attempts: usize,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay_ms: 100,
            max_delay_ms: 30_000,
        }
    }
}

impl ReconnectConfig {
    pub fn testing() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 5,
            max_delay_ms: 50,
        }
    }

    /// Convert into the retry schedule used by peer links.
    pub fn retry_config(&self) -> crate::resilience::RetryConfig {
        crate::resilience::RetryConfig {
            max_attempts: if self.max_attempts == 0 {
                usize::MAX
            } else {
                self.max_attempts
            },
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_factor: 2.0,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CursorConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Persistence of the last-update time acknowledged by each remote.
///
/// Without it a restarted host bootstraps every peer from time zero, which is
/// correct (replication is idempotent) but resends everything.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CursorConfig {
    /// Path to SQLite database for cursor storage.
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

fn default_true() -> bool {
    true
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "replication_cursors.db".to_string(),
            wal_mode: true,
        }
    }
}

impl CursorConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
        }
    }
}
