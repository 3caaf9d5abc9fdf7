//! Cluster membership as seen by this host.
//!
//! A [`ClusterContext`] is built once from [`EngineConfig`] and handed to
//! the [`AssetTree`](crate::tree::AssetTree) at construction. Every view
//! factory reaches it through [`Asset::cluster`](crate::tree::Asset::cluster);
//! nothing is looked up globally.

use crate::config::{EngineConfig, HostConfig, ReplicationSettings};
use crate::error::Result;
use std::collections::BTreeMap;

/// Local identifier, cluster name → hosts, and replication tuning.
#[derive(Debug, Clone)]
pub struct ClusterContext {
    local_identifier: u8,
    clusters: BTreeMap<String, Vec<HostConfig>>,
    settings: ReplicationSettings,
}

impl ClusterContext {
    /// Build from a validated config.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            local_identifier: config.local_identifier,
            clusters: config
                .clusters
                .iter()
                .map(|c| (c.name.clone(), c.hosts.clone()))
                .collect(),
            settings: config.replication.clone(),
        })
    }

    /// A host that belongs to no cluster. Stores stay unreplicated.
    pub fn standalone(local_identifier: u8) -> Self {
        Self {
            local_identifier,
            clusters: BTreeMap::new(),
            settings: ReplicationSettings::default(),
        }
    }

    pub fn local_identifier(&self) -> u8 {
        self.local_identifier
    }

    pub fn settings(&self) -> &ReplicationSettings {
        &self.settings
    }

    pub fn contains(&self, cluster: &str) -> bool {
        self.clusters.contains_key(cluster)
    }

    pub fn cluster_names(&self) -> Vec<&str> {
        self.clusters.keys().map(String::as_str).collect()
    }

    pub fn hosts(&self, cluster: &str) -> Option<&[HostConfig]> {
        self.clusters.get(cluster).map(Vec::as_slice)
    }

    /// Identifiers of the other hosts of `cluster`, ascending.
    pub fn remote_identifiers(&self, cluster: &str) -> Vec<u8> {
        let mut ids: Vec<u8> = self
            .hosts(cluster)
            .unwrap_or_default()
            .iter()
            .map(|h| h.identifier)
            .filter(|id| *id != self.local_identifier)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Address of host `identifier` in `cluster`.
    pub fn address_of(&self, cluster: &str, identifier: u8) -> Option<&str> {
        self.hosts(cluster)?
            .iter()
            .find(|h| h.identifier == identifier)
            .map(|h| h.address.as_str())
    }
}
