//! Node label derivation

use super::constants::{LABEL_CLUSTER, LABEL_NODEPOOL, LABEL_ROLE, LABEL_STORAGE, LABEL_ZONE};
use crate::config::NodeSpec;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Storage tier of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageTier {
    Ssd,
    Hdd,
}

impl StorageTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageTier::Ssd => "ssd",
            StorageTier::Hdd => "hdd",
        }
    }

    /// Node pool implied by the tier
    pub fn node_pool(&self) -> NodePool {
        match self {
            StorageTier::Ssd => NodePool::Core,
            StorageTier::Hdd => NodePool::Bulk,
        }
    }
}

/// Scheduling pool of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodePool {
    Core,
    Bulk,
}

impl NodePool {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodePool::Core => "core",
            NodePool::Bulk => "bulk",
        }
    }
}

/// A single `key=value` node label
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeLabel {
    pub key: String,
    pub value: String,
}

impl fmt::Display for NodeLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// Ordered labels for one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeLabelSet(Vec<NodeLabel>);

impl NodeLabelSet {
    /// Get a label value by key
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|l| l.key == key)
            .map(|l| l.value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeLabel> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Labels rendered as `key=value` strings
    pub fn to_strings(&self) -> Vec<String> {
        self.0.iter().map(|l| l.to_string()).collect()
    }
}

/// Proxmox host -> zone lookup with identity fallback
#[derive(Debug, Clone, Default)]
pub struct ZoneTable(BTreeMap<String, String>);

impl ZoneTable {
    pub fn new(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }

    /// Zone for a host, or the host name itself when unmapped
    pub fn resolve<'a>(&'a self, host: &'a str) -> &'a str {
        self.0.get(host).map(String::as_str).unwrap_or(host)
    }
}

/// Derives scheduling labels from static cluster facts
#[derive(Debug, Clone)]
pub struct LabelDeriver {
    cluster_name: String,
    fast_storage: BTreeSet<String>,
    zones: ZoneTable,
}

impl LabelDeriver {
    /// Create a new deriver
    pub fn new<I, S>(cluster_name: &str, fast_storage: I, zones: ZoneTable) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            cluster_name: cluster_name.to_string(),
            fast_storage: fast_storage.into_iter().map(Into::into).collect(),
            zones,
        }
    }

    /// Storage tier of a node: ssd iff it is a fast-storage node
    pub fn storage_tier(&self, node: &NodeSpec) -> StorageTier {
        if self.fast_storage.contains(&node.name) {
            StorageTier::Ssd
        } else {
            StorageTier::Hdd
        }
    }

    /// Derive the label set of a node
    pub fn derive(&self, node: &NodeSpec) -> NodeLabelSet {
        let tier = self.storage_tier(node);
        let zone = self.zones.resolve(&node.proxmox_node);

        let label = |key: &str, value: &str| NodeLabel {
            key: key.to_string(),
            value: value.to_string(),
        };

        NodeLabelSet(vec![
            label(LABEL_CLUSTER, &self.cluster_name),
            label(LABEL_ROLE, node.role.as_str()),
            label(LABEL_STORAGE, tier.as_str()),
            label(LABEL_NODEPOOL, tier.node_pool().as_str()),
            label(LABEL_ZONE, zone),
        ])
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::NodeRole;
    use crate::labels::constants::default_zone_map;

    pub(crate) fn node(name: &str, role: NodeRole, host: &str, ip4: &str) -> NodeSpec {
        NodeSpec {
            name: name.to_string(),
            role,
            proxmox_node: host.to_string(),
            vm_id: 100,
            ip4: ip4.to_string(),
            gw4: "10.0.0.1".to_string(),
            cores: 2,
            memory_mb: 4096,
            disk_gb: 32,
            datastore_id: "local-lvm".to_string(),
            init_datastore_id: "local-lvm".to_string(),
            bridge: "vmbr0".to_string(),
            vlan_id: None,
        }
    }

    fn deriver() -> LabelDeriver {
        LabelDeriver::new("lab", ["srv1"], ZoneTable::new(default_zone_map()))
    }

    #[test]
    fn test_fast_storage_node_is_ssd_core() {
        let srv1 = node("srv1", NodeRole::Server, "proxmox1", "10.0.0.11/24");
        let labels = deriver().derive(&srv1);

        assert_eq!(labels.get(LABEL_STORAGE), Some("ssd"));
        assert_eq!(labels.get(LABEL_NODEPOOL), Some("core"));
        assert_eq!(labels.get(LABEL_ROLE), Some("server"));
        assert_eq!(labels.get(LABEL_CLUSTER), Some("lab"));
        assert_eq!(labels.get(LABEL_ZONE), Some("zone-a"));
    }

    #[test]
    fn test_other_node_is_hdd_bulk() {
        let w1 = node("w1", NodeRole::Worker, "proxmox2", "10.0.0.21/24");
        let labels = deriver().derive(&w1);

        assert_eq!(labels.get(LABEL_STORAGE), Some("hdd"));
        assert_eq!(labels.get(LABEL_NODEPOOL), Some("bulk"));
        assert_eq!(labels.get(LABEL_ZONE), Some("zone-b"));
    }

    #[test]
    fn test_unmapped_host_falls_back_to_host_name() {
        let w2 = node("w2", NodeRole::Worker, "pve-lab", "10.0.0.22");
        let labels = deriver().derive(&w2);
        assert_eq!(labels.get(LABEL_ZONE), Some("pve-lab"));
    }

    #[test]
    fn test_label_order_and_determinism() {
        let srv1 = node("srv1", NodeRole::Server, "proxmox1", "10.0.0.11");
        let first = deriver().derive(&srv1);
        let second = deriver().derive(&srv1);

        assert_eq!(first, second);
        assert_eq!(
            first.to_strings(),
            vec![
                "homelab.pukar.io/cluster=lab",
                "homelab.pukar.io/role=server",
                "homelab.pukar.io/storage=ssd",
                "homelab.pukar.io/nodepool=core",
                "topology.kubernetes.io/zone=zone-a",
            ]
        );
    }
}
