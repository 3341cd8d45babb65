//! Label keys and static topology tables

use std::collections::BTreeMap;

/// Label namespace for homelab labels
pub const LABEL_PREFIX: &str = "homelab.pukar.io";

pub const LABEL_CLUSTER: &str = "homelab.pukar.io/cluster";
pub const LABEL_ROLE: &str = "homelab.pukar.io/role";
pub const LABEL_STORAGE: &str = "homelab.pukar.io/storage";
pub const LABEL_NODEPOOL: &str = "homelab.pukar.io/nodepool";

/// Kubernetes standard topology label
pub const LABEL_ZONE: &str = "topology.kubernetes.io/zone";

/// Hypervisor host -> zone
pub const ZONE_MAP: &[(&str, &str)] = &[
    ("proxmox1", "zone-a"),
    ("proxmox2", "zone-b"),
    ("proxmox3", "zone-c"),
];

pub const LONGHORN_NAMESPACE: &str = "longhorn-system";
pub const LONGHORN_DISK_LABEL: &str = "node.longhorn.io/create-default-disk";

/// Owned copy of [`ZONE_MAP`]
pub fn default_zone_map() -> BTreeMap<String, String> {
    ZONE_MAP
        .iter()
        .map(|(host, zone)| (host.to_string(), zone.to_string()))
        .collect()
}
