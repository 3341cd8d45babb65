//! Stack configuration types

use super::secret::{ClusterJoinToken, Secret};
use crate::error::{HomelabError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Node role in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Control-plane node running `k3s server`
    Server,
    /// Worker node running `k3s agent`
    Worker,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Server => "server",
            NodeRole::Worker => "worker",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeRole {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "server" => Ok(NodeRole::Server),
            "worker" => Ok(NodeRole::Worker),
            other => Err(other.to_string()),
        }
    }
}

/// A declared cluster node and the VM that backs it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSpec {
    /// Node name, unique within the stack
    pub name: String,
    /// Cluster role
    pub role: NodeRole,
    /// Proxmox host the VM runs on
    pub proxmox_node: String,
    /// Proxmox VMID
    pub vm_id: u32,
    /// IPv4 address, with or without CIDR suffix
    pub ip4: String,
    /// IPv4 gateway
    pub gw4: String,
    /// CPU cores
    pub cores: u32,
    /// Memory in MiB
    pub memory_mb: u64,
    /// Boot disk size in GiB
    pub disk_gb: u32,
    /// Datastore for the boot disk
    pub datastore_id: String,
    /// Datastore for the cloud-init drive
    pub init_datastore_id: String,
    /// Network bridge
    pub bridge: String,
    /// Optional VLAN tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan_id: Option<u16>,
}

impl NodeSpec {
    /// Address reachable over SSH (CIDR suffix stripped)
    pub fn host(&self) -> &str {
        ip_no_cidr(&self.ip4)
    }

    pub fn is_server(&self) -> bool {
        self.role == NodeRole::Server
    }
}

/// Strip a CIDR suffix from an address: `10.0.0.11/24` -> `10.0.0.11`
pub fn ip_no_cidr(ip: &str) -> &str {
    ip.split_once('/').map(|(addr, _)| addr).unwrap_or(ip)
}

/// Source template cloned for every VM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateSpec {
    /// Proxmox host holding the template
    pub node_name: String,
    /// Template VMID
    pub vm_id: u32,
}

/// Longhorn add-on settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LonghornSpec {
    pub replica_count: u32,
    pub kubelet_root_dir: String,
    /// Nodes with fast local disks; drives the storage label and disk creation
    pub ssd_node_names: Vec<String>,
}

/// Private key used for SSH sessions
#[derive(Debug, Clone)]
pub enum SshPrivateKey {
    /// Key file on the machine running homelab
    Path(PathBuf),
    /// Key material held in the stack file or environment
    Inline(Secret),
}

/// SSH credentials shared by every remote step
#[derive(Debug, Clone)]
pub struct SshAccess {
    pub user: String,
    pub private_key: SshPrivateKey,
    pub port: u16,
    /// Connection attempts per step before the host counts as unreachable
    pub connect_attempts: u32,
}

/// Minimum TLS version for the Proxmox API
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MinTls {
    V1_0,
    V1_1,
    V1_2,
    V1_3,
}

impl FromStr for MinTls {
    type Err = HomelabError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "1.0" => Ok(MinTls::V1_0),
            "1.1" => Ok(MinTls::V1_1),
            "1.2" => Ok(MinTls::V1_2),
            "1.3" => Ok(MinTls::V1_3),
            other => Err(HomelabError::Config(format!(
                "proxmox.minTls must be one of 1.0|1.1|1.2|1.3, got {:?}",
                other
            ))),
        }
    }
}

/// Proxmox VE API access
#[derive(Debug, Clone)]
pub struct ProxmoxSpec {
    /// API endpoint, e.g. `https://proxmox1:8006/`
    pub endpoint: String,
    /// e.g. `root@pam` or `homelab@pve`
    pub username: String,
    /// `USER@REALM!TOKENID=UUID`, or `TOKENID=UUID` combined with `username`
    pub api_token: Secret,
    /// Accept self-signed certificates
    pub insecure: bool,
    pub min_tls: MinTls,
}

/// Fully resolved stack configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Stack name; also the cluster label value
    pub stack: String,
    pub nodes: Vec<NodeSpec>,
    pub template: TemplateSpec,
    pub ssh: SshAccess,
    pub k3s_version: String,
    pub k3s_token: ClusterJoinToken,
    pub longhorn: LonghornSpec,
    pub proxmox: Option<ProxmoxSpec>,
    /// Proxmox host -> topology zone
    pub zone_map: BTreeMap<String, String>,
    /// Cap on concurrently running steps
    pub parallelism: Option<usize>,
    pub command_timeout: Duration,
    /// First server's address
    pub primary_server_ip: String,
}

impl Config {
    /// Server nodes in declaration order
    pub fn servers(&self) -> impl Iterator<Item = &NodeSpec> {
        self.nodes.iter().filter(|n| n.role == NodeRole::Server)
    }

    /// Worker nodes in declaration order
    pub fn workers(&self) -> impl Iterator<Item = &NodeSpec> {
        self.nodes.iter().filter(|n| n.role == NodeRole::Worker)
    }

    /// The primary server (first declared server)
    pub fn primary(&self) -> Result<&NodeSpec> {
        self.servers().next().ok_or(HomelabError::NoServerNode)
    }

    /// Kubernetes API endpoint of the cluster
    pub fn kube_api_server(&self) -> String {
        format!("https://{}:6443", self.primary_server_ip)
    }

    /// Look up a node by name
    pub fn node(&self, name: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.name == name)
    }
}
