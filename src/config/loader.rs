//! Stack file loader

use super::models::{
    ip_no_cidr, Config, LonghornSpec, MinTls, NodeRole, NodeSpec, ProxmoxSpec, SshAccess,
    SshPrivateKey, TemplateSpec,
};
use super::secret::{expand_home, SecretSource};
use crate::error::{HomelabError, Result};
use crate::labels::constants::default_zone_map;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default stack file names
pub const DEFAULT_CONFIG_FILES: &[&str] = &["homelab.yaml", "homelab.yml", "stack.yaml"];

pub const DEFAULT_SSH_USER: &str = "ubuntu";
pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_SSH_CONNECT_ATTEMPTS: u32 = 20;
pub const DEFAULT_REPLICA_COUNT: u32 = 2;
pub const DEFAULT_KUBELET_ROOT_DIR: &str = "/var/lib/rancher/k3s/agent/kubelet";
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 900;

/// Stack file as written on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackFile {
    #[serde(default)]
    pub stack: Option<String>,
    #[serde(default)]
    pub ssh_user: Option<String>,
    #[serde(default)]
    pub ssh_private_key_path: Option<String>,
    #[serde(default)]
    pub ssh_private_key: Option<SecretSource>,
    #[serde(default)]
    pub ssh_port: Option<u16>,
    #[serde(default)]
    pub ssh_connect_attempts: Option<u32>,
    #[serde(default)]
    pub k3s_version: Option<String>,
    pub k3s_token: SecretSource,
    pub template: TemplateSpec,
    pub nodes: Vec<RawNodeSpec>,
    pub ssd_node_names: Vec<String>,
    #[serde(default)]
    pub longhorn_replica_count: Option<u32>,
    #[serde(default)]
    pub longhorn_kubelet_root_dir: Option<String>,
    #[serde(default)]
    pub zone_map: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub parallelism: Option<usize>,
    #[serde(default)]
    pub command_timeout_secs: Option<u64>,
    #[serde(default)]
    pub proxmox: Option<ProxmoxFile>,
}

/// Node entry before role validation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawNodeSpec {
    pub name: String,
    pub role: String,
    pub proxmox_node: String,
    pub vm_id: u32,
    pub ip4: String,
    pub gw4: String,
    pub cores: u32,
    pub memory_mb: u64,
    pub disk_gb: u32,
    pub datastore_id: String,
    pub init_datastore_id: String,
    pub bridge: String,
    #[serde(default)]
    pub vlan_id: Option<u16>,
}

impl RawNodeSpec {
    fn validate(self) -> Result<NodeSpec> {
        let role: NodeRole = self.role.parse().map_err(|role| HomelabError::InvalidRole {
            node: self.name.clone(),
            role,
        })?;

        Ok(NodeSpec {
            name: self.name,
            role,
            proxmox_node: self.proxmox_node,
            vm_id: self.vm_id,
            ip4: self.ip4,
            gw4: self.gw4,
            cores: self.cores,
            memory_mb: self.memory_mb,
            disk_gb: self.disk_gb,
            datastore_id: self.datastore_id,
            init_datastore_id: self.init_datastore_id,
            bridge: self.bridge,
            vlan_id: self.vlan_id,
        })
    }
}

/// Proxmox block of the stack file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxmoxFile {
    pub endpoint: String,
    pub username: String,
    pub api_token: SecretSource,
    #[serde(default)]
    pub insecure: Option<bool>,
    #[serde(default)]
    pub min_tls: Option<String>,
}

/// Stack file loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Find a stack file in directory
    pub fn find_config_file(dir: &Path) -> Option<PathBuf> {
        for name in DEFAULT_CONFIG_FILES {
            let path = dir.join(name);
            if path.exists() {
                return Some(path);
            }
        }
        None
    }

    /// Load and validate a stack file
    pub fn load_file(path: &Path) -> Result<Config> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            HomelabError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;

        Self::parse_str(&content)
    }

    /// Parse and validate a stack file from a string
    pub fn parse_str(content: &str) -> Result<Config> {
        let file: StackFile = serde_yaml::from_str(content)?;
        Self::resolve(file)
    }

    /// Validate a parsed stack file and resolve its secrets
    pub fn resolve(file: StackFile) -> Result<Config> {
        let stack = file.stack.unwrap_or_else(|| "homelab".to_string());

        let mut nodes = Vec::with_capacity(file.nodes.len());
        let mut seen = HashSet::new();
        for raw in file.nodes {
            let node = raw.validate()?;
            if !seen.insert(node.name.clone()) {
                return Err(HomelabError::DuplicateNode(node.name));
            }
            nodes.push(node);
        }

        let primary_server_ip = nodes
            .iter()
            .find(|n| n.role == NodeRole::Server)
            .map(|n| ip_no_cidr(&n.ip4).to_string())
            .ok_or(HomelabError::NoServerNode)?;

        let k3s_version = file.k3s_version.unwrap_or_default();
        if k3s_version.is_empty() {
            return Err(HomelabError::Config(
                "Missing required config key: k3sVersion".to_string(),
            ));
        }
        let k3s_token = file.k3s_token.resolve("k3sToken")?;

        let private_key = match (file.ssh_private_key_path, file.ssh_private_key) {
            (Some(path), _) => {
                let expanded = expand_home(&path);
                if !expanded.is_file() {
                    return Err(HomelabError::Config(format!(
                        "sshPrivateKeyPath does not exist: {}",
                        expanded.display()
                    )));
                }
                SshPrivateKey::Path(expanded)
            }
            (None, Some(source)) => SshPrivateKey::Inline(source.resolve("sshPrivateKey")?),
            (None, None) => {
                return Err(HomelabError::Config(
                    "Set either sshPrivateKeyPath or sshPrivateKey".to_string(),
                ))
            }
        };

        // ssdNodeNames is a set; keep the first occurrence of each name
        let mut ssd_seen = HashSet::new();
        let mut ssd_node_names = Vec::with_capacity(file.ssd_node_names.len());
        for name in file.ssd_node_names {
            if !ssd_seen.insert(name.clone()) {
                tracing::warn!("Ignoring duplicate ssdNodeNames entry {}", name);
                continue;
            }
            if !seen.contains(&name) {
                tracing::warn!("ssdNodeNames entry {} matches no declared node", name);
            }
            ssd_node_names.push(name);
        }

        let proxmox = match file.proxmox {
            Some(p) => Some(ProxmoxSpec {
                endpoint: p.endpoint,
                username: p.username,
                api_token: p.api_token.resolve("proxmox.apiToken")?,
                insecure: p.insecure.unwrap_or(true),
                min_tls: p.min_tls.as_deref().unwrap_or("1.3").parse::<MinTls>()?,
            }),
            None => None,
        };

        if file.ssh_connect_attempts == Some(0) {
            return Err(HomelabError::Config(
                "sshConnectAttempts must be at least 1".to_string(),
            ));
        }

        if file.parallelism == Some(0) {
            return Err(HomelabError::Config(
                "parallelism must be at least 1".to_string(),
            ));
        }

        Ok(Config {
            stack,
            nodes,
            template: file.template,
            ssh: SshAccess {
                user: file.ssh_user.unwrap_or_else(|| DEFAULT_SSH_USER.to_string()),
                private_key,
                port: file.ssh_port.unwrap_or(DEFAULT_SSH_PORT),
                connect_attempts: file
                    .ssh_connect_attempts
                    .unwrap_or(DEFAULT_SSH_CONNECT_ATTEMPTS),
            },
            k3s_version,
            k3s_token,
            longhorn: LonghornSpec {
                replica_count: file.longhorn_replica_count.unwrap_or(DEFAULT_REPLICA_COUNT),
                kubelet_root_dir: file
                    .longhorn_kubelet_root_dir
                    .unwrap_or_else(|| DEFAULT_KUBELET_ROOT_DIR.to_string()),
                ssd_node_names,
            },
            proxmox,
            zone_map: file.zone_map.unwrap_or_else(default_zone_map),
            parallelism: file.parallelism,
            command_timeout: Duration::from_secs(
                file.command_timeout_secs
                    .unwrap_or(DEFAULT_COMMAND_TIMEOUT_SECS),
            ),
            primary_server_ip,
        })
    }
}
