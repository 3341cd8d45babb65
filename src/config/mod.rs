//! Stack configuration
//!
//! This module loads the YAML stack file describing the nodes, the VM
//! template, SSH access, k3s settings and the Longhorn add-on.

pub mod loader;
pub mod models;
pub mod secret;

pub use loader::ConfigLoader;
pub use models::{
    ip_no_cidr, Config, LonghornSpec, MinTls, NodeRole, NodeSpec, ProxmoxSpec, SshAccess,
    SshPrivateKey, TemplateSpec,
};
pub use secret::{ClusterJoinToken, Secret, SecretSource};
