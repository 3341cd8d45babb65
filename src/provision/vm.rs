//! VM handles and the provisioner seam

use crate::config::{NodeSpec, TemplateSpec};
use crate::error::{HomelabError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinSet;

/// How the VM behind a handle came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmOrigin {
    /// Cloned from the template during this run
    Created,
    /// Already present on the Proxmox host
    Existing,
    /// Not checked; trusted to exist (`--skip-provision`)
    Adopted,
}

/// A ready VM; anchors the dependency graph of its node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmHandle {
    pub node: String,
    pub vm_id: u32,
    pub proxmox_node: String,
    pub origin: VmOrigin,
}

impl VmHandle {
    /// Handle for a VM trusted to exist without asking the hypervisor
    pub fn adopted(node: &NodeSpec) -> Self {
        Self {
            node: node.name.clone(),
            vm_id: node.vm_id,
            proxmox_node: node.proxmox_node.clone(),
            origin: VmOrigin::Adopted,
        }
    }
}

/// Creates the VM backing a node
#[async_trait]
pub trait VmProvisioner: Send + Sync {
    /// Make sure the node's VM exists and is running
    async fn provision(&self, node: &NodeSpec, template: &TemplateSpec) -> Result<VmHandle>;
}

/// Provision every node concurrently. Any failure aborts the run before a
/// single remote step executes.
pub async fn provision_all(
    provisioner: Arc<dyn VmProvisioner>,
    nodes: &[NodeSpec],
    template: &TemplateSpec,
) -> Result<HashMap<String, VmHandle>> {
    let mut tasks = JoinSet::new();

    for node in nodes {
        let provisioner = provisioner.clone();
        let node = node.clone();
        let template = template.clone();
        tasks.spawn(async move {
            let result = provisioner.provision(&node, &template).await;
            (node.name, result)
        });
    }

    let mut handles = HashMap::new();
    let mut failures = Vec::new();

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((name, Ok(handle))) => {
                tracing::info!("VM {} ready for node {} ({:?})", handle.vm_id, name, handle.origin);
                handles.insert(name, handle);
            }
            Ok((name, Err(e))) => {
                tracing::error!("Failed to provision VM for node {}: {}", name, e);
                failures.push(format!("{}: {}", name, e));
            }
            Err(e) => failures.push(format!("provisioning task panicked: {}", e)),
        }
    }

    if !failures.is_empty() {
        return Err(HomelabError::Proxmox(format!(
            "VM provisioning failed: {}",
            failures.join("; ")
        )));
    }

    Ok(handles)
}
