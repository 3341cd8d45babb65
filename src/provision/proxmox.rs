//! Proxmox VE API client

use super::vm::{VmHandle, VmOrigin, VmProvisioner};
use crate::config::{MinTls, NodeSpec, ProxmoxSpec, TemplateSpec};
use crate::error::{HomelabError, Result};
use async_trait::async_trait;
use reqwest::tls::Version;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

/// How often a running Proxmox task is polled
const TASK_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Longest a clone or start task may run
const TASK_TIMEOUT: Duration = Duration::from_secs(600);

/// Every Proxmox response wraps its payload in `data`
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    data: T,
}

/// Entry of `/cluster/resources?type=vm`
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterVm {
    pub vmid: u32,
    pub node: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

impl ClusterVm {
    pub fn is_running(&self) -> bool {
        self.status.as_deref() == Some("running")
    }
}

#[derive(Debug, Deserialize)]
struct TaskStatus {
    status: String,
    #[serde(default)]
    exitstatus: Option<String>,
}

/// `Authorization` header value for an API token
pub fn auth_header(username: &str, api_token: &str) -> String {
    if api_token.contains('!') {
        format!("PVEAPIToken={}", api_token)
    } else {
        format!("PVEAPIToken={}!{}", username, api_token)
    }
}

/// `net0` value: virtio NIC on the node's bridge, VLAN-tagged if set
pub fn net0_value(node: &NodeSpec) -> String {
    match node.vlan_id {
        Some(tag) => format!("virtio,bridge={},tag={}", node.bridge, tag),
        None => format!("virtio,bridge={}", node.bridge),
    }
}

/// `ipconfig0` value for cloud-init
pub fn ipconfig0_value(node: &NodeSpec) -> String {
    format!("ip={},gw={}", node.ip4, node.gw4)
}

/// VM settings applied after the clone
pub fn vm_config_params(node: &NodeSpec, ssh_user: &str) -> Vec<(&'static str, String)> {
    vec![
        ("cores", node.cores.to_string()),
        ("memory", node.memory_mb.to_string()),
        ("net0", net0_value(node)),
        ("ide2", format!("{}:cloudinit", node.init_datastore_id)),
        ("ipconfig0", ipconfig0_value(node)),
        ("ciuser", ssh_user.to_string()),
        ("agent", "enabled=1".to_string()),
        ("onboot", "1".to_string()),
    ]
}

fn tls_version(min: MinTls) -> Version {
    match min {
        MinTls::V1_0 => Version::TLS_1_0,
        MinTls::V1_1 => Version::TLS_1_1,
        MinTls::V1_2 => Version::TLS_1_2,
        MinTls::V1_3 => Version::TLS_1_3,
    }
}

/// Proxmox VE client; clones VMs from the template
pub struct ProxmoxClient {
    base_url: String,
    auth: String,
    ssh_user: String,
    client: reqwest::Client,
}

impl ProxmoxClient {
    /// Create a new client
    pub fn new(spec: &ProxmoxSpec, ssh_user: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(spec.insecure)
            .min_tls_version(tls_version(spec.min_tls))
            .timeout(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            base_url: format!("{}/api2/json", spec.endpoint.trim_end_matches('/')),
            auth: auth_header(&spec.username, spec.api_token.reveal()),
            ssh_user: ssh_user.to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn decode<T: DeserializeOwned>(what: &str, response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HomelabError::Proxmox(format!(
                "{} failed: {} {}",
                what,
                status,
                body.trim()
            )));
        }
        let envelope: ApiResponse<T> = response.json().await?;
        Ok(envelope.data)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .client
            .get(self.url(path))
            .header("Authorization", &self.auth)
            .send()
            .await?;
        Self::decode(path, response).await
    }

    async fn send_form<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        form: &[(&str, String)],
    ) -> Result<T> {
        let response = self
            .client
            .request(method, self.url(path))
            .header("Authorization", &self.auth)
            .form(form)
            .send()
            .await?;
        Self::decode(path, response).await
    }

    /// Every VM in the cluster
    pub async fn list_vms(&self) -> Result<Vec<ClusterVm>> {
        self.get("/cluster/resources?type=vm").await
    }

    /// Find a VM by id anywhere in the cluster
    pub async fn find_vm(&self, vm_id: u32) -> Result<Option<ClusterVm>> {
        Ok(self.list_vms().await?.into_iter().find(|vm| vm.vmid == vm_id))
    }

    /// Block until a task finishes; fail unless it exits OK
    pub async fn wait_for_task(&self, host: &str, upid: &str) -> Result<()> {
        let path = format!("/nodes/{}/tasks/{}/status", host, upid);
        let deadline = tokio::time::Instant::now() + TASK_TIMEOUT;

        loop {
            let task: TaskStatus = self.get(&path).await?;
            if task.status == "stopped" {
                return match task.exitstatus.as_deref() {
                    Some("OK") => Ok(()),
                    other => Err(HomelabError::Proxmox(format!(
                        "task {} on {} ended with {}",
                        upid,
                        host,
                        other.unwrap_or("unknown status")
                    ))),
                };
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(HomelabError::Timeout(format!(
                    "Proxmox task {} on {} still running after {}s",
                    upid,
                    host,
                    TASK_TIMEOUT.as_secs()
                )));
            }
            tokio::time::sleep(TASK_POLL_INTERVAL).await;
        }
    }

    async fn clone_vm(&self, node: &NodeSpec, template: &TemplateSpec) -> Result<()> {
        tracing::info!(
            "Cloning template {} on {} to VM {} ({}) on {}",
            template.vm_id,
            template.node_name,
            node.vm_id,
            node.name,
            node.proxmox_node
        );

        let path = format!("/nodes/{}/qemu/{}/clone", template.node_name, template.vm_id);
        let upid: String = self
            .send_form(
                reqwest::Method::POST,
                &path,
                &[
                    ("newid", node.vm_id.to_string()),
                    ("name", node.name.clone()),
                    ("target", node.proxmox_node.clone()),
                    ("storage", node.datastore_id.clone()),
                    ("full", "1".to_string()),
                ],
            )
            .await?;

        self.wait_for_task(&template.node_name, &upid).await
    }

    /// Apply VM settings and grow the boot disk. Either call may come back
    /// as a task; the VM is not started until both have finished.
    async fn configure_vm(&self, node: &NodeSpec) -> Result<()> {
        let base = format!("/nodes/{}/qemu/{}", node.proxmox_node, node.vm_id);

        let config_task: Option<String> = self
            .send_form(
                reqwest::Method::PUT,
                &format!("{}/config", base),
                &vm_config_params(node, &self.ssh_user),
            )
            .await?;
        if let Some(upid) = config_task {
            self.wait_for_task(&node.proxmox_node, &upid).await?;
        }

        let resize_task: Option<String> = self
            .send_form(
                reqwest::Method::PUT,
                &format!("{}/resize", base),
                &[
                    ("disk", "scsi0".to_string()),
                    ("size", format!("{}G", node.disk_gb)),
                ],
            )
            .await?;
        if let Some(upid) = resize_task {
            self.wait_for_task(&node.proxmox_node, &upid).await?;
        }

        Ok(())
    }

    async fn start_vm(&self, node: &NodeSpec) -> Result<()> {
        tracing::info!("Starting VM {} ({}) on {}", node.vm_id, node.name, node.proxmox_node);
        let path = format!("/nodes/{}/qemu/{}/status/start", node.proxmox_node, node.vm_id);
        let upid: String = self.send_form(reqwest::Method::POST, &path, &[]).await?;
        self.wait_for_task(&node.proxmox_node, &upid).await
    }
}

#[async_trait]
impl VmProvisioner for ProxmoxClient {
    async fn provision(&self, node: &NodeSpec, template: &TemplateSpec) -> Result<VmHandle> {
        let origin = match self.find_vm(node.vm_id).await? {
            Some(existing) if existing.node != node.proxmox_node => {
                return Err(HomelabError::Proxmox(format!(
                    "VM {} for node {} exists on {}, expected {}",
                    node.vm_id, node.name, existing.node, node.proxmox_node
                )));
            }
            Some(existing) => {
                tracing::info!("VM {} ({}) already exists, reusing", node.vm_id, node.name);
                if !existing.is_running() {
                    self.start_vm(node).await?;
                }
                VmOrigin::Existing
            }
            None => {
                self.clone_vm(node, template).await?;
                self.configure_vm(node).await?;
                self.start_vm(node).await?;
                VmOrigin::Created
            }
        };

        Ok(VmHandle {
            node: node.name.clone(),
            vm_id: node.vm_id,
            proxmox_node: node.proxmox_node.clone(),
            origin,
        })
    }
}
