//! Kubeconfig retrieval
//!
//! Fetches the kubeconfig k3s generates on the primary server, points it at
//! the primary's reachable address, and stores it next to the state file.

use crate::bootstrap::render::render_kubeconfig_fetch;
use crate::bootstrap::{ClusterHandle, ExecutionStep, StepId, StepKind, TriggerFingerprint};
use crate::error::{HomelabError, Result};
use crate::remote::transport::write_private_file;
use crate::remote::{LocalTransport, RemoteExecutor};
use regex::Regex;
use std::path::{Path, PathBuf};

/// Step that reads the kubeconfig off the primary
pub const KUBECONFIG_STEP: &str = "k3s-get-kubeconfig";

/// Kubeconfig file name inside the state directory
pub const KUBECONFIG_FILE: &str = "kubeconfig";

/// Step fetching the kubeconfig from the primary server
pub fn kubeconfig_step(cluster: &ClusterHandle) -> ExecutionStep {
    let server_ip = cluster.primary_address();
    ExecutionStep {
        id: StepId::new(KUBECONFIG_STEP),
        kind: StepKind::FetchKubeconfig,
        node: cluster.primary_node().to_string(),
        target: server_ip.to_string(),
        script: render_kubeconfig_fetch(server_ip),
        triggers: TriggerFingerprint::new([server_ip]),
        depends_on: Vec::new(),
    }
}

/// Replace the loopback API address k3s writes with `server_ip`
pub fn rewrite_loopback(kubeconfig: &str, server_ip: &str) -> String {
    let loopback = match Regex::new(r"https://(127\.0\.0\.1|localhost)(:\d+)?") {
        Ok(re) => re,
        Err(_) => return kubeconfig.to_string(),
    };
    loopback
        .replace_all(kubeconfig, |caps: &regex::Captures<'_>| {
            let port = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            format!("https://{}{}", server_ip, port)
        })
        .into_owned()
}

/// Check that the text is a kubeconfig with at least one cluster
fn validate(kubeconfig: &str) -> Result<()> {
    let doc: serde_yaml::Value = serde_yaml::from_str(kubeconfig)?;
    let has_clusters = doc
        .get("clusters")
        .and_then(|c| c.as_sequence())
        .map(|c| !c.is_empty())
        .unwrap_or(false);
    if !has_clusters {
        return Err(HomelabError::Internal(
            "kubeconfig from the primary server has no clusters".to_string(),
        ));
    }
    Ok(())
}

/// Handle to a reachable cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KubeClient {
    kubeconfig: PathBuf,
    api_server: String,
}

impl KubeClient {
    /// Client for a kubeconfig already on disk
    pub fn from_file(kubeconfig: PathBuf, api_server: String) -> Self {
        Self {
            kubeconfig,
            api_server,
        }
    }

    pub fn kubeconfig(&self) -> &Path {
        &self.kubeconfig
    }

    pub fn api_server(&self) -> &str {
        &self.api_server
    }

    /// Local transport with `KUBECONFIG` pointing at this cluster
    pub fn transport(&self) -> LocalTransport {
        LocalTransport::new().env("KUBECONFIG", &self.kubeconfig.to_string_lossy())
    }
}

/// Builds a [`KubeClient`] once the cluster is up
pub struct KubeClientBuilder<'a> {
    executor: &'a RemoteExecutor,
    state_dir: &'a Path,
}

impl<'a> KubeClientBuilder<'a> {
    pub fn new(executor: &'a RemoteExecutor, state_dir: &'a Path) -> Self {
        Self {
            executor,
            state_dir,
        }
    }

    /// Fetch, rewrite and store the kubeconfig
    pub async fn build(&self, cluster: &ClusterHandle) -> Result<KubeClient> {
        let step = kubeconfig_step(cluster);
        let outcome = self.executor.execute(&step).await?;

        let kubeconfig = rewrite_loopback(&outcome.output.stdout, cluster.primary_address());
        validate(&kubeconfig)?;

        std::fs::create_dir_all(self.state_dir)?;
        let path = self.state_dir.join(KUBECONFIG_FILE);
        write_private_file(&path, kubeconfig.as_bytes())?;
        tracing::info!("Wrote kubeconfig for {} to {}", cluster.api_server(), path.display());

        Ok(KubeClient {
            kubeconfig: path,
            api_server: cluster.api_server(),
        })
    }
}
