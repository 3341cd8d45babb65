//! k3s script rendering
//!
//! Pure functions from node facts to the shell scripts run on each node. The
//! same inputs always render byte-identical scripts.

use super::step::Script;
use crate::config::{ClusterJoinToken, NodeRole, NodeSpec};
use crate::labels::NodeLabelSet;

pub const K3S_CONFIG_DIR: &str = "/etc/rancher/k3s";
pub const K3S_CONFIG_FILE: &str = "/etc/rancher/k3s/config.yaml";
pub const K3S_KUBECONFIG_FILE: &str = "/etc/rancher/k3s/k3s.yaml";
pub const K3S_INSTALL_URL: &str = "https://get.k3s.io";

/// Bundled k3s components disabled on servers (Longhorn replaces local-storage)
pub const DISABLED_COMPONENTS: &[&str] = &["traefik", "local-storage"];

/// Packages needed by k3s and Longhorn
pub const PREREQUISITE_PACKAGES: &[&str] = &["open-iscsi", "nfs-common"];

/// URL other nodes use to join the primary
pub fn server_url(primary_ip: &str) -> String {
    format!("https://{}:6443", primary_ip)
}

/// Inputs for one node's k3s script
#[derive(Debug)]
pub struct NodeScriptInput<'a> {
    pub node: &'a NodeSpec,
    pub is_primary: bool,
    /// Set iff the node joins an existing cluster
    pub server_url: Option<&'a str>,
    pub token: &'a ClusterJoinToken,
    pub labels: &'a NodeLabelSet,
    pub k3s_version: &'a str,
}

/// Install the OS dependencies of k3s and Longhorn
pub fn render_prerequisites() -> Script {
    Script::new(
        [
            "set -euo pipefail".to_string(),
            "sudo apt-get update -y".to_string(),
            format!("sudo apt-get install -y {}", PREREQUISITE_PACKAGES.join(" ")),
            "sudo systemctl enable --now iscsid || true".to_string(),
        ]
        .join("\n"),
    )
}

/// Render `/etc/rancher/k3s/config.yaml`
pub fn render_config_yaml(
    role: NodeRole,
    token: &ClusterJoinToken,
    server_url: Option<&str>,
    labels: &NodeLabelSet,
) -> String {
    let mut lines: Vec<String> = Vec::new();

    if role == NodeRole::Server {
        lines.push("write-kubeconfig-mode: \"644\"".to_string());
        lines.push("disable:".to_string());
        for component in DISABLED_COMPONENTS {
            lines.push(format!("  - {}", component));
        }
    }

    lines.push(format!("token: \"{}\"", yaml_escape(token.reveal())));
    if let Some(url) = server_url {
        lines.push(format!("server: \"{}\"", yaml_escape(url)));
    }

    lines.push("node-label:".to_string());
    for label in labels.iter() {
        lines.push(format!("  - \"{}\"", yaml_escape(&label.to_string())));
    }

    lines.join("\n")
}

/// Render the full install script for a server or agent
pub fn render_node_script(input: &NodeScriptInput<'_>) -> Script {
    debug_assert!(input.is_primary == input.server_url.is_none());

    let role = input.node.role;
    let config = render_config_yaml(role, input.token, input.server_url, input.labels);
    let mode = match role {
        NodeRole::Server => "server",
        NodeRole::Worker => "agent",
    };

    Script::new(format!(
        "set -euo pipefail\n\
         sudo mkdir -p {dir}\n\
         sudo tee {file} >/dev/null <<'YAML'\n\
         {config}\n\
         YAML\n\
         curl -sfL {url} | INSTALL_K3S_VERSION=\"{version}\" sh -s - {mode}\n",
        dir = K3S_CONFIG_DIR,
        file = K3S_CONFIG_FILE,
        config = config,
        url = K3S_INSTALL_URL,
        version = input.k3s_version,
        mode = mode,
    ))
}

/// Print the primary's kubeconfig with the loopback address replaced
pub fn render_kubeconfig_fetch(server_ip: &str) -> Script {
    Script::new(format!(
        "set -euo pipefail\nsudo cat {} | sed \"s/127.0.0.1/{}/\"",
        K3S_KUBECONFIG_FILE, server_ip
    ))
}

/// Escape a value for a double-quoted YAML scalar
fn yaml_escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
