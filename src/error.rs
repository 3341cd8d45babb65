//! Error types for homelab

use thiserror::Error;

/// Result type for homelab operations
pub type Result<T> = std::result::Result<T, HomelabError>;

/// Homelab error types
#[derive(Error, Debug)]
pub enum HomelabError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid role {role:?} on node {node:?}. Must be one of [\"server\", \"worker\"]")]
    InvalidRole { node: String, role: String },

    #[error("Duplicate node name: {0}")]
    DuplicateNode(String),

    #[error("Define at least one server node (role: 'server')")]
    NoServerNode,

    #[error("No VM handle for node {0:?}")]
    MissingVm(String),

    #[error("Step {step} depends on unknown step {dependency}")]
    UnknownDependency { step: String, dependency: String },

    #[error("Circular dependency detected at step: {0}")]
    DependencyCycle(String),

    #[error("Step {step} ({kind}) failed on node {node} with exit code {exit_code}: {stderr}")]
    RemoteExecution {
        step: String,
        node: String,
        kind: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("Transport error for {host}: {message}")]
    Transport { host: String, message: String },

    #[error("Bootstrap incomplete: failed {failed:?}, skipped {skipped:?}")]
    BootstrapIncomplete {
        failed: Vec<String>,
        skipped: Vec<String>,
    },

    #[error("Proxmox API error: {0}")]
    Proxmox(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl HomelabError {
    /// Construction-time errors: the declaration itself is broken and nothing
    /// remote has been attempted yet.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            HomelabError::Config(_)
                | HomelabError::InvalidRole { .. }
                | HomelabError::DuplicateNode(_)
                | HomelabError::NoServerNode
                | HomelabError::MissingVm(_)
                | HomelabError::UnknownDependency { .. }
                | HomelabError::DependencyCycle(_)
                | HomelabError::Yaml(_)
        )
    }

    /// Errors raised while running a step on a host.
    pub fn is_execution_error(&self) -> bool {
        matches!(
            self,
            HomelabError::RemoteExecution { .. }
                | HomelabError::Transport { .. }
                | HomelabError::Timeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(HomelabError::NoServerNode.is_config_error());
        assert!(HomelabError::MissingVm("w1".to_string()).is_config_error());
        assert!(!HomelabError::NoServerNode.is_execution_error());

        let transport = HomelabError::Transport {
            host: "10.0.0.11".to_string(),
            message: "connection refused".to_string(),
        };
        assert!(transport.is_execution_error());
        assert!(!transport.is_config_error());
    }

    #[test]
    fn test_remote_execution_message_names_node_and_kind() {
        let err = HomelabError::RemoteExecution {
            step: "w1-k3s-agent".to_string(),
            node: "w1".to_string(),
            kind: "join-agent".to_string(),
            exit_code: 1,
            stderr: "curl: (6) Could not resolve host".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("w1-k3s-agent"));
        assert!(msg.contains("join-agent"));
        assert!(msg.contains("exit code 1"));
    }
}
