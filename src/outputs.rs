//! Stack outputs published after a successful `up`

use crate::config::Config;
use crate::error::Result;
use crate::labels::constants::LONGHORN_NAMESPACE;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Outputs file name inside the state directory
pub const OUTPUTS_FILE: &str = "outputs.json";

/// Externally visible results of a stack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackOutputs {
    pub stack: String,
    pub kube_api_server: String,
    pub longhorn_namespace: String,
    pub ssd_node_names: Vec<String>,
}

impl StackOutputs {
    pub fn from_config(config: &Config) -> Self {
        Self {
            stack: config.stack.clone(),
            kube_api_server: config.kube_api_server(),
            longhorn_namespace: LONGHORN_NAMESPACE.to_string(),
            ssd_node_names: config.longhorn.ssd_node_names.clone(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write `outputs.json` into `state_dir`
    pub fn save(&self, state_dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(state_dir)?;
        let path = state_dir.join(OUTPUTS_FILE);
        std::fs::write(&path, self.to_json()?)?;
        Ok(path)
    }

    /// Outputs of the last successful `up`, if any
    pub fn load(state_dir: &Path) -> Result<Option<Self>> {
        let path = state_dir.join(OUTPUTS_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }
}
