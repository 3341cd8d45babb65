//! Secret handles
//!
//! Join tokens, API tokens and inline private keys are carried as [`Secret`]s.
//! A secret can only be read through [`Secret::reveal`]; it has no equality and
//! prints as `[REDACTED]`, so it cannot leak through trigger fingerprints,
//! diffs or log lines.

use crate::error::{HomelabError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Opaque secret value
#[derive(Clone)]
pub struct Secret(Arc<str>);

impl Secret {
    /// Wrap a secret value
    pub fn new(value: impl Into<String>) -> Self {
        Self(Arc::from(value.into()))
    }

    /// Read the underlying value. Only call this at the point of script
    /// rendering or transport.
    pub fn reveal(&self) -> &str {
        &self.0
    }

    /// Check if the secret is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret([REDACTED])")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

/// Cluster join token shared by every node of one cluster
pub type ClusterJoinToken = Secret;

/// Where a secret comes from in the stack file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SecretSource {
    /// Read from an environment variable
    Env { env: String },
    /// Read from a file (trailing newline trimmed)
    File { file: String },
    /// Inline value
    Literal(String),
}

impl SecretSource {
    /// Resolve the source into a secret
    pub fn resolve(&self, key: &str) -> Result<Secret> {
        let value = match self {
            SecretSource::Env { env } => std::env::var(env).map_err(|_| {
                HomelabError::Config(format!(
                    "{}: environment variable {} is not set",
                    key, env
                ))
            })?,
            SecretSource::File { file } => {
                let path = expand_home(file);
                std::fs::read_to_string(&path)
                    .map_err(|e| {
                        HomelabError::Config(format!(
                            "{}: cannot read {}: {}",
                            key,
                            path.display(),
                            e
                        ))
                    })?
                    .trim_end_matches(['\r', '\n'])
                    .to_string()
            }
            SecretSource::Literal(value) => value.clone(),
        };

        if value.is_empty() {
            return Err(HomelabError::Config(format!("{} is empty", key)));
        }

        Ok(Secret::new(value))
    }
}

/// Expand a leading `~/` to the home directory
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
