//! Execution steps
//!
//! An [`ExecutionStep`] is one unit of remote work: a rendered script, the
//! host it runs on, the trigger fingerprint that decides when it must re-run,
//! and the steps it waits for.

use crate::remote::state::StepKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Step identifier, unique within a graph
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepId(String);

impl StepId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a step does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepKind {
    /// OS packages needed by k3s and Longhorn
    Prerequisites,
    /// First server, initializes the cluster
    PrimaryServer,
    /// Additional server joining the primary
    JoinServer,
    /// Worker joining the primary
    JoinAgent,
    /// Kubeconfig retrieval from the primary
    FetchKubeconfig,
    /// Kubernetes namespace
    Namespace,
    /// Kubernetes node label
    NodeLabel,
    /// Helm release
    HelmRelease,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Prerequisites => "prerequisites",
            StepKind::PrimaryServer => "primary-server",
            StepKind::JoinServer => "join-server",
            StepKind::JoinAgent => "join-agent",
            StepKind::FetchKubeconfig => "fetch-kubeconfig",
            StepKind::Namespace => "namespace",
            StepKind::NodeLabel => "node-label",
            StepKind::HelmRelease => "helm-release",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rendered shell script. May embed secrets, so it never prints its body
/// and has no equality; compare [`Script::digest`] or [`Script::body`].
#[derive(Clone)]
pub struct Script(String);

impl Script {
    pub fn new(body: String) -> Self {
        Self(body)
    }

    /// Script text, for the transport only
    pub fn body(&self) -> &str {
        &self.0
    }

    /// Short content digest, safe to log
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.0.as_bytes());
        let hex = format!("{:x}", hasher.finalize());
        hex[..12].to_string()
    }
}

impl fmt::Debug for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Script({} bytes, sha256:{})", self.0.len(), self.digest())
    }
}

/// Values whose change forces a step to re-run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerFingerprint(Vec<String>);

impl TriggerFingerprint {
    pub fn new<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(values.into_iter().map(Into::into).collect())
    }

    pub fn values(&self) -> &[String] {
        &self.0
    }

    /// SHA-256 over the length-prefixed values
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for value in &self.0 {
            hasher.update((value.len() as u64).to_le_bytes());
            hasher.update(value.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

impl fmt::Display for TriggerFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0.join(", "))
    }
}

/// Something a step waits for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dependency {
    /// A provisioned VM; always satisfied once the graph exists
    Vm { node: String, vm_id: u32 },
    /// Another step in the same graph
    Step(StepId),
}

/// One unit of remote work
#[derive(Debug, Clone)]
pub struct ExecutionStep {
    pub id: StepId,
    pub kind: StepKind,
    /// Node the step belongs to
    pub node: String,
    /// Host the script runs on
    pub target: String,
    pub script: Script,
    pub triggers: TriggerFingerprint,
    pub depends_on: Vec<Dependency>,
}

impl ExecutionStep {
    /// Step dependencies (VM anchors excluded)
    pub fn step_dependencies(&self) -> impl Iterator<Item = &StepId> {
        self.depends_on.iter().filter_map(|d| match d {
            Dependency::Step(id) => Some(id),
            Dependency::Vm { .. } => None,
        })
    }

    /// Check if this step waits for `id`
    pub fn depends_on_step(&self, id: &StepId) -> bool {
        self.step_dependencies().any(|d| d == id)
    }

    /// State store identity
    pub fn key(&self) -> StepKey {
        StepKey::new(self.id.as_str(), &self.target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_debug_hides_body() {
        let script = Script::new("token: \"s3cr3t\"".to_string());
        let debug = format!("{:?}", script);
        assert!(!debug.contains("s3cr3t"));
        assert!(debug.starts_with("Script("));
    }

    #[test]
    fn test_fingerprint_digest_tracks_every_value() {
        let base = TriggerFingerprint::new(["w1", "10.0.0.21", "v1.30.4+k3s1"]);
        let same = TriggerFingerprint::new(["w1", "10.0.0.21", "v1.30.4+k3s1"]);
        let bumped = TriggerFingerprint::new(["w1", "10.0.0.21", "v1.31.0+k3s1"]);

        assert_eq!(base.digest(), same.digest());
        assert_ne!(base.digest(), bumped.digest());
        assert_eq!(base.digest().len(), 64);
    }

    #[test]
    fn test_fingerprint_digest_is_not_ambiguous_across_boundaries() {
        let a = TriggerFingerprint::new(["ab", "c"]);
        let b = TriggerFingerprint::new(["a", "bc"]);
        assert_ne!(a.digest(), b.digest());
    }
}
