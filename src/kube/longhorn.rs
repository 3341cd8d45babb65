//! Longhorn storage add-on
//!
//! Creates the namespace, marks the fast-storage nodes for default disk
//! creation, and installs the Helm chart once both are in place. Every step
//! runs locally with kubectl or helm against the cluster's kubeconfig.

use super::kubeconfig::KubeClient;
use crate::bootstrap::{
    Dependency, ExecutionStep, PassReport, Scheduler, Script, StepGraph, StepId, StepKind,
    TriggerFingerprint,
};
use crate::config::LonghornSpec;
use crate::error::Result;
use crate::labels::constants::LONGHORN_DISK_LABEL;
use crate::remote::{RemoteExecutor, StateStore};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

pub const LONGHORN_CHART_REPO: &str = "https://charts.longhorn.io";
pub const LONGHORN_CHART: &str = "longhorn";
pub const LONGHORN_RELEASE: &str = "longhorn";

/// Node recorded on add-on steps
const LOCAL_NODE: &str = "localhost";

pub fn namespace_step_id() -> StepId {
    StepId::new("longhorn-namespace")
}

pub fn disk_label_step_id(node: &str) -> StepId {
    StepId::new(format!("label-{}-longhorn-disk", node))
}

pub fn release_step_id() -> StepId {
    StepId::new("longhorn-release")
}

/// Plans the Longhorn install for one cluster
pub struct LonghornInstaller<'a> {
    namespace: &'a str,
    spec: &'a LonghornSpec,
}

impl<'a> LonghornInstaller<'a> {
    pub fn new(namespace: &'a str, spec: &'a LonghornSpec) -> Self {
        Self { namespace, spec }
    }

    /// Chart values
    pub fn helm_values(&self) -> serde_json::Value {
        json!({
            "defaultSettings": {
                "createDefaultDiskLabeledNodes": "true",
                "defaultReplicaCount": self.spec.replica_count.to_string(),
            },
            "persistence": {
                "defaultClassReplicaCount": self.spec.replica_count,
            },
            "csi": {
                "kubeletRootDir": self.spec.kubelet_root_dir,
            },
        })
    }

    fn namespace_step(&self, target: &str) -> ExecutionStep {
        ExecutionStep {
            id: namespace_step_id(),
            kind: StepKind::Namespace,
            node: LOCAL_NODE.to_string(),
            target: target.to_string(),
            script: Script::new(format!(
                "set -euo pipefail\nkubectl create namespace {ns} --dry-run=client -o yaml | kubectl apply -f -",
                ns = self.namespace
            )),
            triggers: TriggerFingerprint::new([self.namespace]),
            depends_on: Vec::new(),
        }
    }

    fn disk_label_step(&self, node: &str, target: &str) -> ExecutionStep {
        ExecutionStep {
            id: disk_label_step_id(node),
            kind: StepKind::NodeLabel,
            node: node.to_string(),
            target: target.to_string(),
            script: Script::new(format!(
                "set -euo pipefail\nkubectl label node {} {}=true --overwrite",
                node, LONGHORN_DISK_LABEL
            )),
            triggers: TriggerFingerprint::new([node, LONGHORN_DISK_LABEL]),
            depends_on: Vec::new(),
        }
    }

    fn release_step(&self, target: &str, after: Vec<Dependency>) -> ExecutionStep {
        let values = self.helm_values().to_string();
        ExecutionStep {
            id: release_step_id(),
            kind: StepKind::HelmRelease,
            node: LOCAL_NODE.to_string(),
            target: target.to_string(),
            script: Script::new(format!(
                "set -euo pipefail\n\
                 values=\"$(mktemp)\"\n\
                 trap 'rm -f \"$values\"' EXIT\n\
                 cat > \"$values\" <<'VALUES'\n\
                 {values}\n\
                 VALUES\n\
                 helm upgrade --install {release} {chart} --repo {repo} --namespace {ns} --values \"$values\" --wait",
                values = values,
                release = LONGHORN_RELEASE,
                chart = LONGHORN_CHART,
                repo = LONGHORN_CHART_REPO,
                ns = self.namespace,
            )),
            triggers: TriggerFingerprint::new([self.namespace, values.as_str()]),
            depends_on: after,
        }
    }

    /// Add-on steps; the release waits on the namespace and every label.
    /// Steps target the API server so their state is per cluster.
    pub fn steps(&self, client: &KubeClient) -> Vec<ExecutionStep> {
        let target = client.api_server();
        let mut steps = vec![self.namespace_step(target)];
        let mut release_deps = vec![Dependency::Step(namespace_step_id())];

        for node in &self.spec.ssd_node_names {
            steps.push(self.disk_label_step(node, target));
            release_deps.push(Dependency::Step(disk_label_step_id(node)));
        }

        steps.push(self.release_step(target, release_deps));
        steps
    }

    pub fn graph(&self, client: &KubeClient) -> Result<StepGraph> {
        StepGraph::new(self.steps(client))
    }

    /// Run the add-on steps locally against the cluster
    pub async fn install(
        &self,
        client: &KubeClient,
        store: Arc<dyn StateStore>,
        timeout: Duration,
        parallelism: Option<usize>,
    ) -> Result<PassReport> {
        let graph = self.graph(client)?;
        let executor = RemoteExecutor::new(Arc::new(client.transport()), store).timeout(timeout);
        let scheduler = Scheduler::new(Arc::new(executor), parallelism);

        tracing::info!(
            "Installing Longhorn into {} ({} fast-storage nodes)",
            self.namespace,
            self.spec.ssd_node_names.len()
        );
        Ok(scheduler.run(&graph).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::StepResult;
    use crate::labels::constants::LONGHORN_NAMESPACE;
    use crate::remote::testing::ScriptedTransport;
    use crate::remote::MemoryStateStore;
    use std::path::PathBuf;

    fn spec() -> LonghornSpec {
        LonghornSpec {
            replica_count: 2,
            kubelet_root_dir: "/var/lib/rancher/k3s/agent/kubelet".to_string(),
            ssd_node_names: vec!["srv1".to_string(), "srv2".to_string()],
        }
    }

    fn client() -> KubeClient {
        KubeClient::from_file(
            PathBuf::from("/tmp/kubeconfig"),
            "https://10.0.0.11:6443".to_string(),
        )
    }

    #[test]
    fn test_helm_values() {
        let spec = spec();
        let values = LonghornInstaller::new(LONGHORN_NAMESPACE, &spec).helm_values();
        assert_eq!(values["defaultSettings"]["createDefaultDiskLabeledNodes"], "true");
        assert_eq!(values["defaultSettings"]["defaultReplicaCount"], "2");
        assert_eq!(values["persistence"]["defaultClassReplicaCount"], 2);
        assert_eq!(values["csi"]["kubeletRootDir"], "/var/lib/rancher/k3s/agent/kubelet");
    }

    #[test]
    fn test_release_depends_on_namespace_and_every_label() {
        let spec = spec();
        let graph = LonghornInstaller::new(LONGHORN_NAMESPACE, &spec)
            .graph(&client())
            .unwrap();
        assert_eq!(graph.len(), 4);

        let release = graph.get(&release_step_id()).unwrap();
        let deps: Vec<&StepId> = release.step_dependencies().collect();
        assert_eq!(
            deps,
            vec![&namespace_step_id(), &disk_label_step_id("srv1"), &disk_label_step_id("srv2")]
        );
        assert!(release.script.body().contains("--repo https://charts.longhorn.io"));
        assert!(release.script.body().contains("--namespace longhorn-system"));

        let label = graph.get(&disk_label_step_id("srv1")).unwrap();
        assert!(label
            .script
            .body()
            .contains("kubectl label node srv1 node.longhorn.io/create-default-disk=true --overwrite"));
        assert_eq!(graph.topological_order().last(), Some(&release_step_id()));
    }

    #[tokio::test]
    async fn test_failed_label_blocks_release() {
        let spec = spec();
        let installer = LonghornInstaller::new(LONGHORN_NAMESPACE, &spec);
        let transport = Arc::new(ScriptedTransport::new());
        transport.fail_when("https://10.0.0.11:6443", "label node srv2", 1);

        let executor = RemoteExecutor::new(transport, Arc::new(MemoryStateStore::new()));
        let report = Scheduler::new(Arc::new(executor), None)
            .run(&installer.graph(&client()).unwrap())
            .await;

        assert!(report.get(&namespace_step_id()).unwrap().is_success());
        assert!(report.get(&disk_label_step_id("srv1")).unwrap().is_success());
        assert!(matches!(
            report.get(&release_step_id()),
            Some(StepResult::Skipped { blocked_by: Some(b) }) if *b == disk_label_step_id("srv2")
        ));
    }

    #[test]
    fn test_replica_count_change_changes_release_trigger() {
        let two = spec();
        let mut three = spec();
        three.replica_count = 3;

        let a = LonghornInstaller::new(LONGHORN_NAMESPACE, &two).steps(&client());
        let b = LonghornInstaller::new(LONGHORN_NAMESPACE, &three).steps(&client());
        let trigger = |steps: &[ExecutionStep]| {
            steps
                .iter()
                .find(|s| s.id == release_step_id())
                .map(|s| s.triggers.digest())
        };
        assert_ne!(trigger(&a), trigger(&b));
        assert_eq!(a[0].triggers.digest(), b[0].triggers.digest());
    }
}
