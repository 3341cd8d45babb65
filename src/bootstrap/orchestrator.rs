//! Bootstrap orchestration
//!
//! Builds the k3s step graph for the whole node set, runs it through the
//! scheduler, and hands out a [`ClusterHandle`] only once every step has
//! succeeded.

use super::graph::{BootstrapPlan, DependencyGraphBuilder};
use super::render::server_url;
use super::scheduler::{PassReport, Scheduler};
use super::step::StepId;
use crate::config::{Config, NodeSpec};
use crate::error::Result;
use crate::labels::NodeLabelSet;
use crate::provision::VmHandle;
use std::collections::HashMap;
use tracing::Instrument;
use uuid::Uuid;

/// Proof that the cluster is up; downstream work takes one of these
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterHandle {
    primary_node: String,
    primary_address: String,
}

impl ClusterHandle {
    pub fn primary_node(&self) -> &str {
        &self.primary_node
    }

    /// Reachable address of the primary server
    pub fn primary_address(&self) -> &str {
        &self.primary_address
    }

    /// `https://<primary-ip>:6443`
    pub fn api_server(&self) -> String {
        server_url(&self.primary_address)
    }
}

/// Outcome of one bootstrap pass
#[derive(Debug)]
pub struct BootstrapResult {
    pub run_id: Uuid,
    pub primary_node: String,
    pub primary_address: String,
    pub primary_step: StepId,
    pub report: PassReport,
}

impl BootstrapResult {
    pub fn api_server(&self) -> String {
        server_url(&self.primary_address)
    }

    /// True once the primary server step has succeeded
    pub fn primary_ready(&self) -> bool {
        self.report
            .get(&self.primary_step)
            .map(|r| r.is_success())
            .unwrap_or(false)
    }

    /// The completion handle. Errors unless every step succeeded.
    pub fn cluster_handle(&self) -> Result<ClusterHandle> {
        self.report.ensure_complete()?;
        Ok(ClusterHandle {
            primary_node: self.primary_node.clone(),
            primary_address: self.primary_address.clone(),
        })
    }
}

/// Drives the bootstrap of a configured node set
pub struct BootstrapOrchestrator<'a> {
    config: &'a Config,
    builder: DependencyGraphBuilder<'a>,
}

impl<'a> BootstrapOrchestrator<'a> {
    /// Create a new orchestrator
    pub fn new(config: &'a Config) -> Self {
        let builder = DependencyGraphBuilder::new(
            &config.stack,
            config.longhorn.ssd_node_names.iter().cloned(),
            config.zone_map.clone(),
            &config.k3s_token,
            &config.k3s_version,
        );
        Self { config, builder }
    }

    /// Derived labels of every node, in declaration order
    pub fn labels(&self) -> Vec<(&'a NodeSpec, NodeLabelSet)> {
        self.config
            .nodes
            .iter()
            .map(|n| (n, self.builder.deriver().derive(n)))
            .collect()
    }

    /// Build and validate the step graph. Nothing remote happens here.
    pub fn plan(&self, vms: &HashMap<String, VmHandle>) -> Result<BootstrapPlan> {
        self.builder.build(&self.config.nodes, vms)
    }

    /// Run one convergent pass over the plan
    pub async fn run(&self, plan: &BootstrapPlan, scheduler: &Scheduler) -> BootstrapResult {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("bootstrap", run_id = %run_id, stack = %self.config.stack);

        let report = async {
            tracing::info!(
                "Bootstrapping {} nodes ({} steps), primary {}",
                self.config.nodes.len(),
                plan.graph.len(),
                plan.primary_node
            );

            let report = scheduler.run(&plan.graph).await;

            if report.is_complete() {
                tracing::info!("Cluster ready at {}", server_url(&plan.primary_address));
            } else {
                tracing::error!(
                    "Bootstrap incomplete: {} failed, {} skipped",
                    report.failed().len(),
                    report.skipped().len()
                );
            }
            report
        }
        .instrument(span)
        .await;

        BootstrapResult {
            run_id,
            primary_node: plan.primary_node.clone(),
            primary_address: plan.primary_address.clone(),
            primary_step: plan.primary_step.clone(),
            report,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::graph::tests::vms_for;
    use crate::config::loader::tests::SAMPLE;
    use crate::config::ConfigLoader;
    use crate::error::HomelabError;
    use crate::labels::constants::{LABEL_NODEPOOL, LABEL_STORAGE, LABEL_ZONE};
    use crate::remote::testing::ScriptedTransport;
    use crate::remote::{MemoryStateStore, RemoteExecutor};
    use std::sync::Arc;

    fn scheduler(transport: Arc<ScriptedTransport>) -> Scheduler {
        let executor = RemoteExecutor::new(transport, Arc::new(MemoryStateStore::new()));
        Scheduler::new(Arc::new(executor), None)
    }

    #[test]
    fn test_labels_for_sample_stack() {
        let config = ConfigLoader::parse_str(SAMPLE).unwrap();
        let orchestrator = BootstrapOrchestrator::new(&config);
        let labels = orchestrator.labels();

        let (srv1, srv1_labels) = &labels[0];
        assert_eq!(srv1.name, "srv1");
        assert_eq!(srv1_labels.get(LABEL_STORAGE), Some("ssd"));
        assert_eq!(srv1_labels.get(LABEL_NODEPOOL), Some("core"));

        let (_, w1_labels) = &labels[1];
        assert_eq!(w1_labels.get(LABEL_STORAGE), Some("hdd"));
        assert_eq!(w1_labels.get(LABEL_NODEPOOL), Some("bulk"));
        assert_eq!(w1_labels.get(LABEL_ZONE), Some("zone-b"));
    }

    #[tokio::test]
    async fn test_successful_run_yields_cluster_handle() {
        let config = ConfigLoader::parse_str(SAMPLE).unwrap();
        let orchestrator = BootstrapOrchestrator::new(&config);
        let plan = orchestrator.plan(&vms_for(&config.nodes)).unwrap();

        let result = orchestrator
            .run(&plan, &scheduler(Arc::new(ScriptedTransport::new())))
            .await;

        assert!(result.primary_ready());
        let handle = result.cluster_handle().unwrap();
        assert_eq!(handle.primary_node(), "srv1");
        assert_eq!(handle.api_server(), "https://10.0.0.11:6443");
        assert_eq!(result.api_server(), config.kube_api_server());
    }

    #[tokio::test]
    async fn test_partial_failure_withholds_cluster_handle() {
        let config = ConfigLoader::parse_str(SAMPLE).unwrap();
        let orchestrator = BootstrapOrchestrator::new(&config);
        let plan = orchestrator.plan(&vms_for(&config.nodes)).unwrap();

        let transport = Arc::new(ScriptedTransport::new());
        transport.fail_when("10.0.0.21", "sh -s - agent", 1);
        let result = orchestrator.run(&plan, &scheduler(transport)).await;

        // The primary is up even though a worker failed
        assert!(result.primary_ready());
        let err = result.cluster_handle().unwrap_err();
        assert!(matches!(err, HomelabError::BootstrapIncomplete { ref failed, .. } if failed == &["w1-k3s-agent"]));
    }

    #[tokio::test]
    async fn test_version_bump_reruns_only_k3s_steps() {
        let yaml = format!(
            "{}  - name: srv2\n    role: server\n    proxmoxNode: proxmox1\n    vmId: 102\n    ip4: 10.0.0.12/24\n    gw4: 10.0.0.1\n    cores: 2\n    memoryMb: 4096\n    diskGb: 32\n    datastoreId: local-lvm\n    initDatastoreId: local-lvm\n    bridge: vmbr0\n",
            SAMPLE
        );
        let first = ConfigLoader::parse_str(&yaml).unwrap();
        let bumped = ConfigLoader::parse_str(&yaml.replace("v1.30.4+k3s1", "v1.31.0+k3s1")).unwrap();

        let transport = Arc::new(ScriptedTransport::new());
        let executor = Arc::new(RemoteExecutor::new(
            transport.clone(),
            Arc::new(MemoryStateStore::new()),
        ));
        let scheduler = Scheduler::new(executor, None);

        let orchestrator = BootstrapOrchestrator::new(&first);
        let plan = orchestrator.plan(&vms_for(&first.nodes)).unwrap();
        let initial = orchestrator.run(&plan, &scheduler).await;
        assert_eq!(initial.report.applied().len(), 6);
        let calls_before = transport.call_count();

        let orchestrator = BootstrapOrchestrator::new(&bumped);
        let plan = orchestrator.plan(&vms_for(&bumped.nodes)).unwrap();
        let result = orchestrator.run(&plan, &scheduler).await;
        assert!(result.report.is_complete());

        let mut applied: Vec<&str> = result.report.applied().into_iter().map(|id| id.as_str()).collect();
        applied.sort_unstable();
        assert_eq!(applied, vec!["srv1-k3s-server", "srv2-k3s-server", "w1-k3s-agent"]);

        let rerun = &transport.calls()[calls_before..];
        assert_eq!(rerun.len(), 3);
        assert!(rerun
            .iter()
            .all(|call| call.script.contains("INSTALL_K3S_VERSION=\"v1.31.0+k3s1\"")));
    }

    #[test]
    fn test_plan_requires_every_vm() {
        let config = ConfigLoader::parse_str(SAMPLE).unwrap();
        let orchestrator = BootstrapOrchestrator::new(&config);
        let err = orchestrator.plan(&HashMap::new()).unwrap_err();
        assert!(err.is_config_error());
    }
}
