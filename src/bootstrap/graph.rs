//! k3s dependency graph
//!
//! Each step depends on exactly the facts that can invalidate it:
//!
//! - every node's prerequisites depend only on that node's VM
//! - the primary server depends on its own prerequisites
//! - each joining server or worker depends on its own prerequisites and the
//!   primary server, and on nothing else
//!
//! So one worker's join never waits on another worker.

use super::render::{render_node_script, render_prerequisites, server_url, NodeScriptInput};
use super::scheduler::StepGraph;
use super::step::{Dependency, ExecutionStep, StepId, StepKind, TriggerFingerprint};
use crate::config::{ClusterJoinToken, NodeRole, NodeSpec};
use crate::error::{HomelabError, Result};
use crate::labels::{LabelDeriver, ZoneTable};
use crate::provision::VmHandle;
use std::collections::{BTreeMap, HashMap};

/// Step id of a node's prerequisites
pub fn prereq_step_id(node: &str) -> StepId {
    StepId::new(format!("{}-prereqs", node))
}

/// Step id of a server's k3s install
pub fn server_step_id(node: &str) -> StepId {
    StepId::new(format!("{}-k3s-server", node))
}

/// Step id of a worker's k3s agent install
pub fn agent_step_id(node: &str) -> StepId {
    StepId::new(format!("{}-k3s-agent", node))
}

/// Validated bootstrap graph
#[derive(Debug)]
pub struct BootstrapPlan {
    pub graph: StepGraph,
    /// Primary server's step
    pub primary_step: StepId,
    pub primary_node: String,
    pub primary_address: String,
}

/// Builds the bootstrap step graph for a node set
pub struct DependencyGraphBuilder<'a> {
    deriver: LabelDeriver,
    token: &'a ClusterJoinToken,
    k3s_version: &'a str,
}

impl<'a> DependencyGraphBuilder<'a> {
    /// Create a new builder
    pub fn new<I, S>(
        cluster_name: &str,
        fast_storage: I,
        zones: BTreeMap<String, String>,
        token: &'a ClusterJoinToken,
        k3s_version: &'a str,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            deriver: LabelDeriver::new(cluster_name, fast_storage, ZoneTable::new(zones)),
            token,
            k3s_version,
        }
    }

    pub fn deriver(&self) -> &LabelDeriver {
        &self.deriver
    }

    /// Build the graph. Fails before anything runs when there is no server or
    /// a node has no VM handle.
    pub fn build(&self, nodes: &[NodeSpec], vms: &HashMap<String, VmHandle>) -> Result<BootstrapPlan> {
        let servers: Vec<&NodeSpec> = nodes.iter().filter(|n| n.role == NodeRole::Server).collect();
        let workers: Vec<&NodeSpec> = nodes.iter().filter(|n| n.role == NodeRole::Worker).collect();

        let primary = *servers.first().ok_or(HomelabError::NoServerNode)?;
        let primary_ip = primary.host().to_string();
        let join_url = server_url(&primary_ip);

        let mut steps = Vec::with_capacity(nodes.len() * 2);

        // 1) prereqs per node, anchored on that node's VM only
        for node in nodes {
            let vm = vms
                .get(&node.name)
                .ok_or_else(|| HomelabError::MissingVm(node.name.clone()))?;

            steps.push(ExecutionStep {
                id: prereq_step_id(&node.name),
                kind: StepKind::Prerequisites,
                node: node.name.clone(),
                target: node.host().to_string(),
                script: render_prerequisites(),
                triggers: TriggerFingerprint::new([node.name.as_str()]),
                depends_on: vec![Dependency::Vm {
                    node: vm.node.clone(),
                    vm_id: vm.vm_id,
                }],
            });
        }

        // 2) primary server
        let primary_step = server_step_id(&primary.name);
        steps.push(ExecutionStep {
            id: primary_step.clone(),
            kind: StepKind::PrimaryServer,
            node: primary.name.clone(),
            target: primary_ip.clone(),
            script: self.render(primary, true, None),
            triggers: TriggerFingerprint::new([primary.name.as_str(), self.k3s_version]),
            depends_on: vec![Dependency::Step(prereq_step_id(&primary.name))],
        });

        // 3) additional servers, 4) workers
        let joiners = servers[1..]
            .iter()
            .map(|n| (*n, StepKind::JoinServer, server_step_id(&n.name)))
            .chain(
                workers
                    .iter()
                    .map(|n| (*n, StepKind::JoinAgent, agent_step_id(&n.name))),
            );

        for (node, kind, id) in joiners {
            let host = node.host();
            steps.push(ExecutionStep {
                id,
                kind,
                node: node.name.clone(),
                target: host.to_string(),
                script: self.render(node, false, Some(&join_url)),
                triggers: TriggerFingerprint::new([node.name.as_str(), host, self.k3s_version]),
                depends_on: vec![
                    Dependency::Step(prereq_step_id(&node.name)),
                    Dependency::Step(primary_step.clone()),
                ],
            });
        }

        tracing::debug!(
            "Built bootstrap graph: {} steps, primary {} at {}",
            steps.len(),
            primary.name,
            primary_ip
        );

        Ok(BootstrapPlan {
            graph: StepGraph::new(steps)?,
            primary_step,
            primary_node: primary.name.clone(),
            primary_address: primary_ip,
        })
    }

    fn render(&self, node: &NodeSpec, is_primary: bool, join_url: Option<&str>) -> super::step::Script {
        let labels = self.deriver.derive(node);
        render_node_script(&NodeScriptInput {
            node,
            is_primary,
            server_url: join_url,
            token: self.token,
            labels: &labels,
            k3s_version: self.k3s_version,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::Secret;
    use crate::labels::constants::default_zone_map;
    use crate::labels::deriver::tests::node;

    pub(crate) fn vms_for(nodes: &[NodeSpec]) -> HashMap<String, VmHandle> {
        nodes
            .iter()
            .map(|n| (n.name.clone(), VmHandle::adopted(n)))
            .collect()
    }

    fn build(nodes: &[NodeSpec]) -> Result<BootstrapPlan> {
        let token = Secret::new("s3cr3t-token");
        let builder = DependencyGraphBuilder::new("lab", ["srv1"], default_zone_map(), &token, "v1.30.4+k3s1");
        builder.build(nodes, &vms_for(nodes))
    }

    fn three_nodes() -> Vec<NodeSpec> {
        vec![
            node("srv1", NodeRole::Server, "proxmox1", "10.0.0.11/24"),
            node("srv2", NodeRole::Server, "proxmox2", "10.0.0.12/24"),
            node("w1", NodeRole::Worker, "proxmox3", "10.0.0.21/24"),
        ]
    }

    #[test]
    fn test_first_server_is_primary() {
        let plan = build(&three_nodes()).unwrap();
        assert_eq!(plan.primary_node, "srv1");
        assert_eq!(plan.primary_address, "10.0.0.11");
        assert_eq!(plan.primary_step, server_step_id("srv1"));

        let primary = plan.graph.get(&plan.primary_step).unwrap();
        assert_eq!(primary.kind, StepKind::PrimaryServer);
        assert_eq!(primary.step_dependencies().collect::<Vec<_>>(), vec![&prereq_step_id("srv1")]);
    }

    #[test]
    fn test_joiners_depend_on_primary_and_own_prereqs_only() {
        let plan = build(&three_nodes()).unwrap();
        let srv2 = plan.graph.get(&server_step_id("srv2")).unwrap();
        let w1 = plan.graph.get(&agent_step_id("w1")).unwrap();

        assert_eq!(srv2.kind, StepKind::JoinServer);
        assert_eq!(w1.kind, StepKind::JoinAgent);
        for (step, name) in [(srv2, "srv2"), (w1, "w1")] {
            let deps: Vec<&StepId> = step.step_dependencies().collect();
            assert_eq!(deps, vec![&prereq_step_id(name), &server_step_id("srv1")]);
        }

        assert!(!srv2.depends_on_step(&agent_step_id("w1")));
        assert!(!w1.depends_on_step(&server_step_id("srv2")));
    }

    #[test]
    fn test_prereqs_depend_only_on_their_vm() {
        let plan = build(&three_nodes()).unwrap();
        for name in ["srv1", "srv2", "w1"] {
            let step = plan.graph.get(&prereq_step_id(name)).unwrap();
            assert_eq!(step.step_dependencies().count(), 0);
            assert!(matches!(
                step.depends_on.as_slice(),
                [Dependency::Vm { node, .. }] if node == name
            ));
            assert_eq!(step.triggers.values(), &[name.to_string()]);
        }
    }

    #[test]
    fn test_every_non_prereq_step_reaches_primary() {
        let plan = build(&three_nodes()).unwrap();
        for step in plan.graph.steps() {
            if step.kind == StepKind::Prerequisites || step.id == plan.primary_step {
                continue;
            }
            assert!(plan.graph.reaches(&step.id, &plan.primary_step), "{}", step.id);
        }
    }

    #[test]
    fn test_trigger_fingerprints() {
        let plan = build(&three_nodes()).unwrap();
        let primary = plan.graph.get(&server_step_id("srv1")).unwrap();
        assert_eq!(primary.triggers.values(), &["srv1", "v1.30.4+k3s1"]);

        let w1 = plan.graph.get(&agent_step_id("w1")).unwrap();
        assert_eq!(w1.triggers.values(), &["w1", "10.0.0.21", "v1.30.4+k3s1"]);

        for step in plan.graph.steps() {
            assert!(step.triggers.values().iter().all(|v| !v.contains("s3cr3t")));
        }
    }

    #[test]
    fn test_token_only_in_script_body() {
        let plan = build(&three_nodes()).unwrap();
        let w1 = plan.graph.get(&agent_step_id("w1")).unwrap();
        assert!(w1.script.body().contains("token: \"s3cr3t-token\""));
        assert!(!format!("{:?}", w1).contains("s3cr3t"));
    }

    #[test]
    fn test_no_server_is_config_error() {
        let nodes = vec![node("w1", NodeRole::Worker, "proxmox1", "10.0.0.21")];
        let err = build(&nodes).unwrap_err();
        assert!(matches!(err, HomelabError::NoServerNode));
        assert!(err.is_config_error());
    }

    #[test]
    fn test_missing_vm_is_config_error() {
        let nodes = three_nodes();
        let mut vms = vms_for(&nodes);
        vms.remove("w1");

        let token = Secret::new("tok");
        let builder = DependencyGraphBuilder::new("lab", ["srv1"], default_zone_map(), &token, "v1");
        let err = builder.build(&nodes, &vms).unwrap_err();
        assert!(matches!(err, HomelabError::MissingVm(ref n) if n == "w1"));
    }

    #[test]
    fn test_single_server_two_workers() {
        let nodes = vec![
            node("srv1", NodeRole::Server, "proxmox1", "10.0.0.11"),
            node("w1", NodeRole::Worker, "proxmox2", "10.0.0.21"),
            node("w2", NodeRole::Worker, "proxmox3", "10.0.0.22"),
        ];
        let plan = build(&nodes).unwrap();
        assert_eq!(plan.graph.len(), 6);

        let w1 = plan.graph.get(&agent_step_id("w1")).unwrap();
        assert!(!w1.depends_on_step(&agent_step_id("w2")));
        assert!(!w1.depends_on_step(&prereq_step_id("w2")));
    }
}
