//! k3s cluster bootstrap
//!
//! This module renders per-node install scripts, wires them into a minimal
//! dependency graph, and schedules the graph across hosts.

pub mod graph;
pub mod orchestrator;
pub mod render;
pub mod scheduler;
pub mod step;

pub use graph::{agent_step_id, prereq_step_id, server_step_id, BootstrapPlan, DependencyGraphBuilder};
pub use orchestrator::{BootstrapOrchestrator, BootstrapResult, ClusterHandle};
pub use scheduler::{PassReport, Scheduler, StepGraph, StepResult};
pub use step::{Dependency, ExecutionStep, Script, StepId, StepKind, TriggerFingerprint};
