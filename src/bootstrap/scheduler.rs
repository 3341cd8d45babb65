//! Dependency-ordered step scheduling
//!
//! A step starts as soon as every step it depends on has succeeded. Steps with
//! no path between them run concurrently, optionally capped by a parallelism
//! limit. A failed step blocks everything downstream of it and nothing else.

use super::step::{ExecutionStep, StepId};
use crate::error::{HomelabError, Result};
use crate::remote::{CommandOutput, ExecutionStatus, RemoteExecutor, StepOutcome};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Validated, acyclic set of steps
#[derive(Debug)]
pub struct StepGraph {
    steps: Vec<ExecutionStep>,
    index: HashMap<StepId, usize>,
    dependents: HashMap<StepId, Vec<StepId>>,
    order: Vec<StepId>,
}

impl StepGraph {
    /// Validate a step list: unique ids, known dependencies, no cycles
    pub fn new(steps: Vec<ExecutionStep>) -> Result<Self> {
        let mut index = HashMap::with_capacity(steps.len());
        for (i, step) in steps.iter().enumerate() {
            if index.insert(step.id.clone(), i).is_some() {
                return Err(HomelabError::Config(format!("Duplicate step id: {}", step.id)));
            }
        }

        let mut dependents: HashMap<StepId, Vec<StepId>> = HashMap::new();
        for step in &steps {
            for dep in step.step_dependencies() {
                if !index.contains_key(dep) {
                    return Err(HomelabError::UnknownDependency {
                        step: step.id.to_string(),
                        dependency: dep.to_string(),
                    });
                }
                dependents.entry(dep.clone()).or_default().push(step.id.clone());
            }
        }

        let mut graph = Self {
            steps,
            index,
            dependents,
            order: Vec::new(),
        };
        graph.order = graph.resolve_order()?;
        Ok(graph)
    }

    fn resolve_order(&self) -> Result<Vec<StepId>> {
        let mut order = Vec::with_capacity(self.steps.len());
        let mut visited = HashSet::new();
        let mut visiting = HashSet::new();

        for step in &self.steps {
            self.topological_sort(&step.id, &mut visited, &mut visiting, &mut order)?;
        }

        Ok(order)
    }

    /// Depth-first topological sort, dependencies first
    fn topological_sort(
        &self,
        id: &StepId,
        visited: &mut HashSet<StepId>,
        visiting: &mut HashSet<StepId>,
        order: &mut Vec<StepId>,
    ) -> Result<()> {
        if visited.contains(id) {
            return Ok(());
        }

        if visiting.contains(id) {
            return Err(HomelabError::DependencyCycle(id.to_string()));
        }

        visiting.insert(id.clone());

        if let Some(step) = self.get(id) {
            for dep in step.step_dependencies() {
                self.topological_sort(dep, visited, visiting, order)?;
            }
        }

        visiting.remove(id);
        visited.insert(id.clone());
        order.push(id.clone());

        Ok(())
    }

    pub fn get(&self, id: &StepId) -> Option<&ExecutionStep> {
        self.index.get(id).map(|&i| &self.steps[i])
    }

    pub fn steps(&self) -> impl Iterator<Item = &ExecutionStep> {
        self.steps.iter()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Step ids with every dependency before its dependents
    pub fn topological_order(&self) -> &[StepId] {
        &self.order
    }

    /// Steps that directly depend on `id`
    pub fn dependents(&self, id: &StepId) -> &[StepId] {
        self.dependents.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every step downstream of `id`
    pub fn transitive_dependents(&self, id: &StepId) -> Vec<StepId> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<&StepId> = self.dependents(id).iter().collect();
        let mut out = Vec::new();

        while let Some(next) = queue.pop_front() {
            if seen.insert(next.clone()) {
                out.push(next.clone());
                queue.extend(self.dependents(next));
            }
        }

        out
    }

    /// Check whether `from` transitively depends on `to`
    pub fn reaches(&self, from: &StepId, to: &StepId) -> bool {
        self.transitive_dependents(to).contains(from)
    }
}

/// Final state of one step after a pass
#[derive(Debug, Clone)]
pub enum StepResult {
    Applied(CommandOutput),
    Unchanged(CommandOutput),
    Failed(String),
    /// Not attempted; `blocked_by` is the failed upstream step, if known
    Skipped { blocked_by: Option<StepId> },
}

impl StepResult {
    pub fn is_success(&self) -> bool {
        matches!(self, StepResult::Applied(_) | StepResult::Unchanged(_))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepResult::Applied(_) => "applied",
            StepResult::Unchanged(_) => "unchanged",
            StepResult::Failed(_) => "failed",
            StepResult::Skipped { .. } => "skipped",
        }
    }
}

impl From<StepOutcome> for StepResult {
    fn from(outcome: StepOutcome) -> Self {
        match outcome.status {
            ExecutionStatus::Applied => StepResult::Applied(outcome.output),
            ExecutionStatus::Unchanged => StepResult::Unchanged(outcome.output),
        }
    }
}

/// Per-step results of one scheduling pass
#[derive(Debug, Clone, Default)]
pub struct PassReport {
    order: Vec<StepId>,
    results: HashMap<StepId, StepResult>,
}

impl PassReport {
    pub fn get(&self, id: &StepId) -> Option<&StepResult> {
        self.results.get(id)
    }

    /// Results in dependency order
    pub fn iter(&self) -> impl Iterator<Item = (&StepId, &StepResult)> {
        self.order
            .iter()
            .filter_map(|id| self.results.get(id).map(|r| (id, r)))
    }

    /// True iff every step succeeded
    pub fn is_complete(&self) -> bool {
        self.results.values().all(StepResult::is_success)
    }

    pub fn failed(&self) -> Vec<&StepId> {
        self.iter()
            .filter(|(_, r)| matches!(r, StepResult::Failed(_)))
            .map(|(id, _)| id)
            .collect()
    }

    pub fn skipped(&self) -> Vec<&StepId> {
        self.iter()
            .filter(|(_, r)| matches!(r, StepResult::Skipped { .. }))
            .map(|(id, _)| id)
            .collect()
    }

    pub fn applied(&self) -> Vec<&StepId> {
        self.iter()
            .filter(|(_, r)| matches!(r, StepResult::Applied(_)))
            .map(|(id, _)| id)
            .collect()
    }

    /// Output of a successful step
    pub fn output(&self, id: &StepId) -> Option<&CommandOutput> {
        match self.results.get(id)? {
            StepResult::Applied(out) | StepResult::Unchanged(out) => Some(out),
            _ => None,
        }
    }

    /// Turn an incomplete pass into an error naming what went wrong
    pub fn ensure_complete(&self) -> Result<()> {
        if self.is_complete() {
            return Ok(());
        }
        Err(HomelabError::BootstrapIncomplete {
            failed: self.failed().iter().map(|id| id.to_string()).collect(),
            skipped: self.skipped().iter().map(|id| id.to_string()).collect(),
        })
    }

    /// Append another pass's results after this one's
    pub fn extend(&mut self, other: PassReport) {
        self.order.extend(other.order);
        self.results.extend(other.results);
    }
}

type StepTask = (StepId, Result<StepOutcome>);

/// Runs a [`StepGraph`] through a [`RemoteExecutor`]
pub struct Scheduler {
    executor: Arc<RemoteExecutor>,
    semaphore: Option<Arc<Semaphore>>,
}

impl Scheduler {
    /// Create a new scheduler. `None` leaves concurrency unbounded.
    pub fn new(executor: Arc<RemoteExecutor>, parallelism: Option<usize>) -> Self {
        Self {
            executor,
            semaphore: parallelism
                .filter(|n| *n > 0)
                .map(|n| Arc::new(Semaphore::new(n))),
        }
    }

    pub fn executor(&self) -> &Arc<RemoteExecutor> {
        &self.executor
    }

    /// Run every step whose dependencies succeed. Never fails as a whole;
    /// per-step failures land in the report.
    pub async fn run(&self, graph: &StepGraph) -> PassReport {
        let mut pending: HashMap<&StepId, usize> = graph
            .steps()
            .map(|s| (&s.id, s.step_dependencies().count()))
            .collect();
        let mut results: HashMap<StepId, StepResult> = HashMap::new();
        let mut tasks: JoinSet<StepTask> = JoinSet::new();

        for id in graph.topological_order() {
            if pending.get(id) == Some(&0) {
                self.spawn(&mut tasks, graph, id);
            }
        }

        while let Some(joined) = tasks.join_next().await {
            let (id, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    tracing::error!("Step task aborted: {}", e);
                    continue;
                }
            };

            match result {
                Ok(outcome) => {
                    tracing::info!("Step {} {:?}", id, outcome.status);
                    results.insert(id.clone(), outcome.into());

                    for dependent in graph.dependents(&id) {
                        if let Some(count) = pending.get_mut(dependent) {
                            *count = count.saturating_sub(1);
                            if *count == 0 && !results.contains_key(dependent) {
                                self.spawn(&mut tasks, graph, dependent);
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::error!("Step {} failed: {}", id, e);
                    for blocked in graph.transitive_dependents(&id) {
                        results.entry(blocked).or_insert_with_key(|blocked| {
                            tracing::warn!("Skipping step {}: blocked by {}", blocked, id);
                            StepResult::Skipped {
                                blocked_by: Some(id.clone()),
                            }
                        });
                    }
                    results.insert(id, StepResult::Failed(e.to_string()));
                }
            }
        }

        // Steps lost to an aborted task were never recorded
        for step in graph.steps() {
            results
                .entry(step.id.clone())
                .or_insert(StepResult::Skipped { blocked_by: None });
        }

        PassReport {
            order: graph.topological_order().to_vec(),
            results,
        }
    }

    fn spawn(&self, tasks: &mut JoinSet<StepTask>, graph: &StepGraph, id: &StepId) {
        let Some(step) = graph.get(id) else {
            return;
        };
        let step = step.clone();
        let executor = self.executor.clone();
        let semaphore = self.semaphore.clone();

        tasks.spawn(async move {
            let _permit = match semaphore {
                Some(semaphore) => match semaphore.acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => {
                        let err = HomelabError::Internal("step semaphore closed".to_string());
                        return (step.id, Err(err));
                    }
                },
                None => None,
            };

            let result = executor.execute(&step).await;
            (step.id, result)
        });
    }
}
