//! Remote step executor
//!
//! Runs a step through a transport unless the state store already holds the
//! step's current trigger fingerprint.

use super::state::{AppliedRecord, StateStore, StepKey};
use super::transport::{CommandOutput, RemoteTransport};
use crate::bootstrap::step::ExecutionStep;
use crate::error::{HomelabError, Result};
use std::sync::Arc;
use std::time::Duration;

/// Longest stderr tail carried in a step failure
const STDERR_TAIL: usize = 2000;

/// How a step was satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// The script ran
    Applied,
    /// Fingerprint unchanged; last result replayed
    Unchanged,
}

/// Result of a successful execute()
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub status: ExecutionStatus,
    pub output: CommandOutput,
}

/// Executes steps with idempotency tracking
pub struct RemoteExecutor {
    transport: Arc<dyn RemoteTransport>,
    store: Arc<dyn StateStore>,
    timeout: Option<Duration>,
}

impl RemoteExecutor {
    /// Create a new executor
    pub fn new(transport: Arc<dyn RemoteTransport>, store: Arc<dyn StateStore>) -> Self {
        Self {
            transport,
            store,
            timeout: None,
        }
    }

    /// Bound every remote run
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Execute a step. A no-op returning the last result when the trigger
    /// fingerprint is unchanged.
    pub async fn execute(&self, step: &ExecutionStep) -> Result<StepOutcome> {
        let key = step.key();
        let fingerprint = step.triggers.digest();

        if let Some(record) = self.store.get(&key)? {
            if record.fingerprint == fingerprint {
                tracing::debug!("Step {} unchanged, skipping", key);
                return Ok(StepOutcome {
                    status: ExecutionStatus::Unchanged,
                    output: record.output(),
                });
            }
            tracing::info!("Triggers changed for step {}: {}", key, step.triggers);
        }

        tracing::info!(
            "Running step {} ({}) on {} [script {:?}]",
            step.id,
            step.kind,
            step.target,
            step.script
        );

        let run = self.transport.run(&step.target, &step.script);
        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, run).await.map_err(|_| {
                HomelabError::Timeout(format!(
                    "step {} on {} exceeded {}s",
                    step.id,
                    step.target,
                    limit.as_secs()
                ))
            })??,
            None => run.await?,
        };

        if !output.success() {
            return Err(HomelabError::RemoteExecution {
                step: step.id.to_string(),
                node: step.node.clone(),
                kind: step.kind.to_string(),
                exit_code: output.exit_code,
                stderr: stderr_tail(&output.stderr),
            });
        }

        self.store
            .upsert(key, AppliedRecord::new(fingerprint, &output))?;

        Ok(StepOutcome {
            status: ExecutionStatus::Applied,
            output,
        })
    }

    /// Forget every record of a step name, forcing it to re-run next pass
    pub fn forget(&self, step_name: &str) -> Result<Vec<StepKey>> {
        self.store.forget(step_name)
    }
}

fn stderr_tail(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.len() <= STDERR_TAIL {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - STDERR_TAIL;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &trimmed[start..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::step::{Script, StepId, StepKind, TriggerFingerprint};
    use crate::remote::state::MemoryStateStore;
    use crate::remote::testing::ScriptedTransport;

    fn step(name: &str, version: &str) -> ExecutionStep {
        ExecutionStep {
            id: StepId::new(name),
            kind: StepKind::JoinAgent,
            node: "w1".to_string(),
            target: "10.0.0.21".to_string(),
            script: Script::new(format!("install {}", version)),
            triggers: TriggerFingerprint::new(["w1", "10.0.0.21", version]),
            depends_on: Vec::new(),
        }
    }

    fn executor(transport: Arc<ScriptedTransport>) -> RemoteExecutor {
        RemoteExecutor::new(transport, Arc::new(MemoryStateStore::new()))
    }

    #[tokio::test]
    async fn test_unchanged_fingerprint_makes_no_remote_call() {
        let transport = Arc::new(ScriptedTransport::new());
        let executor = executor(transport.clone());

        let first = executor.execute(&step("w1-k3s-agent", "v1")).await.unwrap();
        assert_eq!(first.status, ExecutionStatus::Applied);

        let second = executor.execute(&step("w1-k3s-agent", "v1")).await.unwrap();
        assert_eq!(second.status, ExecutionStatus::Unchanged);
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn test_changed_fingerprint_reruns_once() {
        let transport = Arc::new(ScriptedTransport::new());
        let executor = executor(transport.clone());

        executor.execute(&step("w1-k3s-agent", "v1")).await.unwrap();
        let bumped = executor.execute(&step("w1-k3s-agent", "v2")).await.unwrap();
        assert_eq!(bumped.status, ExecutionStatus::Applied);
        executor.execute(&step("w1-k3s-agent", "v2")).await.unwrap();

        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_step_failure_and_not_recorded() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.fail_when("10.0.0.21", "install", 1);
        let executor = executor(transport.clone());

        let err = executor.execute(&step("w1-k3s-agent", "v1")).await.unwrap_err();
        assert!(matches!(
            err,
            HomelabError::RemoteExecution { ref node, exit_code: 1, .. } if node == "w1"
        ));

        // Not recorded, so the next pass tries again
        let _ = executor.execute(&step("w1-k3s-agent", "v1")).await;
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test]
    async fn test_step_applies_once_host_accepts_connections() {
        use crate::remote::transport::{ConnectRetry, RetryingTransport};

        let scripted = Arc::new(ScriptedTransport::new());
        scripted.refuse_first("10.0.0.21", 2);
        let retry = ConnectRetry {
            attempts: 5,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        };
        let executor = RemoteExecutor::new(
            Arc::new(RetryingTransport::new(scripted.clone(), retry)),
            Arc::new(MemoryStateStore::new()),
        );

        let outcome = executor.execute(&step("w1-prereqs", "v1")).await.unwrap();
        assert_eq!(outcome.status, ExecutionStatus::Applied);
        assert_eq!(scripted.call_count(), 3);
    }

    #[tokio::test]
    async fn test_forget_forces_rerun() {
        let transport = Arc::new(ScriptedTransport::new());
        let executor = executor(transport.clone());

        executor.execute(&step("w1-k3s-agent", "v1")).await.unwrap();
        let removed = executor.forget("w1-k3s-agent").unwrap();
        assert_eq!(removed.len(), 1);

        let again = executor.execute(&step("w1-k3s-agent", "v1")).await.unwrap();
        assert_eq!(again.status, ExecutionStatus::Applied);
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test]
    async fn test_timeout_is_execution_error() {
        let transport = Arc::new(ScriptedTransport::new().delay(Duration::from_millis(200)));
        let executor = executor(transport).timeout(Duration::from_millis(10));

        let err = executor.execute(&step("w1-k3s-agent", "v1")).await.unwrap_err();
        assert!(matches!(err, HomelabError::Timeout(_)));
        assert!(err.is_execution_error());
    }

    #[test]
    fn test_stderr_tail_is_bounded() {
        let long = "x".repeat(STDERR_TAIL * 2);
        assert_eq!(stderr_tail(&long).len(), STDERR_TAIL + 3);
        assert_eq!(stderr_tail("  short \n"), "short");
    }
}
