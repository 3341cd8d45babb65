//! Shell transports
//!
//! A transport runs a rendered script on a host and captures its output.
//! [`SshTransport`] drives the system `ssh` client; [`LocalTransport`] runs
//! scripts on the machine running homelab (kubectl and helm steps).

use crate::bootstrap::step::Script;
use crate::config::{SshAccess, SshPrivateKey};
use crate::error::{HomelabError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Exit code ssh uses for its own (connection/auth) failures
const SSH_CONNECTION_FAILURE: i32 = 255;

/// File name of a materialized inline private key
pub const INLINE_KEY_FILE: &str = "id_homelab";

/// Captured result of a script run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs scripts on a target host
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Run a script on `host`. A non-zero exit is returned as output, not as
    /// an error; errors are reserved for failures to reach the host.
    async fn run(&self, host: &str, script: &Script) -> Result<CommandOutput>;
}

/// SSH transport using the system `ssh` client
#[derive(Debug, Clone)]
pub struct SshTransport {
    user: String,
    port: u16,
    key_path: PathBuf,
    connect_timeout_secs: u64,
}

impl SshTransport {
    /// Create a transport for the given credentials. An inline private key is
    /// written to `state_dir` with owner-only permissions.
    pub fn new(access: &SshAccess, state_dir: &Path) -> Result<Self> {
        let key_path = match &access.private_key {
            SshPrivateKey::Path(path) => path.clone(),
            SshPrivateKey::Inline(secret) => {
                std::fs::create_dir_all(state_dir)?;
                let path = state_dir.join(INLINE_KEY_FILE);
                let mut body = secret.reveal().to_string();
                if !body.ends_with('\n') {
                    body.push('\n');
                }
                write_private_file(&path, body.as_bytes())?;
                path
            }
        };

        Ok(Self {
            user: access.user.clone(),
            port: access.port,
            key_path,
            connect_timeout_secs: 15,
        })
    }

    /// Set the connect timeout
    pub fn connect_timeout(mut self, secs: u64) -> Self {
        self.connect_timeout_secs = secs;
        self
    }

    /// Arguments passed to `ssh` for a host
    pub fn ssh_args(&self, host: &str) -> Vec<String> {
        vec![
            "-i".to_string(),
            self.key_path.to_string_lossy().to_string(),
            "-p".to_string(),
            self.port.to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
            format!("{}@{}", self.user, host),
            "bash".to_string(),
            "-s".to_string(),
        ]
    }
}

#[async_trait]
impl RemoteTransport for SshTransport {
    async fn run(&self, host: &str, script: &Script) -> Result<CommandOutput> {
        tracing::debug!("Opening ssh session to {}@{}:{}", self.user, host, self.port);

        let mut command = Command::new("ssh");
        command.args(self.ssh_args(host));

        let output = run_with_stdin(command, script, host).await?;

        if output.exit_code == SSH_CONNECTION_FAILURE {
            return Err(HomelabError::Transport {
                host: host.to_string(),
                message: output.stderr.trim().to_string(),
            });
        }

        Ok(output)
    }
}

/// How often and how patiently to retry a host that cannot be reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectRetry {
    /// Total attempts, including the first
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl ConnectRetry {
    /// Wait before attempt `attempt + 1`, doubling from the initial backoff
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .map_or(self.max_backoff, |d| d.min(self.max_backoff))
    }
}

impl Default for ConnectRetry {
    fn default() -> Self {
        Self {
            attempts: 20,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(15),
        }
    }
}

/// Retries connection failures of an inner transport.
///
/// Freshly started VMs refuse connections until cloud-init has brought up
/// sshd. Only [`HomelabError::Transport`] is retried; a script that ran and
/// exited non-zero is returned as is.
pub struct RetryingTransport {
    inner: Arc<dyn RemoteTransport>,
    policy: ConnectRetry,
}

impl RetryingTransport {
    pub fn new(inner: Arc<dyn RemoteTransport>, policy: ConnectRetry) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl RemoteTransport for RetryingTransport {
    async fn run(&self, host: &str, script: &Script) -> Result<CommandOutput> {
        let mut attempt = 1;
        loop {
            match self.inner.run(host, script).await {
                Err(HomelabError::Transport { message, .. }) if attempt < self.policy.attempts => {
                    let wait = self.policy.backoff(attempt);
                    tracing::warn!(
                        "Cannot reach {} (attempt {}/{}): {}; retrying in {}s",
                        host,
                        attempt,
                        self.policy.attempts,
                        message,
                        wait.as_secs_f32()
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

/// Runs scripts with the local `bash`
#[derive(Debug, Clone, Default)]
pub struct LocalTransport {
    env: Vec<(String, String)>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an environment variable for every script
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }
}

#[async_trait]
impl RemoteTransport for LocalTransport {
    async fn run(&self, host: &str, script: &Script) -> Result<CommandOutput> {
        let mut command = Command::new("bash");
        command.arg("-s");
        for (key, value) in &self.env {
            command.env(key, value);
        }

        run_with_stdin(command, script, host).await
    }
}

/// Spawn a command, feed the script on stdin and collect its output
async fn run_with_stdin(mut command: Command, script: &Script, host: &str) -> Result<CommandOutput> {
    let transport_err = |message: String| HomelabError::Transport {
        host: host.to_string(),
        message,
    };

    let mut child = command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| transport_err(format!("failed to spawn shell: {}", e)))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(script.body().as_bytes())
            .await
            .map_err(|e| transport_err(format!("failed to send script: {}", e)))?;
        stdin
            .write_all(b"\n")
            .await
            .map_err(|e| transport_err(format!("failed to send script: {}", e)))?;
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| transport_err(format!("session failed: {}", e)))?;

    Ok(CommandOutput {
        // Killed by a signal
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

/// Write a file readable only by its owner
pub(crate) fn write_private_file(path: &Path, contents: &[u8]) -> Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(contents)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Secret;
    use crate::remote::testing::ScriptedTransport;

    fn inline_access() -> SshAccess {
        SshAccess {
            user: "ubuntu".to_string(),
            private_key: SshPrivateKey::Inline(Secret::new("-----BEGIN KEY-----")),
            port: 2222,
            connect_attempts: 3,
        }
    }

    #[test]
    fn test_inline_key_is_materialized_privately() {
        let dir = tempfile::tempdir().unwrap();
        let transport = SshTransport::new(&inline_access(), dir.path()).unwrap();

        let key_path = dir.path().join(INLINE_KEY_FILE);
        let body = std::fs::read_to_string(&key_path).unwrap();
        assert_eq!(body, "-----BEGIN KEY-----\n");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&key_path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let args = transport.ssh_args("10.0.0.11");
        assert!(args.contains(&"ubuntu@10.0.0.11".to_string()));
        assert!(args.contains(&"2222".to_string()));
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("-s"));
    }

    fn quick_retry(attempts: u32) -> ConnectRetry {
        ConnectRetry {
            attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let policy = ConnectRetry::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
        assert_eq!(policy.backoff(3), Duration::from_secs(8));
        assert_eq!(policy.backoff(4), Duration::from_secs(15));
        assert_eq!(policy.backoff(40), Duration::from_secs(15));
    }

    #[tokio::test]
    async fn test_retry_until_host_accepts() {
        let inner = Arc::new(ScriptedTransport::new());
        inner.refuse_first("10.0.0.11", 3);
        let transport = RetryingTransport::new(inner.clone(), quick_retry(5));

        let output = transport
            .run("10.0.0.11", &Script::new("true".to_string()))
            .await
            .unwrap();
        assert!(output.success());
        assert_eq!(inner.calls_to("10.0.0.11").len(), 4);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_attempts() {
        let inner = Arc::new(ScriptedTransport::new());
        inner.unreachable("10.0.0.11");
        let transport = RetryingTransport::new(inner.clone(), quick_retry(3));

        let err = transport
            .run("10.0.0.11", &Script::new("true".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, HomelabError::Transport { .. }));
        assert_eq!(inner.call_count(), 3);
    }

    #[tokio::test]
    async fn test_script_failure_is_not_retried() {
        let inner = Arc::new(ScriptedTransport::new());
        inner.fail_when("10.0.0.11", "install", 1);
        let transport = RetryingTransport::new(inner.clone(), quick_retry(5));

        let output = transport
            .run("10.0.0.11", &Script::new("install".to_string()))
            .await
            .unwrap();
        assert_eq!(output.exit_code, 1);
        assert_eq!(inner.call_count(), 1);
    }

    #[tokio::test]
    async fn test_local_transport_captures_output() {
        let transport = LocalTransport::new().env("HOMELAB_TEST_VALUE", "42");
        let script = Script::new("echo out-$HOMELAB_TEST_VALUE\necho err >&2\nexit 3".to_string());

        let output = transport.run("localhost", &script).await.unwrap();
        assert_eq!(output.exit_code, 3);
        assert_eq!(output.stdout.trim(), "out-42");
        assert_eq!(output.stderr.trim(), "err");
        assert!(!output.success());
    }
}
