//! In-memory transport for tests

use super::transport::{CommandOutput, RemoteTransport};
use crate::bootstrap::step::Script;
use crate::error::{HomelabError, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// A recorded remote call
#[derive(Debug, Clone)]
pub struct Call {
    pub host: String,
    pub script: String,
}

enum Rule {
    Fail { host: String, needle: String, exit_code: i32 },
    Unreachable { host: String },
    RefuseFirst { host: String, remaining: usize },
    Respond { needle: String, stdout: String },
}

/// Transport that records calls and answers from scripted rules
pub struct ScriptedTransport {
    calls: Mutex<Vec<Call>>,
    rules: Mutex<Vec<Rule>>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            rules: Mutex::new(Vec::new()),
            delay: None,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Sleep this long inside every call
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Exit non-zero when a script containing `needle` runs on `host`
    pub fn fail_when(&self, host: &str, needle: &str, exit_code: i32) {
        self.rules.lock().unwrap().push(Rule::Fail {
            host: host.to_string(),
            needle: needle.to_string(),
            exit_code,
        });
    }

    /// Refuse every connection to `host`
    pub fn unreachable(&self, host: &str) {
        self.rules.lock().unwrap().push(Rule::Unreachable {
            host: host.to_string(),
        });
    }

    /// Refuse the next `count` connections to `host`, then accept
    pub fn refuse_first(&self, host: &str, count: usize) {
        self.rules.lock().unwrap().push(Rule::RefuseFirst {
            host: host.to_string(),
            remaining: count,
        });
    }

    /// Answer scripts containing `needle` with `stdout`
    pub fn respond(&self, needle: &str, stdout: &str) {
        self.rules.lock().unwrap().push(Rule::Respond {
            needle: needle.to_string(),
            stdout: stdout.to_string(),
        });
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Calls made to `host`
    pub fn calls_to(&self, host: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.host == host)
            .collect()
    }

    /// Highest number of calls observed running at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn answer(&self, host: &str, script: &str) -> Result<CommandOutput> {
        let mut rules = self.rules.lock().unwrap();
        let mut output = CommandOutput::default();

        for rule in rules.iter_mut() {
            match rule {
                Rule::RefuseFirst { host: h, remaining } if h == host && *remaining > 0 => {
                    *remaining -= 1;
                    return Err(HomelabError::Transport {
                        host: host.to_string(),
                        message: "Connection refused".to_string(),
                    });
                }
                Rule::Unreachable { host: h } if h == host => {
                    return Err(HomelabError::Transport {
                        host: host.to_string(),
                        message: "Connection refused".to_string(),
                    });
                }
                Rule::Fail {
                    host: h,
                    needle,
                    exit_code,
                } if h == host && script.contains(needle.as_str()) => {
                    output.exit_code = *exit_code;
                    output.stderr = format!("scripted failure on {}", host);
                }
                Rule::Respond { needle, stdout } if script.contains(needle.as_str()) => {
                    output.stdout = stdout.clone();
                }
                _ => {}
            }
        }

        Ok(output)
    }
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteTransport for ScriptedTransport {
    async fn run(&self, host: &str, script: &Script) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(Call {
            host: host.to_string(),
            script: script.body().to_string(),
        });

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.answer(host, script.body())
    }
}
