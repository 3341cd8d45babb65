//! Idempotency state
//!
//! Records the trigger fingerprint last applied for every step so a repeated
//! pass only re-runs steps whose triggers changed.

use super::transport::CommandOutput;
use crate::error::{HomelabError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Identity of a step in the state store: step name + target host
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepKey {
    pub name: String,
    pub target: String,
}

impl StepKey {
    pub fn new(name: &str, target: &str) -> Self {
        Self {
            name: name.to_string(),
            target: target.to_string(),
        }
    }
}

impl fmt::Display for StepKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.target)
    }
}

/// Last successful application of a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedRecord {
    /// SHA-256 digest of the trigger fingerprint
    pub fingerprint: String,
    pub exit_code: i32,
    pub stdout: String,
    pub applied_at: DateTime<Utc>,
}

impl AppliedRecord {
    pub fn new(fingerprint: String, output: &CommandOutput) -> Self {
        Self {
            fingerprint,
            exit_code: output.exit_code,
            stdout: output.stdout.clone(),
            applied_at: Utc::now(),
        }
    }

    /// Output replayed for an unchanged step
    pub fn output(&self) -> CommandOutput {
        CommandOutput {
            exit_code: self.exit_code,
            stdout: self.stdout.clone(),
            stderr: String::new(),
        }
    }
}

/// Step key -> last applied record. Implementations must tolerate concurrent
/// upserts from independent steps.
pub trait StateStore: Send + Sync {
    fn get(&self, key: &StepKey) -> Result<Option<AppliedRecord>>;

    fn upsert(&self, key: StepKey, record: AppliedRecord) -> Result<()>;

    /// Drop a record; returns whether one existed
    fn remove(&self, key: &StepKey) -> Result<bool>;

    fn keys(&self) -> Result<Vec<StepKey>>;

    /// Drop every record of a step name, on any target
    fn forget(&self, step_name: &str) -> Result<Vec<StepKey>> {
        let mut removed = Vec::new();
        for key in self.keys()? {
            if key.name == step_name && self.remove(&key)? {
                removed.push(key);
            }
        }
        Ok(removed)
    }
}

/// In-memory state store
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    records: RwLock<HashMap<StepKey, AppliedRecord>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn get(&self, key: &StepKey) -> Result<Option<AppliedRecord>> {
        let records = self
            .records
            .read()
            .map_err(|_| HomelabError::Lock("Failed to acquire read lock".to_string()))?;

        Ok(records.get(key).cloned())
    }

    fn upsert(&self, key: StepKey, record: AppliedRecord) -> Result<()> {
        let mut records = self
            .records
            .write()
            .map_err(|_| HomelabError::Lock("Failed to acquire write lock".to_string()))?;

        records.insert(key, record);
        Ok(())
    }

    fn remove(&self, key: &StepKey) -> Result<bool> {
        let mut records = self
            .records
            .write()
            .map_err(|_| HomelabError::Lock("Failed to acquire write lock".to_string()))?;

        Ok(records.remove(key).is_some())
    }

    fn keys(&self) -> Result<Vec<StepKey>> {
        let records = self
            .records
            .read()
            .map_err(|_| HomelabError::Lock("Failed to acquire read lock".to_string()))?;

        let mut keys: Vec<StepKey> = records.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

/// On-disk layout of the state file
#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    version: u32,
    steps: Vec<StoredStep>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredStep {
    #[serde(flatten)]
    key: StepKey,
    #[serde(flatten)]
    record: AppliedRecord,
}

const STATE_FILE_VERSION: u32 = 1;

/// JSON file state store
///
/// The whole map is rewritten on every change (temp file + rename) while the
/// write lock is held, so concurrent upserts serialize. Memory is updated only
/// after the file write succeeds.
#[derive(Debug)]
pub struct FileStateStore {
    path: PathBuf,
    records: RwLock<BTreeMap<StepKey, AppliedRecord>>,
}

impl FileStateStore {
    /// Open a state file, creating parent directories as needed
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let records = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let file: StateFile = serde_json::from_str(&content)?;
            if file.version != STATE_FILE_VERSION {
                return Err(HomelabError::Config(format!(
                    "Unsupported state file version {} in {}",
                    file.version,
                    path.display()
                )));
            }
            file.steps
                .into_iter()
                .map(|s| (s.key, s.record))
                .collect()
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path: path.to_path_buf(),
            records: RwLock::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, records: &BTreeMap<StepKey, AppliedRecord>) -> Result<()> {
        let file = StateFile {
            version: STATE_FILE_VERSION,
            steps: records
                .iter()
                .map(|(key, record)| StoredStep {
                    key: key.clone(),
                    record: record.clone(),
                })
                .collect(),
        };

        let tmp = self.path.with_extension("json.tmp");
        super::transport::write_private_file(&tmp, serde_json::to_string_pretty(&file)?.as_bytes())?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl StateStore for FileStateStore {
    fn get(&self, key: &StepKey) -> Result<Option<AppliedRecord>> {
        let records = self
            .records
            .read()
            .map_err(|_| HomelabError::Lock("Failed to acquire read lock".to_string()))?;

        Ok(records.get(key).cloned())
    }

    fn upsert(&self, key: StepKey, record: AppliedRecord) -> Result<()> {
        let mut records = self
            .records
            .write()
            .map_err(|_| HomelabError::Lock("Failed to acquire write lock".to_string()))?;

        let mut next = records.clone();
        next.insert(key, record);
        self.persist(&next)?;
        *records = next;
        Ok(())
    }

    fn remove(&self, key: &StepKey) -> Result<bool> {
        let mut records = self
            .records
            .write()
            .map_err(|_| HomelabError::Lock("Failed to acquire write lock".to_string()))?;

        if !records.contains_key(key) {
            return Ok(false);
        }

        let mut next = records.clone();
        next.remove(key);
        self.persist(&next)?;
        *records = next;
        Ok(true)
    }

    fn keys(&self) -> Result<Vec<StepKey>> {
        let records = self
            .records
            .read()
            .map_err(|_| HomelabError::Lock("Failed to acquire read lock".to_string()))?;

        Ok(records.keys().cloned().collect())
    }
}
