//! State management for converged stacks
//!
//! Manages the `.stackflow/state.json` file which records the terminal phase
//! and the non-secret outputs of every resource after each pass.

use crate::error::{CloudError, Result};
use crate::outputs::StackOutput;
use crate::report::{ApplyReport, Operation, Phase};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;

const STATE_VERSION: u32 = 1;
const STATE_DIR: &str = ".stackflow";
const STATE_FILE: &str = "state.json";
const STATE_BACKUP: &str = "state.json.backup";
const LOCK_FILE: &str = "lock.json";
const LOCK_STALE_HOURS: i64 = 1;

/// Persisted state of one stack
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackState {
    /// State file version
    pub version: u32,

    pub stack: String,

    /// Last modified timestamp
    pub updated_at: DateTime<Utc>,

    /// Resources indexed by resource id
    pub resources: BTreeMap<String, ResourceRecord>,

    /// Non-sensitive stack outputs of the last apply
    pub outputs: BTreeMap<String, Value>,
}

impl StackState {
    pub fn new(stack: impl Into<String>) -> Self {
        Self {
            version: STATE_VERSION,
            stack: stack.into(),
            updated_at: Utc::now(),
            resources: BTreeMap::new(),
            outputs: BTreeMap::new(),
        }
    }

    /// Fold a finished pass into the state.
    ///
    /// Resources that failed or were blocked keep their previous record with
    /// the new phase; deleted or absent resources are dropped.
    pub fn record(&mut self, report: &ApplyReport) {
        let now = Utc::now();
        for outcome in &report.outcomes {
            let phase = outcome.phase();
            let gone = report.operation == Operation::Destroy
                && outcome
                    .history
                    .iter()
                    .any(|p| matches!(p, Phase::Deleted | Phase::Absent));
            if gone {
                self.resources.remove(&outcome.id);
                continue;
            }

            let record = self
                .resources
                .entry(outcome.id.clone())
                .or_insert_with(|| ResourceRecord {
                    resource_type: outcome.resource_type.to_string(),
                    phase,
                    outputs: BTreeMap::new(),
                    updated_at: now,
                });
            record.phase = phase;
            record.updated_at = now;
            if let Some(outputs) = &outcome.outputs {
                record.outputs = persistable(outputs);
            }
        }
        if report.operation == Operation::Destroy && report.is_success() {
            self.outputs.clear();
        }
        self.updated_at = now;
    }

    /// Remember the non-sensitive outputs
    pub fn set_outputs(&mut self, outputs: &[StackOutput]) {
        self.outputs = outputs
            .iter()
            .filter(|o| !o.sensitive)
            .filter_map(|o| Some((o.name.clone(), o.value.clone()?)))
            .collect();
        self.updated_at = Utc::now();
    }

    pub fn get_resource(&self, id: &str) -> Option<&ResourceRecord> {
        self.resources.get(id)
    }
}

/// Outputs safe to write to disk: scalars only, so declared secrets nested in
/// settings blocks and manifests stay out of the file
fn persistable(outputs: &BTreeMap<String, Value>) -> BTreeMap<String, Value> {
    outputs
        .iter()
        .filter(|(_, v)| !v.is_object() && !v.is_array())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Last known state of a single resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub resource_type: String,

    /// Terminal phase of the last pass
    pub phase: Phase,

    pub outputs: BTreeMap<String, Value>,

    pub updated_at: DateTime<Utc>,
}

/// State manager for reading/writing state files
pub struct StateManager {
    /// Project root directory
    project_root: PathBuf,
}

impl StateManager {
    pub fn new(project_root: impl AsRef<Path>) -> Self {
        Self {
            project_root: project_root.as_ref().to_path_buf(),
        }
    }

    fn state_dir(&self) -> PathBuf {
        self.project_root.join(STATE_DIR)
    }

    pub fn state_path(&self) -> PathBuf {
        self.state_dir().join(STATE_FILE)
    }

    fn backup_path(&self) -> PathBuf {
        self.state_dir().join(STATE_BACKUP)
    }

    fn lock_path(&self) -> PathBuf {
        self.state_dir().join(LOCK_FILE)
    }

    async fn ensure_state_dir(&self) -> Result<()> {
        let dir = self.state_dir();
        if !dir.exists() {
            fs::create_dir_all(&dir).await?;
            tracing::debug!(dir = %dir.display(), "Created .stackflow directory");
        }
        Ok(())
    }

    /// Load the state of `stack`, empty if nothing was recorded yet
    pub async fn load(&self, stack: &str) -> Result<StackState> {
        let path = self.state_path();
        if !path.exists() {
            tracing::debug!(stack, "No state file yet, starting empty");
            return Ok(StackState::new(stack));
        }

        let content = fs::read_to_string(&path).await?;
        let state: StackState = serde_json::from_str(&content)?;

        if state.version > STATE_VERSION {
            return Err(CloudError::StateError(format!(
                "State file version {} is newer than supported version {}",
                state.version, STATE_VERSION
            )));
        }
        if state.stack != stack {
            return Err(CloudError::StateError(format!(
                "State file belongs to stack '{}', not '{}'",
                state.stack, stack
            )));
        }

        tracing::debug!(stack = %state.stack, resources = state.resources.len(), "Loaded state");
        Ok(state)
    }

    /// Save the state, keeping the previous file as a backup
    pub async fn save(&self, state: &StackState) -> Result<()> {
        self.ensure_state_dir().await?;

        let path = self.state_path();
        let backup = self.backup_path();

        if path.exists() {
            if backup.exists() {
                fs::remove_file(&backup).await?;
            }
            fs::rename(&path, &backup).await?;
            tracing::debug!("Created state backup");
        }

        let content = serde_json::to_string_pretty(state)?;
        fs::write(&path, content).await?;

        tracing::debug!(stack = %state.stack, resources = state.resources.len(), "Saved state");
        Ok(())
    }

    /// Acquire the exclusive apply lock
    pub async fn acquire_lock(&self) -> Result<StateLock> {
        self.ensure_state_dir().await?;

        let lock_path = self.lock_path();

        if lock_path.exists() {
            let content = fs::read_to_string(&lock_path).await?;
            let lock_info: LockInfo = serde_json::from_str(&content)?;

            let age = Utc::now().signed_duration_since(lock_info.acquired_at);
            if age.num_hours() < LOCK_STALE_HOURS {
                return Err(CloudError::LockError(format!(
                    "State is locked by {} since {}",
                    lock_info.holder, lock_info.acquired_at
                )));
            }

            tracing::warn!(holder = %lock_info.holder, acquired_at = %lock_info.acquired_at, "Removing stale state lock");
        }

        let lock_info = LockInfo {
            holder: std::env::var("HOSTNAME")
                .or_else(|_| std::env::var("HOST"))
                .unwrap_or_else(|_| "unknown".to_string()),
            acquired_at: Utc::now(),
        };

        let content = serde_json::to_string_pretty(&lock_info)?;
        fs::write(&lock_path, content).await?;

        tracing::debug!("Acquired state lock");
        Ok(StateLock {
            lock_path,
            released: false,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    holder: String,
    acquired_at: DateTime<Utc>,
}

/// RAII guard for the state lock
pub struct StateLock {
    lock_path: PathBuf,
    released: bool,
}

impl StateLock {
    pub async fn release(mut self) -> Result<()> {
        if !self.released {
            if self.lock_path.exists() {
                fs::remove_file(&self.lock_path).await?;
                tracing::debug!("Released state lock");
            }
            self.released = true;
        }
        Ok(())
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if !self.released && self.lock_path.exists() {
            let _ = std::fs::remove_file(&self.lock_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::{Change, ResourceOutcome};
    use serde_json::json;
    use stackflow_core::model::ResourceType;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;

    fn settled(id: &str, resource_type: ResourceType, outputs: Value) -> ResourceOutcome {
        let mut outcome = ResourceOutcome::new(id, resource_type);
        outcome.enter(Phase::Resolving);
        outcome.enter(Phase::Created);
        outcome.enter(Phase::Settled);
        outcome.change = Some(Change::Created);
        let Value::Object(map) = outputs else {
            panic!("outputs must be an object");
        };
        outcome.outputs = Some(Arc::new(map.into_iter().collect()));
        outcome
    }

    #[tokio::test]
    async fn test_state_save_load() {
        let temp_dir = tempdir().unwrap();
        let manager = StateManager::new(temp_dir.path());

        let report = ApplyReport::new(
            Operation::Apply,
            vec![settled(
                "container-registry",
                ResourceType::ContainerRegistry,
                json!({ "name": "demoacr", "loginServer": "demoacr.azurecr.io" }),
            )],
            Duration::ZERO,
        );
        let mut state = StackState::new("demo");
        state.record(&report);
        manager.save(&state).await.unwrap();

        let loaded = manager.load("demo").await.unwrap();
        let record = loaded.get_resource("container-registry").unwrap();
        assert_eq!(record.phase, Phase::Settled);
        assert_eq!(record.outputs["loginServer"], json!("demoacr.azurecr.io"));

        // second save keeps a backup
        manager.save(&loaded).await.unwrap();
        assert!(temp_dir.path().join(".stackflow/state.json.backup").exists());
    }

    #[tokio::test]
    async fn test_empty_state() {
        let temp_dir = tempdir().unwrap();
        let manager = StateManager::new(temp_dir.path());

        let state = manager.load("demo").await.unwrap();
        assert!(state.resources.is_empty());
        assert_eq!(state.stack, "demo");
    }

    #[tokio::test]
    async fn test_state_of_another_stack_is_rejected() {
        let temp_dir = tempdir().unwrap();
        let manager = StateManager::new(temp_dir.path());
        manager.save(&StackState::new("prod")).await.unwrap();

        let err = manager.load("dev").await.unwrap_err();
        assert!(matches!(err, CloudError::StateError(_)));
    }

    #[test]
    fn test_nested_outputs_are_not_persisted() {
        let report = ApplyReport::new(
            Operation::Apply,
            vec![settled(
                "backend-app",
                ResourceType::WebApp,
                json!({
                    "defaultHostName": "api.azurewebsites.net",
                    "siteConfig": { "appSettings": [{ "name": "PASSWORD", "value": "s3cret" }] },
                }),
            )],
            Duration::ZERO,
        );
        let mut state = StackState::new("demo");
        state.record(&report);

        let record = state.get_resource("backend-app").unwrap();
        assert!(record.outputs.contains_key("defaultHostName"));
        assert!(!record.outputs.contains_key("siteConfig"));
    }

    #[test]
    fn test_destroy_drops_deleted_resources() {
        let mut state = StackState::new("demo");
        state.record(&ApplyReport::new(
            Operation::Apply,
            vec![settled("resource-group", ResourceType::ResourceGroup, json!({}))],
            Duration::ZERO,
        ));
        state.outputs.insert("resourceGroupName".to_string(), json!("demo-rg"));

        let mut deleted = ResourceOutcome::new("resource-group", ResourceType::ResourceGroup);
        deleted.enter(Phase::Resolving);
        deleted.enter(Phase::Deleted);
        deleted.enter(Phase::Settled);
        deleted.change = Some(Change::Deleted);
        state.record(&ApplyReport::new(
            Operation::Destroy,
            vec![deleted],
            Duration::ZERO,
        ));

        assert!(state.resources.is_empty());
        assert!(state.outputs.is_empty());
    }

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let temp_dir = tempdir().unwrap();
        let manager = StateManager::new(temp_dir.path());

        let lock = manager.acquire_lock().await.unwrap();
        assert!(matches!(
            manager.acquire_lock().await,
            Err(CloudError::LockError(_))
        ));
        lock.release().await.unwrap();
        assert!(manager.acquire_lock().await.is_ok());
    }
}
