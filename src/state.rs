use crate::shared::fs_atomic::atomic_write_file;
use crate::shared::ids;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

pub const SCHEMA_VERSION: &str = "1.1.1";
const MAX_BACKUPS: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("failed to read state {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid json in state {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write state {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize state: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("state not initialized")]
    NotInitialized,
    #[error("workflow file not found: {path}")]
    WorkflowMissing { path: String },
    #[error("no parseable backup found for {path}")]
    RepairFailed { path: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Suspended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepError {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub context: Value,
}

impl StepError {
    pub fn new(kind: &str, message: impl Into<String>, context: Value) -> Self {
        Self {
            kind: Some(kind.to_string()),
            message: message.into(),
            context,
        }
    }
}

fn is_false(flag: &bool) -> bool {
    !*flag
}

/// One step's durable result. Absent optional fields are omitted from the
/// serialized document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lines: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json: Option<Value>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<Value>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub skipped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timed_out: Option<bool>,
}

impl StepRecord {
    pub fn with_status(status: StepStatus) -> Self {
        Self {
            status,
            exit_code: None,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            output: None,
            lines: None,
            json: None,
            truncated: false,
            error: None,
            debug: None,
            skipped: false,
            files: None,
            wait_duration_ms: None,
            poll_count: None,
            timed_out: None,
        }
    }

    /// A conditional skip: terminal, exit 0, `skipped: true` marker.
    pub fn skipped() -> Self {
        let mut record = Self::with_status(StepStatus::Skipped);
        record.exit_code = Some(0);
        record.skipped = true;
        record
    }

    pub fn failed(exit_code: i32, error: StepError) -> Self {
        let mut record = Self::with_status(StepStatus::Failed);
        record.exit_code = Some(exit_code);
        record.error = Some(error);
        record
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, StepStatus::Completed | StepStatus::Skipped)
    }

    pub fn to_value(&self) -> Result<Value, StateError> {
        serde_json::to_value(self).map_err(StateError::Serialize)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ForEachProgress {
    pub items: Vec<Value>,
    #[serde(default)]
    pub completed_indices: Vec<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_index: Option<usize>,
}

/// The durable run-state document persisted at
/// `<workspace>/.orchestrate/runs/<run_id>/state.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub schema_version: String,
    pub run_id: String,
    pub workflow_file: String,
    pub workflow_checksum: String,
    pub started_at: String,
    pub updated_at: String,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_root: Option<String>,
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    #[serde(default)]
    pub steps: Map<String, Value>,
    #[serde(default)]
    pub for_each: BTreeMap<String, ForEachProgress>,
}

impl RunState {
    /// Deserializes the entry under `key` back into a step record. Returns
    /// None for absent keys and for for-each aggregate arrays.
    pub fn step_record(&self, key: &str) -> Option<StepRecord> {
        let value = self.steps.get(key)?;
        serde_json::from_value(value.clone()).ok()
    }
}

/// Owns the state document: atomic writes, per-step backups with rotation,
/// repair from backups, and checksum validation.
pub struct StateStore {
    workspace: PathBuf,
    run_id: String,
    run_root: PathBuf,
    state_path: PathBuf,
    logs_dir: PathBuf,
    backup_enabled: bool,
    state: Option<RunState>,
}

impl StateStore {
    pub fn new(workspace: &Path, run_id: Option<String>, backup_enabled: bool, debug: bool) -> Self {
        let run_id = run_id.unwrap_or_else(ids::mint_run_id);
        let run_root = workspace.join(".orchestrate").join("runs").join(&run_id);
        Self {
            workspace: workspace.to_path_buf(),
            state_path: run_root.join("state.json"),
            logs_dir: run_root.join("logs"),
            run_root,
            run_id,
            backup_enabled: backup_enabled || debug,
            state: None,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn run_root(&self) -> &Path {
        &self.run_root
    }

    pub fn logs_dir(&self) -> &Path {
        &self.logs_dir
    }

    pub fn state(&self) -> Result<&RunState, StateError> {
        self.state.as_ref().ok_or(StateError::NotInitialized)
    }

    pub fn initialize(
        &mut self,
        workflow_file: &str,
        context: BTreeMap<String, String>,
    ) -> Result<&RunState, StateError> {
        fs::create_dir_all(&self.logs_dir).map_err(|source| StateError::Write {
            path: self.logs_dir.display().to_string(),
            source,
        })?;

        let workflow_path = self.resolve_workflow_path(workflow_file);
        if !workflow_path.exists() {
            return Err(StateError::WorkflowMissing {
                path: workflow_file.to_string(),
            });
        }
        let workflow_checksum = compute_checksum(&workflow_path)?;

        let now = Utc::now().to_rfc3339();
        self.state = Some(RunState {
            schema_version: SCHEMA_VERSION.to_string(),
            run_id: self.run_id.clone(),
            workflow_file: workflow_file.to_string(),
            workflow_checksum,
            started_at: now.clone(),
            updated_at: now,
            status: RunStatus::Running,
            run_root: Some(self.run_root.display().to_string()),
            context,
            steps: Map::new(),
            for_each: BTreeMap::new(),
        });
        self.write_state()?;
        self.state()
    }

    pub fn load(&mut self) -> Result<&RunState, StateError> {
        let raw = fs::read(&self.state_path).map_err(|source| StateError::Read {
            path: self.state_path.display().to_string(),
            source,
        })?;
        let state = serde_json::from_slice(&raw).map_err(|source| StateError::Parse {
            path: self.state_path.display().to_string(),
            source,
        })?;
        self.state = Some(state);
        self.state()
    }

    fn write_state(&mut self) -> Result<(), StateError> {
        let state = self.state.as_mut().ok_or(StateError::NotInitialized)?;
        state.updated_at = Utc::now().to_rfc3339();
        let body = serde_json::to_vec_pretty(&*state).map_err(StateError::Serialize)?;
        atomic_write_file(&self.state_path, &body).map_err(|source| StateError::Write {
            path: self.state_path.display().to_string(),
            source,
        })
    }

    /// Copies the current document to `state.json.step_<name>.bak` before
    /// the named step runs, pruning all but the newest three backups.
    pub fn backup_state(&self, step_name: &str) -> Result<(), StateError> {
        if !self.backup_enabled || !self.state_path.exists() {
            return Ok(());
        }
        let backup_path = self
            .run_root
            .join(format!("state.json.step_{step_name}.bak"));
        fs::copy(&self.state_path, &backup_path).map_err(|source| StateError::Write {
            path: backup_path.display().to_string(),
            source,
        })?;
        self.rotate_backups();
        Ok(())
    }

    fn backup_files(&self) -> Vec<(PathBuf, SystemTime)> {
        let mut backups = Vec::new();
        let Ok(entries) = fs::read_dir(&self.run_root) else {
            return backups;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with("state.json.step_") && name.ends_with(".bak") {
                let modified = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                backups.push((entry.path(), modified));
            }
        }
        backups.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        backups
    }

    fn rotate_backups(&self) {
        let backups = self.backup_files();
        if backups.len() > MAX_BACKUPS {
            for (path, _) in &backups[..backups.len() - MAX_BACKUPS] {
                let _ = fs::remove_file(path);
            }
        }
    }

    pub fn update_step(&mut self, key: &str, record: &StepRecord) -> Result<(), StateError> {
        let value = record.to_value()?;
        self.update_step_value(key, value)
    }

    pub fn update_step_value(&mut self, key: &str, value: Value) -> Result<(), StateError> {
        let state = self.state.as_mut().ok_or(StateError::NotInitialized)?;
        state.steps.insert(key.to_string(), value);
        self.write_state()
    }

    pub fn update_for_each(
        &mut self,
        loop_name: &str,
        progress: ForEachProgress,
    ) -> Result<(), StateError> {
        let state = self.state.as_mut().ok_or(StateError::NotInitialized)?;
        state.for_each.insert(loop_name.to_string(), progress);
        self.write_state()
    }

    pub fn update_status(&mut self, status: RunStatus) -> Result<(), StateError> {
        let state = self.state.as_mut().ok_or(StateError::NotInitialized)?;
        state.status = status;
        self.write_state()
    }

    pub fn step_record(&self, key: &str) -> Option<StepRecord> {
        self.state.as_ref().and_then(|state| state.step_record(key))
    }

    pub fn validate_checksum(&self, workflow_path: &Path) -> Result<bool, StateError> {
        let state = self.state.as_ref().ok_or(StateError::NotInitialized)?;
        if !workflow_path.exists() {
            return Ok(false);
        }
        let current = compute_checksum(workflow_path)?;
        Ok(current == state.workflow_checksum)
    }

    /// Restores the newest backup that parses as a valid state document.
    pub fn attempt_repair(&mut self) -> Result<(), StateError> {
        let mut backups = self.backup_files();
        backups.reverse();
        for (backup, _) in backups {
            let Ok(raw) = fs::read(&backup) else { continue };
            let Ok(state) = serde_json::from_slice::<RunState>(&raw) else {
                continue;
            };
            atomic_write_file(&self.state_path, &raw).map_err(|source| StateError::Write {
                path: self.state_path.display().to_string(),
                source,
            })?;
            self.state = Some(state);
            return Ok(());
        }
        Err(StateError::RepairFailed {
            path: self.state_path.display().to_string(),
        })
    }

    fn resolve_workflow_path(&self, workflow_file: &str) -> PathBuf {
        let path = Path::new(workflow_file);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace.join(path)
        }
    }
}

/// SHA-256 of the file's bytes, prefixed `sha256:`.
pub fn compute_checksum(path: &Path) -> Result<String, StateError> {
    let raw = fs::read(path).map_err(|source| StateError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let mut hasher = Sha256::new();
    hasher.update(&raw);
    Ok(format!("sha256:{:x}", hasher.finalize()))
}
