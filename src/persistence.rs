//! Persistence collaborator interface.
//!
//! The core never owns project records. It reports every status transition
//! through [`ProjectStore::update_status`] and reads the merged hyperparameter
//! object for training jobs through [`ProjectStore::get_hyperparameters`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::state::ProjectStatus;

/// Hyperparameter object passed to a training job.
pub type Hyperparameters = Map<String, Value>;

/// Narrow view of the project persistence layer.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// Records the project's new status.
    async fn update_status(&self, project_id: u64, status: ProjectStatus) -> Result<()>;

    /// Returns the project's hyperparameters merged across all its records.
    async fn get_hyperparameters(&self, project_id: u64) -> Result<Hyperparameters>;
}

/// Merges `records` key-wise into one object; later records win.
#[must_use]
pub fn merge_hyperparameters<'a>(records: impl IntoIterator<Item = &'a Hyperparameters>) -> Hyperparameters {
    let mut merged = Map::new();
    for record in records {
        for (key, value) in record {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

/// Reads each file as a JSON object and merges them; later files win.
///
/// # Errors
///
/// Fails if a file cannot be read or does not hold a JSON object.
pub async fn merge_hyperparameter_files(paths: &[PathBuf]) -> Result<Hyperparameters> {
    let mut records = Vec::with_capacity(paths.len());
    for path in paths {
        records.push(read_hyperparameter_file(path).await?);
    }
    Ok(merge_hyperparameters(&records))
}

async fn read_hyperparameter_file(path: &Path) -> Result<Hyperparameters> {
    let contents = tokio::fs::read_to_string(path).await?;
    match serde_json::from_str::<Value>(&contents)? {
        Value::Object(map) => Ok(map),
        other => Err(Error::Serialization(format!(
            "{}: expected a JSON object, found {}",
            path.display(),
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// =============================================================================
// In-memory store
// =============================================================================

#[derive(Debug, Default)]
struct MemoryState {
    statuses: HashMap<u64, ProjectStatus>,
    history: Vec<(u64, ProjectStatus)>,
    hyperparameters: HashMap<u64, Vec<Hyperparameters>>,
}

/// Process-local [`ProjectStore`].
///
/// Used by the CLI when no external store is wired in, and by tests.
#[derive(Debug, Default)]
pub struct MemoryProjectStore {
    state: RwLock<MemoryState>,
}

impl MemoryProjectStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, MemoryState> {
        self.state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, MemoryState> {
        self.state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Adds one hyperparameter record for a project.
    pub fn add_hyperparameters(&self, project_id: u64, record: Hyperparameters) {
        self.write()
            .hyperparameters
            .entry(project_id)
            .or_default()
            .push(record);
    }

    /// Last recorded status for a project.
    pub fn status(&self, project_id: u64) -> Option<ProjectStatus> {
        self.read().statuses.get(&project_id).copied()
    }

    /// Every status update for a project, oldest first.
    pub fn history(&self, project_id: u64) -> Vec<ProjectStatus> {
        self.read()
            .history
            .iter()
            .filter(|(id, _)| *id == project_id)
            .map(|(_, status)| *status)
            .collect()
    }
}

#[async_trait]
impl ProjectStore for MemoryProjectStore {
    async fn update_status(&self, project_id: u64, status: ProjectStatus) -> Result<()> {
        let mut state = self.write();
        state.statuses.insert(project_id, status);
        state.history.push((project_id, status));
        Ok(())
    }

    async fn get_hyperparameters(&self, project_id: u64) -> Result<Hyperparameters> {
        let state = self.read();
        let records = state
            .hyperparameters
            .get(&project_id)
            .map(Vec::as_slice)
            .unwrap_or_default();
        Ok(merge_hyperparameters(records))
    }
}
