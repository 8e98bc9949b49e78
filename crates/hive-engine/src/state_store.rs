//! Durable run-state persistence.
//!
//! One JSON snapshot per `(project, run_id)`. The orchestrator process is the
//! exclusive writer; readers may see stale snapshots but never torn ones,
//! because rename is the only publishing step.

use std::path::PathBuf;

use hive_core::{PathsContext, RunState, SCHEMA_VERSION};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("run state not found: {0}")]
    NotFound(PathBuf),
    #[error("run state corrupt at {path}: {source}")]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("snapshot schema version {found} does not match {expected}; migration required")]
    SchemaVersionMismatch { found: u32, expected: u32 },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StateStoreError>;

/// Store for one run's snapshot file.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(paths: &PathsContext, project: &str, run_id: &str) -> Self {
        Self {
            path: paths.run_state_file(project, run_id),
        }
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Atomically replace the persisted snapshot.
    ///
    /// Stamps `updated_at`, writes a sibling temp file, fsyncs it, then
    /// renames over the target. No in-place partial writes.
    pub fn save(&self, state: &mut RunState) -> Result<()> {
        state.updated_at = chrono::Utc::now();
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(state).map_err(|source| StateStoreError::Corrupt {
            path: tmp.clone(),
            source,
        })?;
        {
            use std::io::Write;
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), "run state persisted");
        Ok(())
    }

    /// Read the snapshot back.
    pub fn load(&self) -> Result<RunState> {
        let content = match std::fs::read(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StateStoreError::NotFound(self.path.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        let state: RunState =
            serde_json::from_slice(&content).map_err(|source| StateStoreError::Corrupt {
                path: self.path.clone(),
                source,
            })?;
        if state.schema_version != SCHEMA_VERSION {
            return Err(StateStoreError::SchemaVersionMismatch {
                found: state.schema_version,
                expected: SCHEMA_VERSION,
            });
        }
        Ok(state)
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }
}

/// Latest run id for a project, or `None` when the project has no runs.
///
/// Run ids sort lexically in creation order, so the greatest filename wins.
pub fn find_latest_run_id(paths: &PathsContext, project: &str) -> Result<Option<String>> {
    let dir = paths.state_dir(project);
    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut latest: Option<String> = None;
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(run_id) = name
            .strip_prefix("run-")
            .and_then(|rest| rest.strip_suffix(".json"))
        else {
            continue;
        };
        if latest.as_deref().map_or(true, |cur| run_id > cur) {
            latest = Some(run_id.to_string());
        }
    }
    Ok(latest)
}
