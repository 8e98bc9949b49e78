//! Run index and task ledger.
//!
//! `history/<project>/runs.json` gains one entry when a run reaches a
//! terminal status. `history/<project>/tasks.json` is keyed by merge commit:
//! one entry per fast-forwarded batch, listing exactly the tasks whose
//! branches contributed to that merge. Both are rewritten atomically.

use std::path::Path;

use chrono::{DateTime, Utc};
use hive_core::{PathsContext, RunStatus};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("history file corrupt at {path}: {source}")]
    Corrupt {
        path: std::path::PathBuf,
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, HistoryError>;

/// One terminal run in the index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunIndexEntry {
    pub run_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub tasks_total: usize,
    pub tasks_complete: usize,
    pub tokens_used: u64,
    pub estimated_cost: f64,
}

/// One fast-forwarded batch in the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLedgerEntry {
    pub merge_commit: String,
    pub run_id: String,
    pub batch_id: u32,
    pub tasks: Vec<String>,
    pub merged_at: DateTime<Utc>,
}

fn read_entries<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    match std::fs::read(path) {
        Ok(content) => {
            serde_json::from_slice(&content).map_err(|source| HistoryError::Corrupt {
                path: path.to_path_buf(),
                source,
            })
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

fn write_entries<T: Serialize>(path: &Path, entries: &[T]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    let json = serde_json::to_vec_pretty(entries).map_err(|source| HistoryError::Corrupt {
        path: tmp.clone(),
        source,
    })?;
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Append a run to the project index.
pub fn append_run(paths: &PathsContext, project: &str, entry: RunIndexEntry) -> Result<()> {
    let path = paths.runs_index(project);
    let mut entries: Vec<RunIndexEntry> = read_entries(&path)?;
    entries.push(entry);
    write_entries(&path, &entries)
}

/// Append a merge to the project ledger. Re-appending the same merge commit
/// is a no-op, which keeps the ledger consistent across crash-resume.
pub fn append_merge(paths: &PathsContext, project: &str, entry: TaskLedgerEntry) -> Result<()> {
    let path = paths.tasks_ledger(project);
    let mut entries: Vec<TaskLedgerEntry> = read_entries(&path)?;
    if entries.iter().any(|e| e.merge_commit == entry.merge_commit) {
        return Ok(());
    }
    entries.push(entry);
    write_entries(&path, &entries)
}

pub fn load_runs(paths: &PathsContext, project: &str) -> Result<Vec<RunIndexEntry>> {
    read_entries(&paths.runs_index(project))
}

pub fn load_merges(paths: &PathsContext, project: &str) -> Result<Vec<TaskLedgerEntry>> {
    read_entries(&paths.tasks_ledger(project))
}
