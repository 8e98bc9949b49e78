//! On-disk layout under the orchestrator home.
//!
//! ```text
//! state/<project>/run-<runId>.json
//! logs/<project>/run-<runId>/orchestrator.jsonl
//! logs/<project>/run-<runId>/tasks/<taskId>-<slug>/events.jsonl
//! workspaces/<project>/run-<runId>/task-<id>
//! history/<project>/runs.json
//! history/<project>/tasks.json
//! ```

use std::path::{Path, PathBuf};

/// Resolves every on-disk location from a single root.
#[derive(Debug, Clone)]
pub struct PathsContext {
    home: PathBuf,
}

impl PathsContext {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    /// Default home: `$HIVE_HOME`, else `$XDG_DATA_HOME/taskhive`,
    /// else `~/.local/share/taskhive`.
    pub fn default_home() -> PathBuf {
        if let Some(home) = std::env::var_os("HIVE_HOME") {
            return PathBuf::from(home);
        }
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".local/share")))
            .unwrap_or_else(|| PathBuf::from("."))
            .join("taskhive")
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn state_dir(&self, project: &str) -> PathBuf {
        self.home.join("state").join(project)
    }

    pub fn run_state_file(&self, project: &str, run_id: &str) -> PathBuf {
        self.state_dir(project).join(format!("run-{run_id}.json"))
    }

    pub fn run_logs_dir(&self, project: &str, run_id: &str) -> PathBuf {
        self.home
            .join("logs")
            .join(project)
            .join(format!("run-{run_id}"))
    }

    pub fn orchestrator_log(&self, project: &str, run_id: &str) -> PathBuf {
        self.run_logs_dir(project, run_id).join("orchestrator.jsonl")
    }

    pub fn task_logs_dir(&self, project: &str, run_id: &str, task_dir_name: &str) -> PathBuf {
        self.run_logs_dir(project, run_id)
            .join("tasks")
            .join(task_dir_name)
    }

    pub fn task_events_log(&self, project: &str, run_id: &str, task_dir_name: &str) -> PathBuf {
        self.task_logs_dir(project, run_id, task_dir_name)
            .join("events.jsonl")
    }

    pub fn run_workspaces_dir(&self, project: &str, run_id: &str) -> PathBuf {
        self.home
            .join("workspaces")
            .join(project)
            .join(format!("run-{run_id}"))
    }

    pub fn task_workspace(&self, project: &str, run_id: &str, task_id: &str) -> PathBuf {
        self.run_workspaces_dir(project, run_id)
            .join(format!("task-{task_id}"))
    }

    pub fn history_dir(&self, project: &str) -> PathBuf {
        self.home.join("history").join(project)
    }

    pub fn runs_index(&self, project: &str) -> PathBuf {
        self.history_dir(project).join("runs.json")
    }

    pub fn tasks_ledger(&self, project: &str) -> PathBuf {
        self.history_dir(project).join("tasks.json")
    }
}
