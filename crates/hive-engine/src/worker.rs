//! Worker capability contract.
//!
//! The engine never authors code changes itself; it drives an injected
//! `WorkerRunner` that prepares, runs, resumes, stops, and cleans up task
//! attempts inside the task's worktree.

use std::path::PathBuf;

use async_trait::async_trait;
use hive_core::TaskManifest;
use serde::{Deserialize, Serialize};

use crate::journal::TaskEventsLogger;

/// Everything a worker invocation needs to know about its task.
#[derive(Debug, Clone)]
pub struct WorkerInput {
    pub project: String,
    pub run_id: String,
    pub task_id: String,
    pub manifest: TaskManifest,
    pub workspace_path: PathBuf,
    pub logs_dir: PathBuf,
    /// Append-only per-task event stream the worker may write to.
    pub task_events: TaskEventsLogger,
}

/// Token usage streamed from one worker attempt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageEvent {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub estimated_cost: f64,
}

/// Result of one `run_attempt` / `resume_attempt` call.
#[derive(Debug, Clone, Default)]
pub struct AttemptOutcome {
    pub success: bool,
    /// The worker lost its substrate (e.g. container) and wants the task
    /// re-dispatched from `pending`. Not a fatal attempt.
    pub reset_to_pending: bool,
    pub error_message: Option<String>,
    pub usage: Vec<UsageEvent>,
    /// In-attempt commits on the task branch, newest last.
    pub checkpoint_commits: Vec<String>,
}

impl AttemptOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn reset() -> Self {
        Self {
            success: false,
            reset_to_pending: true,
            ..Self::default()
        }
    }
}

/// Result of a best-effort `stop` call.
#[derive(Debug, Clone, Default)]
pub struct StopOutcome {
    pub stopped: usize,
    pub errors: usize,
}

/// The code-generation worker capability.
#[async_trait]
pub trait WorkerRunner: Send + Sync {
    /// Provision whatever the worker needs for this task (containers,
    /// credentials). Idempotent.
    async fn prepare(&self, input: &WorkerInput) -> eyre::Result<()>;

    /// Drive one attempt from the top of the task spec.
    async fn run_attempt(&self, input: &WorkerInput) -> eyre::Result<AttemptOutcome>;

    /// Continue an interrupted attempt from its last checkpoint commit.
    async fn resume_attempt(&self, input: &WorkerInput) -> eyre::Result<AttemptOutcome>;

    /// Best-effort teardown of an in-flight attempt.
    async fn stop(&self, input: &WorkerInput) -> eyre::Result<StopOutcome>;

    /// Release per-task resources after a terminal transition.
    async fn cleanup_task(&self, input: &WorkerInput) -> eyre::Result<()>;
}
