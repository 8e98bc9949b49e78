//! Event types for the orchestrator journal.
//!
//! Every status transition the controller applies is appended to the run's
//! `orchestrator.jsonl` as one of these records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{RunStatus, TaskStatus};

/// Event type names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    RunStarted,
    RunResumed,
    RunPaused,
    RunCompleted,
    RunFailed,
    RunStopped,
    BatchStarted,
    BatchMerged,
    BatchFailed,
    MergeConflict,
    TaskStarted,
    TaskFinished,
    TaskReset,
    DoctorFinished,
    BudgetBreached,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunStarted => "RUN_STARTED",
            Self::RunResumed => "RUN_RESUMED",
            Self::RunPaused => "RUN_PAUSED",
            Self::RunCompleted => "RUN_COMPLETED",
            Self::RunFailed => "RUN_FAILED",
            Self::RunStopped => "RUN_STOPPED",
            Self::BatchStarted => "BATCH_STARTED",
            Self::BatchMerged => "BATCH_MERGED",
            Self::BatchFailed => "BATCH_FAILED",
            Self::MergeConflict => "MERGE_CONFLICT",
            Self::TaskStarted => "TASK_STARTED",
            Self::TaskFinished => "TASK_FINISHED",
            Self::TaskReset => "TASK_RESET",
            Self::DoctorFinished => "DOCTOR_FINISHED",
            Self::BudgetBreached => "BUDGET_BREACHED",
        }
    }
}

/// Payload for `RUN_STARTED` / `RUN_RESUMED`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStartedPayload {
    pub run_id: String,
    pub project: String,
    pub base_sha: String,
    pub task_count: usize,
}

/// One unmet dependency edge in a `RUN_PAUSED` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnmetDep {
    pub dep_id: String,
    pub dep_status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dep_last_error: Option<String>,
}

/// One blocked task in a `RUN_PAUSED` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockedTask {
    pub task_id: String,
    pub unmet_deps: Vec<UnmetDep>,
}

/// Payload for `RUN_PAUSED`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunPausedPayload {
    pub run_id: String,
    pub reason: String,
    pub blocked_tasks: Vec<BlockedTask>,
}

/// Payload for `RUN_COMPLETED` / `RUN_FAILED`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunFinishedPayload {
    pub run_id: String,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Payload for `RUN_STOPPED`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStoppedPayload {
    pub run_id: String,
    /// In-flight tasks at the time the signal was honored.
    pub stopped: usize,
    pub errors: usize,
    /// `"stopped"` when containers were killed, `"left"` otherwise.
    pub containers: String,
}

/// Payload for `BATCH_STARTED`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchStartedPayload {
    pub batch_id: u32,
    pub tasks: Vec<String>,
}

/// Payload for `BATCH_MERGED`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchMergedPayload {
    pub batch_id: u32,
    pub merge_commit: String,
    pub merged_tasks: Vec<String>,
    pub integration_doctor_passed: bool,
}

/// Payload for `BATCH_FAILED`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchFailedPayload {
    pub batch_id: u32,
    pub reason: String,
}

/// Payload for `MERGE_CONFLICT`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConflictPayload {
    pub batch_id: u32,
    pub task_id: String,
    pub branch: String,
}

/// Payload for `TASK_STARTED`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStartedPayload {
    pub task_id: String,
    pub batch_id: u32,
    pub attempt: u32,
    pub branch: String,
}

/// Payload for `TASK_FINISHED`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFinishedPayload {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Payload for `TASK_RESET` (worker asked to restart from pending).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResetPayload {
    pub task_id: String,
    pub attempts: u32,
}

/// Payload for `DOCTOR_FINISHED`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoctorFinishedPayload {
    /// `"task"` or `"integration"`.
    pub scope: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub passed: bool,
    pub duration_ms: u64,
}

/// Payload for `BUDGET_BREACHED`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetBreachedPayload {
    pub task_id: String,
    pub tokens_used: u64,
    pub max_tokens_per_task: u64,
    pub mode: String,
}

/// Union type for all event payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    RunStarted(RunStartedPayload),
    RunPaused(RunPausedPayload),
    RunFinished(RunFinishedPayload),
    RunStopped(RunStoppedPayload),
    BatchStarted(BatchStartedPayload),
    BatchMerged(BatchMergedPayload),
    BatchFailed(BatchFailedPayload),
    MergeConflict(MergeConflictPayload),
    TaskStarted(TaskStartedPayload),
    TaskFinished(TaskFinishedPayload),
    TaskReset(TaskResetPayload),
    DoctorFinished(DoctorFinishedPayload),
    BudgetBreached(BudgetBreachedPayload),
}

/// One journal line: timestamp, type, payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub ts: DateTime<Utc>,
    pub event: EventType,
    pub payload: EventPayload,
}

impl EventRecord {
    pub fn new(event: EventType, payload: EventPayload) -> Self {
        Self {
            ts: Utc::now(),
            event,
            payload,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
