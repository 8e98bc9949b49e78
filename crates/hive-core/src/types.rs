//! Core state types for the orchestrator.
//!
//! Run, task, and batch records persisted in the run snapshot, plus the
//! status enums and the guarded transition table for tasks.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::locks::NormalizedLocks;

/// Snapshot schema version. Bumped on incompatible shape changes.
pub const SCHEMA_VERSION: u32 = 1;

/// Generate a new run id.
///
/// Uses `UUIDv7` so that lexicographic order matches creation order; the
/// state store's latest-run discovery depends on this.
pub fn new_run_id() -> String {
    Uuid::now_v7().to_string()
}

/// Run lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Paused,
    Complete,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    /// A terminal run never re-enters the batch loop.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

/// Batch lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Running,
    Complete,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }
}

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Validated,
    Complete,
    Failed,
    NeedsHumanReview,
    NeedsRescope,
    RescopeRequired,
    Skipped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Validated => "validated",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::NeedsHumanReview => "needs_human_review",
            Self::NeedsRescope => "needs_rescope",
            Self::RescopeRequired => "rescope_required",
            Self::Skipped => "skipped",
        }
    }

    /// Whether any further orchestrator transition is possible without
    /// operator intervention.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Complete | Self::Failed | Self::NeedsHumanReview | Self::Skipped
        )
    }

    /// Terminal states that count toward a `complete` run.
    pub fn is_success_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Validated | Self::Skipped)
    }

    /// Statuses that block dependents. `needs_rescope` and `rescope_required`
    /// are treated identically here: both wait on a human.
    pub fn blocks_dependents(&self) -> bool {
        matches!(
            self,
            Self::Failed | Self::NeedsHumanReview | Self::NeedsRescope | Self::RescopeRequired
        )
    }

    /// Statuses that satisfy a dependency edge.
    pub fn satisfies_dependency(&self) -> bool {
        matches!(self, Self::Complete | Self::Skipped)
    }

    /// The transition table. Every status change in the engine goes through
    /// a guard built on this; ad-hoc assignment is not allowed.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::{
            Complete, Failed, NeedsHumanReview, NeedsRescope, Pending, RescopeRequired, Running,
            Skipped, Validated,
        };
        match (self, next) {
            (Pending, Running | Skipped) => true,
            // Running may revert to Pending (worker reset / crash recovery).
            (Running, Validated | Failed | Pending | RescopeRequired) => true,
            (Validated, Complete | NeedsHumanReview) => true,
            // Operator-driven retries.
            (RescopeRequired | NeedsRescope | NeedsHumanReview, Pending) => true,
            _ => false,
        }
    }
}

/// Verdict returned by a validator invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidatorStatus {
    Pass,
    Fail,
    Error,
    Skip,
}

impl ValidatorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Error => "error",
            Self::Skip => "skip",
        }
    }
}

/// Enforcement mode attached to a validator or budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementMode {
    #[default]
    Warn,
    Block,
}

impl EnforcementMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Warn => "warn",
            Self::Block => "block",
        }
    }
}

/// Stored result of one validator kind for a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorResult {
    /// Validator kind (`test`, `style`, `architecture`).
    pub kind: String,
    pub status: ValidatorStatus,
    pub mode: EnforcementMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_path: Option<PathBuf>,
}

/// Pending human review attached to a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumanReview {
    /// What sent the task to review (`validator_failed`, `merge_conflict`,
    /// `integration_doctor_failed`, `fast_forward_failed`).
    pub reason: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Token usage recorded for one worker attempt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttemptUsage {
    pub attempt: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub estimated_cost: f64,
}

impl AttemptUsage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Per-task slice of the run snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskState {
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs_dir: Option<PathBuf>,
    /// Number of `running` entries so far. Preserved across crash recovery.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub checkpoint_commits: Vec<String>,
    #[serde(default)]
    pub validator_results: Vec<ValidatorResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub human_review: Option<HumanReview>,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub estimated_cost: f64,
    #[serde(default)]
    pub usage_by_attempt: Vec<AttemptUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Unknown fields from newer writers, preserved on round-trip.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TaskState {
    pub fn new() -> Self {
        Self {
            status: TaskStatus::Pending,
            batch_id: None,
            branch: None,
            workspace: None,
            logs_dir: None,
            attempts: 0,
            checkpoint_commits: Vec::new(),
            validator_results: Vec::new(),
            human_review: None,
            tokens_used: 0,
            estimated_cost: 0.0,
            usage_by_attempt: Vec::new(),
            last_error: None,
            completed_at: None,
            extra: serde_json::Map::new(),
        }
    }
}

impl Default for TaskState {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-batch slice of the run snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchState {
    /// Monotonic per run, starting at 1.
    pub batch_id: u32,
    pub status: BatchStatus,
    pub tasks: Vec<String>,
    pub locks: NormalizedLocks,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integration_doctor_passed: Option<bool>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl BatchState {
    pub fn new(batch_id: u32, tasks: Vec<String>, locks: NormalizedLocks) -> Self {
        Self {
            batch_id,
            status: BatchStatus::Pending,
            tasks,
            locks,
            merge_commit: None,
            integration_doctor_passed: None,
            started_at: Utc::now(),
            completed_at: None,
            extra: serde_json::Map::new(),
        }
    }
}

/// The durable run snapshot, keyed by `(project, run_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub schema_version: u32,
    pub project: String,
    pub run_id: String,
    pub repo_path: PathBuf,
    pub main_branch: String,
    /// Commit treated as the run base; stable for the life of the run.
    pub base_sha: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub batches: Vec<BatchState>,
    pub tasks: BTreeMap<String, TaskState>,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub estimated_cost: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane: Option<serde_json::Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl RunState {
    pub fn new(
        project: impl Into<String>,
        run_id: impl Into<String>,
        repo_path: impl Into<PathBuf>,
        main_branch: impl Into<String>,
        base_sha: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            schema_version: SCHEMA_VERSION,
            project: project.into(),
            run_id: run_id.into(),
            repo_path: repo_path.into(),
            main_branch: main_branch.into(),
            base_sha: base_sha.into(),
            status: RunStatus::Running,
            started_at: now,
            updated_at: now,
            batches: Vec::new(),
            tasks: BTreeMap::new(),
            tokens_used: 0,
            estimated_cost: 0.0,
            control_plane: None,
            extra: serde_json::Map::new(),
        }
    }

    /// Next batch id (monotonic per run).
    pub fn next_batch_id(&self) -> u32 {
        self.batches.last().map_or(1, |b| b.batch_id + 1)
    }

    pub fn batch_mut(&mut self, batch_id: u32) -> Option<&mut BatchState> {
        self.batches.iter_mut().find(|b| b.batch_id == batch_id)
    }
}

/// Filesystem-safe slug from a task name (lowercase, alphanumeric, hyphens).
pub fn slugify(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}
