//! hive-engine - Run-execution engine for the taskhive orchestrator.
//!
//! Schedules planned code-modification tasks into lock-safe batches, runs
//! each task in an isolated worktree under an injected worker, gates
//! integration on a temp merge plus the project doctor, and fast-forwards
//! the main branch with at-most-once semantics. State is checkpointed after
//! every transition and runs are crash-resumable.

pub mod batch_engine;
pub mod budget;
pub mod compliance;
pub mod control_plane;
pub mod controller;
pub mod doctor;
pub mod history;
pub mod journal;
pub mod run_engine;
pub mod scheduler;
pub mod state_store;
pub mod task_engine;
pub mod validator;
pub mod vcs;
pub mod worker;

/// Type alias for application-level errors with context and backtraces.
pub type AppResult<T> = eyre::Result<T>;

pub use batch_engine::{BatchOutcome, BatchStopReason, FinalizeOutcome};
pub use control_plane::{DerivedScopeReport, ScopeOracle};
pub use controller::Controller;
pub use run_engine::{run, EngineContext, RunOutcome, StoppedRecord};
pub use state_store::{find_latest_run_id, StateStore};
pub use task_engine::TaskRunResult;
pub use validator::{ValidatorInput, ValidatorKind, ValidatorRunner};
pub use vcs::{GitVcs, MergeRequest, MergeResult, MergeStatus, Vcs};
pub use worker::{AttemptOutcome, StopOutcome, UsageEvent, WorkerInput, WorkerRunner};
