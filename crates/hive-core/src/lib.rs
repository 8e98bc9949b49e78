//! hive-core - Shared data layer for the taskhive orchestrator.
//!
//! Pure types: run/task/batch state, task manifests, lock algebra, run
//! configuration, journal events, and the on-disk path layout. No I/O beyond
//! reading manifest and config files.

pub mod config;
pub mod events;
pub mod locks;
pub mod manifest;
pub mod paths;
pub mod types;

pub use config::{
    BudgetsConfig, ControlPlaneConfig, DoctorCanaryConfig, DoctorCanaryMode, LockMode,
    ManifestEnforcement, RunConfig,
};
pub use locks::{normalize_locks, NormalizedLocks, RawLocks};
pub use manifest::{TaskCatalog, TaskManifest, TddMode, VerifySpec};
pub use paths::PathsContext;
pub use types::{
    new_run_id, slugify, AttemptUsage, BatchState, BatchStatus, EnforcementMode, HumanReview,
    RunState, RunStatus, TaskState, TaskStatus, ValidatorResult, ValidatorStatus, SCHEMA_VERSION,
};
