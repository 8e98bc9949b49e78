//! Run configuration.
//!
//! TOML file with serde defaults; every field has a sensible default so a
//! minimal config only names `repo_path` and `doctor`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::EnforcementMode;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Token budget policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetsConfig {
    /// 0 disables the per-task ceiling.
    pub max_tokens_per_task: u64,
    pub mode: EnforcementMode,
}

/// Manifest scope enforcement policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManifestEnforcement {
    Off,
    #[default]
    Warn,
    Block,
}

impl ManifestEnforcement {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Warn => "warn",
            Self::Block => "block",
        }
    }
}

/// Doctor canary policy: a doctor that never fails cannot gate anything, so
/// the canary deliberately runs it once in a mode expected to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoctorCanaryMode {
    #[default]
    Off,
    Env,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DoctorCanaryConfig {
    pub mode: DoctorCanaryMode,
    /// Environment variable set to `1` during the canary invocation.
    pub env_var: String,
    pub warn_on_unexpected_pass: bool,
}

impl Default for DoctorCanaryConfig {
    fn default() -> Self {
        Self {
            mode: DoctorCanaryMode::Off,
            env_var: "DOCTOR_CANARY".to_string(),
            warn_on_unexpected_pass: true,
        }
    }
}

/// Which lock sets the scheduler enforces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    #[default]
    Declared,
    Derived,
}

impl LockMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Declared => "declared",
            Self::Derived => "derived",
        }
    }
}

/// Control-plane integration knobs. The engine only consumes query hooks;
/// everything here shapes how derived locks are requested and interpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    pub enabled: bool,
    pub component_resource_prefix: String,
    pub fallback_resource: String,
    pub lock_mode: LockMode,
    pub scope_mode: String,
    pub checks: Vec<String>,
    pub surface_patterns: Vec<String>,
    pub surface_locks_enabled: bool,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            component_resource_prefix: "component:".to_string(),
            fallback_resource: "repo".to_string(),
            lock_mode: LockMode::Declared,
            scope_mode: "components".to_string(),
            checks: Vec::new(),
            surface_patterns: Vec::new(),
            surface_locks_enabled: false,
        }
    }
}

/// Everything the run engine recognizes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub repo_path: PathBuf,
    pub main_branch: String,
    pub tasks_dir: PathBuf,
    /// Project-level verification command; gates every fast-forward.
    pub doctor: Option<String>,
    pub max_parallel: usize,
    /// 0 = unlimited.
    pub max_retries: u32,
    /// 0 = no timeout.
    pub worker_timeout_seconds: u64,
    pub doctor_timeout_seconds: u64,
    pub doctor_canary: DoctorCanaryConfig,
    /// Known lockable resources beyond file paths.
    pub resources: Vec<String>,
    pub budgets: BudgetsConfig,
    pub manifest_enforcement: ManifestEnforcement,
    pub control_plane: ControlPlaneConfig,
    pub cleanup_workspaces_on_success: bool,
    pub cleanup_containers_on_success: bool,
    /// Prefix for task branches, e.g. `task/001-add-parser`.
    pub branch_prefix: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            repo_path: PathBuf::from("."),
            main_branch: "main".to_string(),
            tasks_dir: PathBuf::from("tasks"),
            doctor: None,
            max_parallel: 4,
            max_retries: 0,
            worker_timeout_seconds: 0,
            doctor_timeout_seconds: 600,
            doctor_canary: DoctorCanaryConfig::default(),
            resources: Vec::new(),
            budgets: BudgetsConfig::default(),
            manifest_enforcement: ManifestEnforcement::default(),
            control_plane: ControlPlaneConfig::default(),
            cleanup_workspaces_on_success: true,
            cleanup_containers_on_success: true,
            branch_prefix: "task/".to_string(),
        }
    }
}

impl RunConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Resolve `repo_path` and `tasks_dir` against a base directory.
    pub fn resolve_paths(&mut self, base: &Path) {
        if self.repo_path.is_relative() {
            self.repo_path = base.join(&self.repo_path);
        }
        if self.tasks_dir.is_relative() {
            self.tasks_dir = base.join(&self.tasks_dir);
        }
    }
}
