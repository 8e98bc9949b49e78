//! Compliance capability contract.
//!
//! The compliance pipeline checks a validated task's actual footprint
//! against its declared manifest scope. The engine interprets the outcome:
//! a `block` policy with block-level violations sends the task to
//! `rescope_required`.

use std::path::PathBuf;

use async_trait::async_trait;
use hive_core::{ManifestEnforcement, TaskManifest};
use serde::{Deserialize, Serialize};

/// Context for one compliance evaluation.
#[derive(Debug, Clone)]
pub struct ComplianceInput {
    pub project: String,
    pub run_id: String,
    pub task_id: String,
    pub manifest: TaskManifest,
    pub workspace_path: PathBuf,
    pub changed_files: Vec<String>,
}

/// Scope-violation counters at each severity.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ScopeViolations {
    pub warn_count: u32,
    pub block_count: u32,
}

/// Rescope request derived from the violations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RescopeDecision {
    /// `"none"`, `"requested"`, `"required"`.
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Result of `run_for_task`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceOutcome {
    pub effective_policy: ManifestEnforcement,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_path: Option<PathBuf>,
    /// True when the task stayed inside its declared scope.
    pub compliance: bool,
    pub scope_violations: ScopeViolations,
    pub rescope: RescopeDecision,
}

impl ComplianceOutcome {
    /// Whether the engine must block the task pending a rescope.
    pub fn blocks(&self) -> bool {
        self.effective_policy == ManifestEnforcement::Block
            && self.scope_violations.block_count > 0
    }

    pub fn clean(policy: ManifestEnforcement) -> Self {
        Self {
            effective_policy: policy,
            report_path: None,
            compliance: true,
            scope_violations: ScopeViolations::default(),
            rescope: RescopeDecision {
                status: "none".to_string(),
                reason: None,
            },
        }
    }
}

/// The compliance capability.
#[async_trait]
pub trait CompliancePipeline: Send + Sync {
    async fn run_for_task(&self, input: &ComplianceInput) -> eyre::Result<ComplianceOutcome>;
}

/// Pipeline that accepts everything (enforcement off).
#[derive(Debug, Default, Clone)]
pub struct NoCompliance;

#[async_trait]
impl CompliancePipeline for NoCompliance {
    async fn run_for_task(&self, _input: &ComplianceInput) -> eyre::Result<ComplianceOutcome> {
        Ok(ComplianceOutcome::clean(ManifestEnforcement::Off))
    }
}
