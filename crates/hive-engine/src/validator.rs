//! Validator capability contract.
//!
//! Validators (test, style, architecture) run after a task is validated by
//! its worker and doctor. The engine only interprets verdicts: a `fail` from
//! a validator in `block` mode sends the task to human review.

use std::path::PathBuf;

use async_trait::async_trait;
use hive_core::{TaskManifest, ValidatorResult, ValidatorStatus};

/// Validator kinds invoked once each, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidatorKind {
    Test,
    Style,
    Architecture,
}

impl ValidatorKind {
    pub const ALL: [ValidatorKind; 3] = [Self::Test, Self::Style, Self::Architecture];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Test => "test",
            Self::Style => "style",
            Self::Architecture => "architecture",
        }
    }
}

/// Context handed to each validator invocation.
#[derive(Debug, Clone)]
pub struct ValidatorInput {
    pub project: String,
    pub run_id: String,
    pub task_id: String,
    pub manifest: TaskManifest,
    pub workspace_path: PathBuf,
    /// Repo-relative files the task changed, from the VCS adapter.
    pub changed_files: Vec<String>,
}

/// The validation capability.
#[async_trait]
pub trait ValidatorRunner: Send + Sync {
    /// Run one validator kind. `None` means the kind is disabled.
    async fn run(
        &self,
        kind: ValidatorKind,
        input: &ValidatorInput,
    ) -> eyre::Result<Option<ValidatorResult>>;
}

/// First blocking failure in a result set, if any.
pub fn first_blocking_failure(results: &[ValidatorResult]) -> Option<&ValidatorResult> {
    results.iter().find(|r| {
        r.mode == hive_core::EnforcementMode::Block
            && matches!(r.status, ValidatorStatus::Fail)
    })
}

/// Validator runner with every kind disabled.
#[derive(Debug, Default, Clone)]
pub struct NoValidators;

#[async_trait]
impl ValidatorRunner for NoValidators {
    async fn run(
        &self,
        _kind: ValidatorKind,
        _input: &ValidatorInput,
    ) -> eyre::Result<Option<ValidatorResult>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_core::EnforcementMode;

    fn result(kind: &str, status: ValidatorStatus, mode: EnforcementMode) -> ValidatorResult {
        ValidatorResult {
            kind: kind.to_string(),
            status,
            mode,
            summary: None,
            report_path: None,
        }
    }

    #[test]
    fn warn_failures_do_not_block() {
        let results = vec![
            result("test", ValidatorStatus::Fail, EnforcementMode::Warn),
            result("style", ValidatorStatus::Pass, EnforcementMode::Block),
        ];
        assert!(first_blocking_failure(&results).is_none());
    }

    #[test]
    fn first_blocking_failure_wins() {
        let results = vec![
            result("test", ValidatorStatus::Pass, EnforcementMode::Block),
            result("style", ValidatorStatus::Fail, EnforcementMode::Block),
            result("architecture", ValidatorStatus::Fail, EnforcementMode::Block),
        ];
        let first = first_blocking_failure(&results).unwrap();
        assert_eq!(first.kind, "style");
    }

    #[test]
    fn errors_and_skips_do_not_block() {
        let results = vec![
            result("test", ValidatorStatus::Error, EnforcementMode::Block),
            result("style", ValidatorStatus::Skip, EnforcementMode::Block),
        ];
        assert!(first_blocking_failure(&results).is_none());
    }
}
