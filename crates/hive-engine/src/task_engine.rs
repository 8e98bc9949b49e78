//! Per-task lifecycle.
//!
//! One call to [`run_task`] drives a task from its `running` entry to a
//! batch-terminal status: `validated` on success, `failed` when retries are
//! exhausted, `rescope_required` on a compliance block, `needs_human_review`
//! on a blocking validator failure. Promotion to `complete` belongs to the
//! batch engine, after the integration gate.

use std::sync::Arc;
use std::time::Duration;

use hive_core::events::{
    BudgetBreachedPayload, DoctorFinishedPayload, EventPayload, EventType, TaskFinishedPayload,
    TaskResetPayload, TaskStartedPayload,
};
use hive_core::TaskStatus;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::budget::{evaluate_breaches, record_usage_updates};
use crate::compliance::ComplianceInput;
use crate::controller::Controller;
use crate::doctor::run_doctor;
use crate::journal::TaskEventsLogger;
use crate::run_engine::EngineContext;
use crate::validator::{first_blocking_failure, ValidatorInput, ValidatorKind};
use crate::worker::{AttemptOutcome, WorkerInput};

/// Outcome of one task execution, applied to state by the time it returns.
#[derive(Debug, Clone)]
pub struct TaskRunResult {
    pub task_id: String,
    pub final_status: TaskStatus,
    pub error: Option<String>,
    /// A blocking budget breach occurred; the run must end `failed`.
    pub budget_blocked: bool,
}

/// Drive one task through its attempt loop.
///
/// Precondition: the task is already `running` (the batch engine transitions
/// it before dispatch). `resume_entry` selects `resume_attempt` for the
/// first worker call; every later entry uses `run_attempt`.
pub async fn run_task(
    ctx: Arc<EngineContext>,
    controller: Arc<Controller>,
    task_id: String,
    batch_id: u32,
    resume_entry: bool,
) -> eyre::Result<TaskRunResult> {
    let manifest = ctx
        .catalog
        .get(&task_id)
        .ok_or_else(|| eyre::eyre!("task {task_id} missing from catalog"))?
        .clone();

    let (run_id, base_sha) =
        controller.with_state(|s| (s.run_id.clone(), s.base_sha.clone())).await;
    let branch =
        ctx.vcs
            .build_task_branch_name(&ctx.config.branch_prefix, &task_id, &manifest.name);
    let workspace = ctx.paths.task_workspace(&ctx.project, &run_id, &task_id);
    let logs_dir = ctx
        .paths
        .task_logs_dir(&ctx.project, &run_id, &manifest.dir_name());

    let input = WorkerInput {
        project: ctx.project.clone(),
        run_id: run_id.clone(),
        task_id: task_id.clone(),
        manifest: manifest.clone(),
        workspace_path: workspace.clone(),
        logs_dir: logs_dir.clone(),
        task_events: TaskEventsLogger::new(
            ctx.paths
                .task_events_log(&ctx.project, &run_id, &manifest.dir_name()),
        ),
    };

    let mut use_resume = resume_entry;
    let mut failed_attempts = 0u32;
    let mut budget_blocked = false;

    loop {
        // Workspace and branch prep is idempotent across attempts.
        ctx.vcs
            .create_task_workspace(&ctx.config.repo_path, &workspace, &branch, &base_sha)?;
        controller
            .mutate(|state| {
                if let Some(task) = state.tasks.get_mut(&task_id) {
                    task.batch_id = Some(batch_id);
                    task.branch = Some(branch.clone());
                    task.workspace = Some(workspace.clone());
                    task.logs_dir = Some(logs_dir.clone());
                }
            })
            .await?;

        let attempt = controller
            .with_state(|s| s.tasks.get(&task_id).map_or(1, |t| t.attempts))
            .await;
        controller.append_event(
            EventType::TaskStarted,
            EventPayload::TaskStarted(TaskStartedPayload {
                task_id: task_id.clone(),
                batch_id,
                attempt,
                branch: branch.clone(),
            }),
        );

        ctx.worker.prepare(&input).await?;

        let attempt_call = async {
            if use_resume {
                ctx.worker.resume_attempt(&input).await
            } else {
                ctx.worker.run_attempt(&input).await
            }
        };
        let outcome = if ctx.config.worker_timeout_seconds > 0 {
            match timeout(
                Duration::from_secs(ctx.config.worker_timeout_seconds),
                attempt_call,
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Ok(AttemptOutcome::failed("timeout")),
            }
        } else {
            attempt_call.await
        };
        use_resume = false;

        // Worker transport errors count as failed attempts, like timeouts.
        let outcome = outcome.unwrap_or_else(|e| AttemptOutcome::failed(e.to_string()));

        // Fold streamed usage into the snapshot before anything else; a
        // budget breach must be visible even if the attempt failed.
        if !outcome.usage.is_empty() {
            let snapshot = controller
                .mutate(|state| record_usage_updates(state, &task_id, attempt, &outcome.usage))
                .await?;
            if let Some(snapshot) = snapshot {
                let report = evaluate_breaches(&task_id, &snapshot, &ctx.config.budgets);
                for breach in &report.breaches {
                    warn!(
                        task_id = %task_id,
                        tokens = breach.tokens_used,
                        ceiling = breach.max_tokens_per_task,
                        mode = breach.mode.as_str(),
                        "task exceeded token budget"
                    );
                    controller.append_event(
                        EventType::BudgetBreached,
                        EventPayload::BudgetBreached(BudgetBreachedPayload {
                            task_id: task_id.clone(),
                            tokens_used: breach.tokens_used,
                            max_tokens_per_task: breach.max_tokens_per_task,
                            mode: breach.mode.as_str().to_string(),
                        }),
                    );
                }
                budget_blocked |= report.is_blocking();
            }
        }
        if !outcome.checkpoint_commits.is_empty() {
            controller
                .mutate(|state| {
                    if let Some(task) = state.tasks.get_mut(&task_id) {
                        task.checkpoint_commits
                            .extend(outcome.checkpoint_commits.iter().cloned());
                    }
                })
                .await?;
        }

        if outcome.reset_to_pending {
            // Not a fatal attempt: back to pending, then straight into the
            // next running entry. Attempts are preserved by the revert and
            // incremented by the re-entry.
            controller.transition_task(&task_id, TaskStatus::Pending).await?;
            let attempts = controller
                .with_state(|s| s.tasks.get(&task_id).map_or(0, |t| t.attempts))
                .await;
            controller.append_event(
                EventType::TaskReset,
                EventPayload::TaskReset(TaskResetPayload {
                    task_id: task_id.clone(),
                    attempts,
                }),
            );
            controller.transition_task(&task_id, TaskStatus::Running).await?;
            continue;
        }

        if !outcome.success {
            let error = outcome
                .error_message
                .clone()
                .unwrap_or_else(|| "worker attempt failed".to_string());
            failed_attempts += 1;
            controller
                .mutate(|state| {
                    if let Some(task) = state.tasks.get_mut(&task_id) {
                        task.last_error = Some(error.clone());
                    }
                })
                .await?;
            if ctx.config.max_retries > 0 && failed_attempts >= ctx.config.max_retries {
                controller.transition_task(&task_id, TaskStatus::Failed).await?;
                controller.append_event(
                    EventType::TaskFinished,
                    EventPayload::TaskFinished(TaskFinishedPayload {
                        task_id: task_id.clone(),
                        status: TaskStatus::Failed,
                        error: Some(error.clone()),
                    }),
                );
                return Ok(TaskRunResult {
                    task_id,
                    final_status: TaskStatus::Failed,
                    error: Some(error),
                    budget_blocked,
                });
            }
            warn!(task_id = %task_id, error = %error, "attempt failed, retrying");
            controller
                .mutate(|state| {
                    if let Some(task) = state.tasks.get_mut(&task_id) {
                        task.attempts += 1;
                    }
                })
                .await?;
            continue;
        }

        // Worker succeeded; the task doctor must agree before validation.
        if let Some(doctor_cmd) = manifest.verify.doctor.clone() {
            let doctor = run_doctor(
                &doctor_cmd,
                &workspace,
                ctx.config.doctor_timeout_seconds,
                &[],
            )
            .await?;
            controller.append_event(
                EventType::DoctorFinished,
                EventPayload::DoctorFinished(DoctorFinishedPayload {
                    scope: "task".to_string(),
                    task_id: Some(task_id.clone()),
                    passed: doctor.passed,
                    duration_ms: doctor.duration_ms,
                }),
            );
            if !doctor.passed {
                let error = if doctor.timed_out {
                    "task doctor timed out".to_string()
                } else {
                    format!(
                        "task doctor failed (exit {:?}): {}",
                        doctor.exit_code, doctor.output_tail
                    )
                };
                failed_attempts += 1;
                controller
                    .mutate(|state| {
                        if let Some(task) = state.tasks.get_mut(&task_id) {
                            task.last_error = Some(error.clone());
                        }
                    })
                    .await?;
                if ctx.config.max_retries > 0 && failed_attempts >= ctx.config.max_retries {
                    controller.transition_task(&task_id, TaskStatus::Failed).await?;
                    return Ok(TaskRunResult {
                        task_id,
                        final_status: TaskStatus::Failed,
                        error: Some(error),
                        budget_blocked,
                    });
                }
                controller
                    .mutate(|state| {
                        if let Some(task) = state.tasks.get_mut(&task_id) {
                            task.attempts += 1;
                        }
                    })
                    .await?;
                continue;
            }
        }

        let changed_files = ctx.vcs.list_changed_files(&workspace, &base_sha)?;

        // Compliance gates the validated transition: a scope the manifest
        // never declared must be rescoped before integration is considered.
        let compliance = ctx
            .compliance
            .run_for_task(&ComplianceInput {
                project: ctx.project.clone(),
                run_id: run_id.clone(),
                task_id: task_id.clone(),
                manifest: manifest.clone(),
                workspace_path: workspace.clone(),
                changed_files: changed_files.clone(),
            })
            .await?;
        if compliance.blocks() {
            let error = compliance
                .rescope
                .reason
                .clone()
                .unwrap_or_else(|| "manifest scope violations".to_string());
            controller
                .mutate(|state| {
                    if let Some(task) = state.tasks.get_mut(&task_id) {
                        task.last_error = Some(error.clone());
                    }
                })
                .await?;
            controller
                .transition_task(&task_id, TaskStatus::RescopeRequired)
                .await?;
            controller.append_event(
                EventType::TaskFinished,
                EventPayload::TaskFinished(TaskFinishedPayload {
                    task_id: task_id.clone(),
                    status: TaskStatus::RescopeRequired,
                    error: Some(error.clone()),
                }),
            );
            return Ok(TaskRunResult {
                task_id,
                final_status: TaskStatus::RescopeRequired,
                error: Some(error),
                budget_blocked,
            });
        }

        controller.transition_task(&task_id, TaskStatus::Validated).await?;

        let validator_input = ValidatorInput {
            project: ctx.project.clone(),
            run_id: run_id.clone(),
            task_id: task_id.clone(),
            manifest: manifest.clone(),
            workspace_path: workspace.clone(),
            changed_files,
        };
        let mut results = Vec::new();
        for kind in ValidatorKind::ALL {
            if let Some(result) = ctx.validators.run(kind, &validator_input).await? {
                results.push(result);
            }
        }
        controller
            .mutate(|state| {
                if let Some(task) = state.tasks.get_mut(&task_id) {
                    task.validator_results = results.clone();
                }
            })
            .await?;

        if let Some(blocking) = first_blocking_failure(&results) {
            let error = blocking
                .summary
                .clone()
                .unwrap_or_else(|| format!("{} validator failed", blocking.kind));
            controller
                .mutate(|state| {
                    if let Some(task) = state.tasks.get_mut(&task_id) {
                        task.last_error = Some(error.clone());
                        task.human_review = Some(hive_core::HumanReview {
                            reason: "validator_failed".to_string(),
                            created_at: chrono::Utc::now(),
                            detail: Some(error.clone()),
                        });
                    }
                })
                .await?;
            controller
                .transition_task(&task_id, TaskStatus::NeedsHumanReview)
                .await?;
            controller.append_event(
                EventType::TaskFinished,
                EventPayload::TaskFinished(TaskFinishedPayload {
                    task_id: task_id.clone(),
                    status: TaskStatus::NeedsHumanReview,
                    error: Some(error.clone()),
                }),
            );
            return Ok(TaskRunResult {
                task_id,
                final_status: TaskStatus::NeedsHumanReview,
                error: Some(error),
                budget_blocked,
            });
        }

        info!(task_id = %task_id, attempts = attempt, "task validated");
        controller.append_event(
            EventType::TaskFinished,
            EventPayload::TaskFinished(TaskFinishedPayload {
                task_id: task_id.clone(),
                status: TaskStatus::Validated,
                error: None,
            }),
        );
        return Ok(TaskRunResult {
            task_id,
            final_status: TaskStatus::Validated,
            error: None,
            budget_blocked,
        });
    }
}
