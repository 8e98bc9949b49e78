//! Per-batch lifecycle.
//!
//! Dispatches a scheduled batch with a bounded pool, then carries the
//! integration risk in one place: temp-merge the validated branches, gate on
//! the integration doctor, fast-forward `main`, and only then promote tasks
//! to `complete`, archive their directories, and clean up.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use hive_core::events::{
    BatchFailedPayload, BatchMergedPayload, BatchStartedPayload, DoctorFinishedPayload,
    EventPayload, EventType, MergeConflictPayload,
};
use hive_core::manifest::TaskCatalog;
use hive_core::{BatchState, BatchStatus, HumanReview, NormalizedLocks, TaskStatus};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::controller::Controller;
use crate::doctor::{run_doctor, run_doctor_canary};
use crate::history::{append_merge, TaskLedgerEntry};
use crate::journal::TaskEventsLogger;
use crate::run_engine::EngineContext;
use crate::task_engine::{run_task, TaskRunResult};
use crate::vcs::{MergeBranch, MergeRequest, MergeStatus};
use crate::worker::WorkerInput;

/// Reasons a batch aborts the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStopReason {
    IntegrationDoctorFailed,
    FastForwardFailed,
}

impl BatchStopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IntegrationDoctorFailed => "integration_doctor_failed",
            Self::FastForwardFailed => "fast_forward_failed",
        }
    }
}

/// Stop-signal details when a batch was interrupted mid-dispatch.
#[derive(Debug, Clone, Copy)]
pub struct InterruptedInfo {
    /// Tasks already dispatched when the signal was honored.
    pub in_flight: usize,
    /// Failed best-effort container stops.
    pub errors: usize,
    pub containers_stopped: bool,
}

/// Result of dispatching one batch.
#[derive(Debug)]
pub struct BatchOutcome {
    pub batch_id: u32,
    pub results: Vec<TaskRunResult>,
    pub interrupted: Option<InterruptedInfo>,
}

/// Result of finalizing one batch.
#[derive(Debug, Clone)]
pub struct FinalizeOutcome {
    pub stop_reason: Option<BatchStopReason>,
    /// Tasks promoted to `complete` by this batch's fast-forward.
    pub merged_tasks: Vec<String>,
}

/// Record the batch, mark its tasks `running`, and dispatch them with a
/// concurrency cap of `max_parallel`. The stop signal is polled between
/// dispatches; tasks not yet dispatched are reverted to `pending`.
pub async fn run_batch(
    ctx: &Arc<EngineContext>,
    controller: &Arc<Controller>,
    batch_id: u32,
    task_ids: &[String],
    locks: NormalizedLocks,
) -> eyre::Result<BatchOutcome> {
    // Entry mode is decided by the history before this batch touches the
    // task: a prior attempt means the worker may hold a checkpoint.
    let prior_attempts: Vec<(String, bool)> = controller
        .with_state(|state| {
            task_ids
                .iter()
                .map(|id| {
                    let resumable = state
                        .tasks
                        .get(id)
                        .is_some_and(|t| t.attempts > 0 && !t.checkpoint_commits.is_empty());
                    (id.clone(), resumable)
                })
                .collect()
        })
        .await;

    // Worktree creation touches the shared repository, so it happens here,
    // serialized, before any task is dispatched; the task engine's own prep
    // call then short-circuits.
    let base_sha = controller.with_state(|s| s.base_sha.clone()).await;
    let run_id = controller.with_state(|s| s.run_id.clone()).await;
    for id in task_ids {
        if let Some(manifest) = ctx.catalog.get(id) {
            let branch =
                ctx.vcs
                    .build_task_branch_name(&ctx.config.branch_prefix, id, &manifest.name);
            let workspace = ctx.paths.task_workspace(&ctx.project, &run_id, id);
            ctx.vcs
                .create_task_workspace(&ctx.config.repo_path, &workspace, &branch, &base_sha)?;
        }
    }

    controller
        .mutate(|state| {
            let mut batch = BatchState::new(batch_id, task_ids.to_vec(), locks);
            batch.status = BatchStatus::Running;
            state.batches.push(batch);
        })
        .await?;
    controller.append_event(
        EventType::BatchStarted,
        EventPayload::BatchStarted(BatchStartedPayload {
            batch_id,
            tasks: task_ids.to_vec(),
        }),
    );
    for id in task_ids {
        controller.transition_task(id, TaskStatus::Running).await?;
    }

    let semaphore = Arc::new(Semaphore::new(ctx.config.max_parallel.max(1)));
    let mut join_set: JoinSet<eyre::Result<TaskRunResult>> = JoinSet::new();
    let mut dispatched: Vec<String> = Vec::new();
    let mut interrupted = false;

    for (task_id, resume_entry) in prior_attempts {
        if ctx.stop.is_cancelled() {
            interrupted = true;
            // Not dispatched: hand the task back to the next run.
            controller.transition_task(&task_id, TaskStatus::Pending).await?;
            continue;
        }
        let permit = Arc::clone(&semaphore).acquire_owned().await?;
        dispatched.push(task_id.clone());
        let ctx = Arc::clone(ctx);
        let controller = Arc::clone(controller);
        join_set.spawn(async move {
            let _permit = permit;
            run_task(ctx, controller, task_id, batch_id, resume_entry).await
        });
    }

    let mut stop_errors = 0usize;
    let mut containers_stopped = false;
    if interrupted && ctx.kill_containers_on_stop {
        containers_stopped = true;
        for task_id in &dispatched {
            let Some(manifest) = ctx.catalog.get(task_id) else {
                continue;
            };
            let input = worker_input(ctx, &run_id, task_id, manifest);
            if let Err(e) = ctx.worker.stop(&input).await {
                warn!(task_id = %task_id, error = %e, "container stop failed");
                stop_errors += 1;
            }
        }
    }

    let mut results = Vec::new();
    while let Some(joined) = join_set.join_next().await {
        results.push(joined??);
    }
    results.sort_by(|a, b| a.task_id.cmp(&b.task_id));

    Ok(BatchOutcome {
        batch_id,
        results,
        interrupted: interrupted.then_some(InterruptedInfo {
            in_flight: dispatched.len(),
            errors: stop_errors,
            containers_stopped,
        }),
    })
}

/// Integration gate for a dispatched batch.
///
/// Merge-retry loop: a conflicting branch sends its task to human review and
/// the merge is retried with the shrunken set. The integration doctor runs
/// against the temp merge; only after it passes is `main` fast-forwarded and
/// the batch's tasks promoted, archived, and cleaned up.
pub async fn finalize_batch(
    ctx: &Arc<EngineContext>,
    controller: &Arc<Controller>,
    batch_id: u32,
    results: &[TaskRunResult],
) -> eyre::Result<FinalizeOutcome> {
    let run_id = controller.with_state(|s| s.run_id.clone()).await;

    let mut candidates: Vec<String> = results
        .iter()
        .filter(|r| r.final_status == TaskStatus::Validated)
        .map(|r| r.task_id.clone())
        .collect();
    candidates.sort();

    if candidates.is_empty() {
        finish_batch(controller, batch_id, BatchStatus::Failed, None, None).await?;
        controller.append_event(
            EventType::BatchFailed,
            EventPayload::BatchFailed(BatchFailedPayload {
                batch_id,
                reason: "no_validated_tasks".to_string(),
            }),
        );
        return Ok(FinalizeOutcome {
            stop_reason: None,
            merged_tasks: Vec::new(),
        });
    }

    // Resolve branches once up front; a validated task always has one.
    let branches: std::collections::BTreeMap<String, String> = controller
        .with_state(|state| {
            candidates
                .iter()
                .filter_map(|id| {
                    state
                        .tasks
                        .get(id)
                        .and_then(|t| t.branch.clone())
                        .map(|branch| (id.clone(), branch))
                })
                .collect()
        })
        .await;
    candidates.retain(|id| branches.contains_key(id));

    let mut merge_attempt = 0u32;
    let merge = loop {
        if candidates.is_empty() {
            break None;
        }
        merge_attempt += 1;
        let request = MergeRequest {
            repo_path: ctx.config.repo_path.clone(),
            main_branch: ctx.config.main_branch.clone(),
            branches: candidates
                .iter()
                .map(|id| MergeBranch {
                    task_id: id.clone(),
                    branch: branches[id].clone(),
                })
                .collect(),
            workdir: ctx
                .paths
                .run_workspaces_dir(&ctx.project, &run_id)
                .join(format!("integration-batch-{batch_id}-{merge_attempt}")),
        };
        let result = ctx.vcs.merge_task_branches(&request)?;
        match result.status {
            MergeStatus::Merged => break Some(result),
            MergeStatus::Conflict => {
                let conflicted: HashSet<String> =
                    result.conflicts.iter().map(|c| c.task_id.clone()).collect();
                for conflict in &result.conflicts {
                    controller.append_event(
                        EventType::MergeConflict,
                        EventPayload::MergeConflict(MergeConflictPayload {
                            batch_id,
                            task_id: conflict.task_id.clone(),
                            branch: conflict.branch.clone(),
                        }),
                    );
                    send_to_review(
                        controller,
                        &conflict.task_id,
                        "merge_conflict",
                        Some(format!("branch {} conflicts with the batch merge", conflict.branch)),
                    )
                    .await?;
                }
                candidates.retain(|id| !conflicted.contains(id));
            }
        }
    };

    let Some(merge) = merge else {
        finish_batch(controller, batch_id, BatchStatus::Failed, None, None).await?;
        controller.append_event(
            EventType::BatchFailed,
            EventPayload::BatchFailed(BatchFailedPayload {
                batch_id,
                reason: "all_branches_conflicted".to_string(),
            }),
        );
        return Ok(FinalizeOutcome {
            stop_reason: None,
            merged_tasks: Vec::new(),
        });
    };

    let merge_commit = merge
        .merge_commit
        .clone()
        .ok_or_else(|| eyre::eyre!("merged result without a merge commit"))?;
    let workdir = merge
        .workdir
        .clone()
        .ok_or_else(|| eyre::eyre!("merged result without a workdir"))?;
    let merged_ids: Vec<String> = merge.merged.iter().map(|m| m.task_id.clone()).collect();

    // Integration doctor, against the temp merge only.
    let mut doctor_ran = false;
    if let Some(doctor_cmd) = ctx.config.doctor.clone() {
        doctor_ran = true;
        run_doctor_canary(
            &doctor_cmd,
            &workdir,
            ctx.config.doctor_timeout_seconds,
            &ctx.config.doctor_canary,
        )
        .await?;
        let outcome = run_doctor(&doctor_cmd, &workdir, ctx.config.doctor_timeout_seconds, &[])
            .await?;
        controller.append_event(
            EventType::DoctorFinished,
            EventPayload::DoctorFinished(DoctorFinishedPayload {
                scope: "integration".to_string(),
                task_id: None,
                passed: outcome.passed,
                duration_ms: outcome.duration_ms,
            }),
        );
        if !outcome.passed {
            let detail = if outcome.timed_out {
                "integration doctor timed out".to_string()
            } else {
                format!("integration doctor failed: {}", outcome.output_tail)
            };
            ctx.vcs.discard_temp_merge(&ctx.config.repo_path, &workdir)?;
            for id in &merged_ids {
                send_to_review(controller, id, "integration_doctor_failed", Some(detail.clone()))
                    .await?;
            }
            finish_batch(controller, batch_id, BatchStatus::Failed, None, Some(false)).await?;
            controller.append_event(
                EventType::BatchFailed,
                EventPayload::BatchFailed(BatchFailedPayload {
                    batch_id,
                    reason: BatchStopReason::IntegrationDoctorFailed.as_str().to_string(),
                }),
            );
            return Ok(FinalizeOutcome {
                stop_reason: Some(BatchStopReason::IntegrationDoctorFailed),
                merged_tasks: Vec::new(),
            });
        }
    }

    if let Err(e) =
        ctx.vcs
            .fast_forward_main_to_merge(&ctx.config.repo_path, &ctx.config.main_branch, &merge_commit)
    {
        warn!(batch_id, error = %e, "fast-forward failed");
        ctx.vcs.discard_temp_merge(&ctx.config.repo_path, &workdir)?;
        for id in &merged_ids {
            send_to_review(controller, id, "fast_forward_failed", Some(e.to_string())).await?;
        }
        finish_batch(
            controller,
            batch_id,
            BatchStatus::Failed,
            None,
            doctor_ran.then_some(true),
        )
        .await?;
        controller.append_event(
            EventType::BatchFailed,
            EventPayload::BatchFailed(BatchFailedPayload {
                batch_id,
                reason: BatchStopReason::FastForwardFailed.as_str().to_string(),
            }),
        );
        return Ok(FinalizeOutcome {
            stop_reason: Some(BatchStopReason::FastForwardFailed),
            merged_tasks: Vec::new(),
        });
    }

    ctx.vcs.discard_temp_merge(&ctx.config.repo_path, &workdir)?;

    for id in &merged_ids {
        controller.transition_task(id, TaskStatus::Complete).await?;
    }
    finish_batch(
        controller,
        batch_id,
        BatchStatus::Complete,
        Some(merge_commit.clone()),
        doctor_ran.then_some(true),
    )
    .await?;
    controller.append_event(
        EventType::BatchMerged,
        EventPayload::BatchMerged(BatchMergedPayload {
            batch_id,
            merge_commit: merge_commit.clone(),
            merged_tasks: merged_ids.clone(),
            integration_doctor_passed: doctor_ran,
        }),
    );
    append_merge(
        &ctx.paths,
        &ctx.project,
        TaskLedgerEntry {
            merge_commit,
            run_id: run_id.clone(),
            batch_id,
            tasks: merged_ids.clone(),
            merged_at: Utc::now(),
        },
    )?;

    archive_and_cleanup(ctx, controller, &run_id, &merged_ids).await;

    info!(batch_id, merged = merged_ids.len(), "batch complete");
    Ok(FinalizeOutcome {
        stop_reason: None,
        merged_tasks: merged_ids,
    })
}

/// Move each merged task's directory to the run archive and release its
/// workspace and container. Failures here never un-complete a task.
async fn archive_and_cleanup(
    ctx: &Arc<EngineContext>,
    controller: &Arc<Controller>,
    run_id: &str,
    merged_ids: &[String],
) {
    for id in merged_ids {
        let Some(manifest) = ctx.catalog.get(id) else {
            continue;
        };
        let active = TaskCatalog::active_dir(&ctx.config.tasks_dir, manifest);
        if active.is_dir() {
            let archive = TaskCatalog::archive_dir(&ctx.config.tasks_dir, run_id, manifest);
            let moved = (|| -> std::io::Result<()> {
                if let Some(parent) = archive.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::rename(&active, &archive)
            })();
            if let Err(e) = moved {
                warn!(task_id = %id, error = %e, "task archive failed");
            }
        }

        if ctx.config.cleanup_workspaces_on_success {
            let workspace = controller
                .with_state(|s| s.tasks.get(id).and_then(|t| t.workspace.clone()))
                .await;
            if let Some(workspace) = workspace {
                if let Err(e) = ctx.vcs.remove_task_workspace(&ctx.config.repo_path, &workspace) {
                    warn!(task_id = %id, error = %e, "workspace cleanup failed");
                }
            }
        }
        if ctx.config.cleanup_containers_on_success {
            let input = worker_input(ctx, run_id, id, manifest);
            if let Err(e) = ctx.worker.cleanup_task(&input).await {
                warn!(task_id = %id, error = %e, "container cleanup failed");
            }
        }
    }
}

fn worker_input(
    ctx: &Arc<EngineContext>,
    run_id: &str,
    task_id: &str,
    manifest: &hive_core::TaskManifest,
) -> WorkerInput {
    WorkerInput {
        project: ctx.project.clone(),
        run_id: run_id.to_string(),
        task_id: task_id.to_string(),
        manifest: manifest.clone(),
        workspace_path: ctx.paths.task_workspace(&ctx.project, run_id, task_id),
        logs_dir: ctx
            .paths
            .task_logs_dir(&ctx.project, run_id, &manifest.dir_name()),
        task_events: TaskEventsLogger::new(ctx.paths.task_events_log(
            &ctx.project,
            run_id,
            &manifest.dir_name(),
        )),
    }
}

async fn send_to_review(
    controller: &Arc<Controller>,
    task_id: &str,
    reason: &str,
    detail: Option<String>,
) -> eyre::Result<()> {
    controller
        .mutate(|state| {
            if let Some(task) = state.tasks.get_mut(task_id) {
                task.human_review = Some(HumanReview {
                    reason: reason.to_string(),
                    created_at: Utc::now(),
                    detail: detail.clone(),
                });
                task.last_error = Some(reason.to_string());
            }
        })
        .await?;
    controller
        .transition_task(task_id, TaskStatus::NeedsHumanReview)
        .await?;
    Ok(())
}

async fn finish_batch(
    controller: &Arc<Controller>,
    batch_id: u32,
    status: BatchStatus,
    merge_commit: Option<String>,
    integration_doctor_passed: Option<bool>,
) -> eyre::Result<()> {
    controller
        .mutate(|state| {
            if let Some(batch) = state.batch_mut(batch_id) {
                batch.status = status;
                batch.merge_commit = merge_commit.clone();
                batch.integration_doctor_passed = integration_doctor_passed;
                batch.completed_at = Some(Utc::now());
            }
        })
        .await?;
    Ok(())
}
