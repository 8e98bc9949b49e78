//! Run lifecycle.
//!
//! Resolves or resumes the run state, then loops: pick the next
//! lock-safe batch of dependency-ready tasks, dispatch it, finalize it, and
//! re-evaluate. Pauses when blocked dependencies make progress impossible,
//! honors the stop signal between batches, and ends with a terminal status,
//! a summary report, and a history entry.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use hive_core::events::{
    BlockedTask, EventPayload, EventType, RunFinishedPayload, RunPausedPayload, RunStartedPayload,
    RunStoppedPayload, UnmetDep,
};
use hive_core::manifest::TaskCatalog;
use hive_core::{
    new_run_id, BatchStatus, PathsContext, RunConfig, RunState, RunStatus, TaskManifest,
    TaskState, TaskStatus,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::batch_engine::{finalize_batch, run_batch, BatchStopReason, InterruptedInfo};
use crate::compliance::CompliancePipeline;
use crate::control_plane::{effective_locks, ScopeOracle};
use crate::controller::Controller;
use crate::history::{append_run, RunIndexEntry};
use crate::journal::Journal;
use crate::scheduler::{batch_locks, blocked_tasks, build_greedy_batch, ready_candidates};
use crate::state_store::{find_latest_run_id, StateStore};
use crate::validator::ValidatorRunner;
use crate::vcs::Vcs;
use crate::worker::WorkerRunner;

/// Everything a run needs: configuration, paths, the task catalog, and the
/// injected capabilities.
pub struct EngineContext {
    pub project: String,
    pub config: RunConfig,
    pub paths: PathsContext,
    pub catalog: TaskCatalog,
    pub vcs: Arc<dyn Vcs>,
    pub worker: Arc<dyn WorkerRunner>,
    pub validators: Arc<dyn ValidatorRunner>,
    pub compliance: Arc<dyn CompliancePipeline>,
    pub scope_oracle: Option<Arc<dyn ScopeOracle>>,
    /// Polled between batches and between task dispatches.
    pub stop: CancellationToken,
    /// When the stop signal fires, also stop worker containers.
    pub kill_containers_on_stop: bool,
    /// Resume the latest (or named) persisted run instead of starting fresh.
    pub resume: bool,
    pub run_id: Option<String>,
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("project", &self.project)
            .field("config", &self.config)
            .field("resume", &self.resume)
            .field("run_id", &self.run_id)
            .finish_non_exhaustive()
    }
}

/// Stop-signal roll-up returned to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct StoppedRecord {
    pub stopped: usize,
    pub errors: usize,
    /// `"stopped"` or `"left"`.
    pub containers: String,
}

/// What the run engine hands back.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub status: RunStatus,
    pub stopped: Option<StoppedRecord>,
}

/// End-of-run roll-up written to `summary.json` in the run's log directory.
#[derive(Debug, Serialize)]
struct RunSummary {
    run_id: String,
    project: String,
    status: RunStatus,
    started_at: chrono::DateTime<Utc>,
    finished_at: chrono::DateTime<Utc>,
    duration_ms: i64,
    tasks_total: usize,
    tasks_by_status: BTreeMap<String, usize>,
    batches_total: usize,
    batches_complete: usize,
    batches_failed: usize,
    merge_commits: Vec<String>,
    tokens_used: u64,
    estimated_cost: f64,
}

/// Execute (or resume) a run to a terminal, paused, or stopped state.
pub async fn run(ctx: EngineContext) -> eyre::Result<RunOutcome> {
    let ctx = Arc::new(ctx);
    let (state, resumed) = resolve_run_state(&ctx)?;
    let run_id = state.run_id.clone();

    // A terminal run stays terminal: no worker, no VCS write.
    if state.status.is_terminal() {
        info!(run_id = %run_id, status = state.status.as_str(), "run already terminal");
        return Ok(RunOutcome {
            run_id,
            status: state.status,
            stopped: None,
        });
    }

    let store = StateStore::new(&ctx.paths, &ctx.project, &run_id);
    let journal = Journal::new(ctx.paths.orchestrator_log(&ctx.project, &run_id));
    let controller = Arc::new(Controller::new(state, store, journal));

    if resumed {
        let reset = reset_running_tasks(&controller).await?;
        if reset > 0 {
            info!(run_id = %run_id, reset, "reverted interrupted tasks to pending");
        }
    }
    controller.set_run_status(RunStatus::Running).await?;

    let (base_sha, task_count) = controller
        .with_state(|s| (s.base_sha.clone(), s.tasks.len()))
        .await;
    controller.append_event(
        if resumed {
            EventType::RunResumed
        } else {
            EventType::RunStarted
        },
        EventPayload::RunStarted(RunStartedPayload {
            run_id: run_id.clone(),
            project: ctx.project.clone(),
            base_sha,
            task_count,
        }),
    );

    let oracle = ctx.scope_oracle.clone();
    let control_plane = ctx.config.control_plane.clone();
    let locks_for = move |manifest: &TaskManifest| {
        effective_locks(manifest, &control_plane, oracle.as_deref())
    };

    let mut budget_blocked = false;
    let mut fatal: Option<BatchStopReason> = None;

    loop {
        if ctx.stop.is_cancelled() {
            return finish_stopped(
                &ctx,
                &controller,
                &run_id,
                InterruptedInfo {
                    in_flight: 0,
                    errors: 0,
                    containers_stopped: false,
                },
            )
            .await;
        }

        let snapshot = controller.snapshot().await;
        let candidates = ready_candidates(&snapshot.tasks, &ctx.catalog);

        if candidates.is_empty() {
            let any_pending = snapshot
                .tasks
                .values()
                .any(|t| t.status == TaskStatus::Pending);
            if !any_pending {
                break;
            }
            let blocked = blocked_tasks(&snapshot.tasks, &ctx.catalog);
            if blocked.is_empty() {
                // Pending tasks wait on dependencies that can no longer make
                // progress in this run (e.g. stranded by an interrupted
                // batch). Terminal determination classifies this as failed.
                warn!(run_id = %run_id, "no schedulable work and no blocked dependencies");
                break;
            }
            return finish_paused(&ctx, &controller, &run_id, &snapshot, blocked).await;
        }

        let selection =
            build_greedy_batch(&candidates, &ctx.catalog, ctx.config.max_parallel, &locks_for);
        let batch_id = controller.with_state(RunState::next_batch_id).await;
        let locks = batch_locks(&selection.batch, &ctx.catalog, &locks_for);

        let outcome = run_batch(&ctx, &controller, batch_id, &selection.batch, locks).await?;
        if let Some(info) = outcome.interrupted {
            controller
                .mutate(|state| {
                    if let Some(batch) = state.batch_mut(batch_id) {
                        batch.status = BatchStatus::Failed;
                        batch.completed_at = Some(Utc::now());
                    }
                })
                .await?;
            return finish_stopped(&ctx, &controller, &run_id, info).await;
        }

        budget_blocked |= outcome.results.iter().any(|r| r.budget_blocked);

        let finalize = finalize_batch(&ctx, &controller, batch_id, &outcome.results).await?;
        if let Some(reason) = finalize.stop_reason {
            fatal = Some(reason);
            break;
        }
    }

    let snapshot = controller.snapshot().await;
    let all_success = snapshot
        .tasks
        .values()
        .all(|t| t.status.is_success_terminal());
    let any_batch_failed = snapshot
        .batches
        .iter()
        .any(|b| b.status == BatchStatus::Failed);
    let status = if fatal.is_some() || budget_blocked || any_batch_failed || !all_success {
        RunStatus::Failed
    } else {
        RunStatus::Complete
    };
    controller.set_run_status(status).await?;
    controller.append_event(
        if status == RunStatus::Complete {
            EventType::RunCompleted
        } else {
            EventType::RunFailed
        },
        EventPayload::RunFinished(RunFinishedPayload {
            run_id: run_id.clone(),
            status,
            reason: fatal.map(|r| r.as_str().to_string()).or_else(|| {
                budget_blocked.then(|| "budget_breached".to_string())
            }),
        }),
    );

    let final_state = controller.snapshot().await;
    write_summary(&ctx, &final_state);
    let tasks_complete = final_state
        .tasks
        .values()
        .filter(|t| t.status == TaskStatus::Complete)
        .count();
    if let Err(e) = append_run(
        &ctx.paths,
        &ctx.project,
        RunIndexEntry {
            run_id: run_id.clone(),
            status,
            started_at: final_state.started_at,
            finished_at: Utc::now(),
            tasks_total: final_state.tasks.len(),
            tasks_complete,
            tokens_used: final_state.tokens_used,
            estimated_cost: final_state.estimated_cost,
        },
    ) {
        warn!(run_id = %run_id, error = %e, "history append failed");
    }

    info!(run_id = %run_id, status = status.as_str(), "run finished");
    Ok(RunOutcome {
        run_id,
        status,
        stopped: None,
    })
}

/// Load the run to resume, or create a fresh one from the catalog.
fn resolve_run_state(ctx: &Arc<EngineContext>) -> eyre::Result<(RunState, bool)> {
    if ctx.resume {
        let run_id = match ctx.run_id.clone() {
            Some(run_id) => run_id,
            None => find_latest_run_id(&ctx.paths, &ctx.project)?
                .ok_or_else(|| eyre::eyre!("no persisted run to resume for {}", ctx.project))?,
        };
        let store = StateStore::new(&ctx.paths, &ctx.project, &run_id);
        let state = store.load()?;
        return Ok((state, true));
    }

    if ctx.catalog.is_empty() {
        eyre::bail!("task catalog is empty");
    }
    ctx.vcs.ensure_clean_working_tree(&ctx.config.repo_path)?;
    let base_sha = ctx
        .vcs
        .resolve_run_base_sha(&ctx.config.repo_path, &ctx.config.main_branch)?;
    let run_id = ctx.run_id.clone().unwrap_or_else(new_run_id);
    let mut state = RunState::new(
        ctx.project.clone(),
        run_id,
        ctx.config.repo_path.clone(),
        ctx.config.main_branch.clone(),
        base_sha,
    );
    for id in ctx.catalog.ids() {
        state.tasks.insert(id.clone(), TaskState::new());
    }
    if ctx.config.control_plane.enabled {
        state.control_plane = serde_json::to_value(&ctx.config.control_plane).ok();
    }
    Ok((state, false))
}

/// Crash-recovery contract: every `running` task reverts to `pending` with
/// its attempts preserved; every `running` batch is failed with a synthetic
/// completion time. Returns the number of reverted tasks.
pub async fn reset_running_tasks(controller: &Arc<Controller>) -> eyre::Result<usize> {
    let running: Vec<String> = controller
        .with_state(|state| {
            state
                .tasks
                .iter()
                .filter(|(_, t)| t.status == TaskStatus::Running)
                .map(|(id, _)| id.clone())
                .collect()
        })
        .await;
    for id in &running {
        controller.transition_task(id, TaskStatus::Pending).await?;
    }
    controller
        .mutate(|state| {
            for batch in &mut state.batches {
                if batch.status == BatchStatus::Running {
                    batch.status = BatchStatus::Failed;
                    batch.completed_at = Some(Utc::now());
                }
            }
        })
        .await?;
    Ok(running.len())
}

async fn finish_paused(
    ctx: &Arc<EngineContext>,
    controller: &Arc<Controller>,
    run_id: &str,
    snapshot: &RunState,
    blocked: Vec<(String, Vec<String>)>,
) -> eyre::Result<RunOutcome> {
    let blocked_listing: Vec<BlockedTask> = blocked
        .into_iter()
        .map(|(task_id, deps)| BlockedTask {
            task_id,
            unmet_deps: deps
                .into_iter()
                .map(|dep_id| {
                    let dep = snapshot.tasks.get(&dep_id);
                    UnmetDep {
                        dep_status: dep.map_or(TaskStatus::Failed, |d| d.status),
                        dep_last_error: dep.and_then(|d| d.last_error.clone()),
                        dep_id,
                    }
                })
                .collect(),
        })
        .collect();

    warn!(
        run_id = %run_id,
        blocked = blocked_listing.len(),
        "pausing: blocked dependencies"
    );
    controller.append_event(
        EventType::RunPaused,
        EventPayload::RunPaused(RunPausedPayload {
            run_id: run_id.to_string(),
            reason: "blocked_dependencies".to_string(),
            blocked_tasks: blocked_listing,
        }),
    );
    controller.set_run_status(RunStatus::Paused).await?;
    let final_state = controller.snapshot().await;
    write_summary(ctx, &final_state);
    Ok(RunOutcome {
        run_id: run_id.to_string(),
        status: RunStatus::Paused,
        stopped: None,
    })
}

async fn finish_stopped(
    ctx: &Arc<EngineContext>,
    controller: &Arc<Controller>,
    run_id: &str,
    info: InterruptedInfo,
) -> eyre::Result<RunOutcome> {
    let record = StoppedRecord {
        stopped: info.in_flight,
        errors: info.errors,
        containers: if info.containers_stopped {
            "stopped".to_string()
        } else {
            "left".to_string()
        },
    };
    controller.append_event(
        EventType::RunStopped,
        EventPayload::RunStopped(RunStoppedPayload {
            run_id: run_id.to_string(),
            stopped: record.stopped,
            errors: record.errors,
            containers: record.containers.clone(),
        }),
    );
    controller.set_run_status(RunStatus::Paused).await?;
    let final_state = controller.snapshot().await;
    write_summary(ctx, &final_state);
    info!(run_id = %run_id, stopped = record.stopped, "run stopped");
    Ok(RunOutcome {
        run_id: run_id.to_string(),
        status: RunStatus::Paused,
        stopped: Some(record),
    })
}

fn write_summary(ctx: &Arc<EngineContext>, state: &RunState) {
    let mut tasks_by_status: BTreeMap<String, usize> = BTreeMap::new();
    for task in state.tasks.values() {
        *tasks_by_status
            .entry(task.status.as_str().to_string())
            .or_default() += 1;
    }
    let finished_at = Utc::now();
    let summary = RunSummary {
        run_id: state.run_id.clone(),
        project: state.project.clone(),
        status: state.status,
        started_at: state.started_at,
        finished_at,
        duration_ms: (finished_at - state.started_at).num_milliseconds(),
        tasks_total: state.tasks.len(),
        tasks_by_status,
        batches_total: state.batches.len(),
        batches_complete: state
            .batches
            .iter()
            .filter(|b| b.status == BatchStatus::Complete)
            .count(),
        batches_failed: state
            .batches
            .iter()
            .filter(|b| b.status == BatchStatus::Failed)
            .count(),
        merge_commits: state
            .batches
            .iter()
            .filter_map(|b| b.merge_commit.clone())
            .collect(),
        tokens_used: state.tokens_used,
        estimated_cost: state.estimated_cost,
    };
    let path = ctx
        .paths
        .run_logs_dir(&ctx.project, &state.run_id)
        .join("summary.json");
    let written = (|| -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, serde_json::to_vec_pretty(&summary).unwrap_or_default())
    })();
    if let Err(e) = written {
        warn!(path = %path.display(), error = %e, "summary write failed");
    }
}
