//! Single-writer state controller.
//!
//! Every mutation of `RunState` happens through the controller: transitions
//! are checked against the task transition table, applied under one lock,
//! and persisted before control returns to the caller. A store failure is
//! fatal; continuing with stale in-memory state is never an option.

use chrono::Utc;
use hive_core::events::{EventPayload, EventType};
use hive_core::{RunState, RunStatus, TaskStatus};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;

use crate::journal::Journal;
use crate::state_store::{StateStore, StateStoreError};

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("unknown task: {0}")]
    UnknownTask(String),
    #[error("invalid task transition for {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: &'static str,
        to: &'static str,
    },
    #[error("state store failure: {0}")]
    Store(#[from] StateStoreError),
}

pub type Result<T> = std::result::Result<T, ControllerError>;

/// Owns the run state, its snapshot store, and the orchestrator journal.
#[derive(Debug)]
pub struct Controller {
    state: Mutex<RunState>,
    store: StateStore,
    journal: Journal,
}

impl Controller {
    pub fn new(state: RunState, store: StateStore, journal: Journal) -> Self {
        Self {
            state: Mutex::new(state),
            store,
            journal,
        }
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Clone of the current state, for read-only inspection.
    pub async fn snapshot(&self) -> RunState {
        self.state.lock().await.clone()
    }

    /// Read something out of the state without cloning all of it.
    pub async fn with_state<R>(&self, f: impl FnOnce(&RunState) -> R) -> R {
        let state = self.state.lock().await;
        f(&state)
    }

    /// Apply an arbitrary mutation and persist.
    pub async fn mutate<R>(&self, f: impl FnOnce(&mut RunState) -> R) -> Result<R> {
        let mut state = self.state.lock().await;
        let out = f(&mut state);
        self.store.save(&mut state)?;
        Ok(out)
    }

    /// Persist the current state unchanged (used after initial construction).
    pub async fn persist(&self) -> Result<()> {
        self.mutate(|_| ()).await
    }

    /// Guarded task status transition.
    ///
    /// Entering `running` counts an attempt and clears stale validator
    /// results; entering `complete` stamps `completed_at`. Reverting to
    /// `pending` preserves `attempts`.
    pub async fn transition_task(&self, task_id: &str, next: TaskStatus) -> Result<()> {
        self.try_mutate(|state| {
            let task = state
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| ControllerError::UnknownTask(task_id.to_string()))?;
            if !task.status.can_transition_to(next) {
                return Err(ControllerError::InvalidTransition {
                    task_id: task_id.to_string(),
                    from: task.status.as_str(),
                    to: next.as_str(),
                });
            }
            match next {
                TaskStatus::Running => {
                    task.attempts += 1;
                    task.validator_results.clear();
                }
                TaskStatus::Complete => {
                    task.completed_at = Some(Utc::now());
                }
                _ => {}
            }
            task.status = next;
            Ok(())
        })
        .await
    }

    /// Set the run status and persist.
    pub async fn set_run_status(&self, status: RunStatus) -> Result<()> {
        self.mutate(|state| {
            state.status = status;
        })
        .await
    }

    /// Best-effort journal append. The journal is observability, not the
    /// source of truth; a failed append is logged and dropped.
    pub fn append_event(&self, event: EventType, payload: EventPayload) {
        if let Err(e) = self.journal.append(event, payload) {
            warn!(event = event.as_str(), error = %e, "journal append failed");
        }
    }

    async fn try_mutate<R>(
        &self,
        f: impl FnOnce(&mut RunState) -> Result<R>,
    ) -> Result<R> {
        let mut state = self.state.lock().await;
        let out = f(&mut state)?;
        self.store.save(&mut state)?;
        Ok(out)
    }
}
