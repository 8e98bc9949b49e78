//! Token budget accounting.
//!
//! Usage events streamed from worker attempts are folded into the run state;
//! breaches of the per-task ceiling are evaluated against the configured
//! budget mode by the task engine.

use hive_core::{AttemptUsage, BudgetsConfig, EnforcementMode, RunState};
use serde::{Deserialize, Serialize};

use crate::worker::UsageEvent;

/// Roll-up after recording a batch of usage events.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub task_tokens_used: u64,
    pub task_estimated_cost: f64,
    pub run_tokens_used: u64,
    pub run_estimated_cost: f64,
}

/// One budget ceiling a task crossed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetBreach {
    pub task_id: String,
    pub tokens_used: u64,
    pub max_tokens_per_task: u64,
    pub mode: EnforcementMode,
}

/// Result of a breach evaluation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BreachReport {
    pub breaches: Vec<BudgetBreach>,
}

impl BreachReport {
    pub fn is_blocking(&self) -> bool {
        self.breaches
            .iter()
            .any(|b| b.mode == EnforcementMode::Block)
    }
}

/// Fold usage events for one attempt into the run state.
///
/// Accumulates the task's `usage_by_attempt` entry for `attempt` and the
/// task- and run-level token/cost totals.
pub fn record_usage_updates(
    state: &mut RunState,
    task_id: &str,
    attempt: u32,
    events: &[UsageEvent],
) -> Option<BudgetSnapshot> {
    let task = state.tasks.get_mut(task_id)?;

    let mut tokens = 0u64;
    let mut cost = 0f64;
    for event in events {
        tokens += event.input_tokens + event.output_tokens;
        cost += event.estimated_cost;
    }

    match task
        .usage_by_attempt
        .iter_mut()
        .find(|u| u.attempt == attempt)
    {
        Some(entry) => {
            entry.input_tokens += events.iter().map(|e| e.input_tokens).sum::<u64>();
            entry.output_tokens += events.iter().map(|e| e.output_tokens).sum::<u64>();
            entry.estimated_cost += cost;
        }
        None => task.usage_by_attempt.push(AttemptUsage {
            attempt,
            input_tokens: events.iter().map(|e| e.input_tokens).sum(),
            output_tokens: events.iter().map(|e| e.output_tokens).sum(),
            estimated_cost: cost,
        }),
    }

    task.tokens_used += tokens;
    task.estimated_cost += cost;
    let task_tokens_used = task.tokens_used;
    let task_estimated_cost = task.estimated_cost;

    state.tokens_used += tokens;
    state.estimated_cost += cost;

    Some(BudgetSnapshot {
        task_tokens_used,
        task_estimated_cost,
        run_tokens_used: state.tokens_used,
        run_estimated_cost: state.estimated_cost,
    })
}

/// Evaluate the per-task ceiling for one task's snapshot.
pub fn evaluate_breaches(
    task_id: &str,
    snapshot: &BudgetSnapshot,
    config: &BudgetsConfig,
) -> BreachReport {
    let mut report = BreachReport::default();
    if config.max_tokens_per_task > 0 && snapshot.task_tokens_used > config.max_tokens_per_task {
        report.breaches.push(BudgetBreach {
            task_id: task_id.to_string(),
            tokens_used: snapshot.task_tokens_used,
            max_tokens_per_task: config.max_tokens_per_task,
            mode: config.mode,
        });
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_core::TaskState;

    fn state_with_task(task_id: &str) -> RunState {
        let mut state = RunState::new("demo", "r1", "/repo", "main", "abc");
        state.tasks.insert(task_id.to_string(), TaskState::new());
        state
    }

    fn event(input: u64, output: u64, cost: f64) -> UsageEvent {
        UsageEvent {
            input_tokens: input,
            output_tokens: output,
            estimated_cost: cost,
        }
    }

    #[test]
    fn usage_accumulates_per_task_and_run() {
        let mut state = state_with_task("001");
        let snapshot =
            record_usage_updates(&mut state, "001", 1, &[event(100, 50, 0.25)]).unwrap();
        assert_eq!(snapshot.task_tokens_used, 150);
        assert_eq!(snapshot.run_tokens_used, 150);

        let snapshot =
            record_usage_updates(&mut state, "001", 2, &[event(10, 5, 0.05)]).unwrap();
        assert_eq!(snapshot.task_tokens_used, 165);
        assert_eq!(state.tasks["001"].usage_by_attempt.len(), 2);
    }

    #[test]
    fn same_attempt_merges_into_one_entry() {
        let mut state = state_with_task("001");
        record_usage_updates(&mut state, "001", 1, &[event(10, 0, 0.0)]).unwrap();
        record_usage_updates(&mut state, "001", 1, &[event(5, 5, 0.0)]).unwrap();
        let usage = &state.tasks["001"].usage_by_attempt;
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].total_tokens(), 20);
    }

    #[test]
    fn unknown_task_records_nothing() {
        let mut state = state_with_task("001");
        assert!(record_usage_updates(&mut state, "999", 1, &[event(1, 1, 0.0)]).is_none());
        assert_eq!(state.tokens_used, 0);
    }

    #[test]
    fn breach_requires_ceiling_crossed() {
        let config = BudgetsConfig {
            max_tokens_per_task: 100,
            mode: EnforcementMode::Block,
        };
        let under = BudgetSnapshot {
            task_tokens_used: 100,
            task_estimated_cost: 0.0,
            run_tokens_used: 100,
            run_estimated_cost: 0.0,
        };
        assert!(evaluate_breaches("001", &under, &config).breaches.is_empty());

        let over = BudgetSnapshot {
            task_tokens_used: 101,
            ..under
        };
        let report = evaluate_breaches("001", &over, &config);
        assert_eq!(report.breaches.len(), 1);
        assert!(report.is_blocking());
    }

    #[test]
    fn warn_mode_breach_is_not_blocking() {
        let config = BudgetsConfig {
            max_tokens_per_task: 10,
            mode: EnforcementMode::Warn,
        };
        let snapshot = BudgetSnapshot {
            task_tokens_used: 50,
            task_estimated_cost: 0.0,
            run_tokens_used: 50,
            run_estimated_cost: 0.0,
        };
        let report = evaluate_breaches("001", &snapshot, &config);
        assert_eq!(report.breaches.len(), 1);
        assert!(!report.is_blocking());
    }

    #[test]
    fn zero_ceiling_disables_budget() {
        let config = BudgetsConfig::default();
        let snapshot = BudgetSnapshot {
            task_tokens_used: u64::MAX,
            task_estimated_cost: 0.0,
            run_tokens_used: u64::MAX,
            run_estimated_cost: 0.0,
        };
        assert!(evaluate_breaches("001", &snapshot, &config).breaches.is_empty());
    }
}
