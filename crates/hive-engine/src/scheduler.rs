//! Batch scheduling: dependency-ready candidates and greedy lock-safe
//! selection.
//!
//! The scheduler is pure. `locks_for` lets the run engine swap declared locks
//! for derived ones without touching the algorithm.

use std::collections::BTreeMap;

use hive_core::manifest::{TaskCatalog, TaskManifest};
use hive_core::{normalize_locks, NormalizedLocks, TaskState, TaskStatus};

/// Effective lock set for one task.
pub type LocksFor<'a> = dyn Fn(&TaskManifest) -> NormalizedLocks + 'a;

/// Result of one greedy selection pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSelection {
    /// Accepted task ids, in candidate order.
    pub batch: Vec<String>,
    /// Candidates deferred to a later batch.
    pub remaining: Vec<String>,
}

/// Pending tasks whose dependencies are all satisfied, in id order.
pub fn ready_candidates(
    tasks: &BTreeMap<String, TaskState>,
    catalog: &TaskCatalog,
) -> Vec<String> {
    let mut out = Vec::new();
    for (id, state) in tasks {
        if state.status != TaskStatus::Pending {
            continue;
        }
        let Some(manifest) = catalog.get(id) else {
            continue;
        };
        let ready = manifest.dependencies.iter().all(|dep| {
            tasks
                .get(dep)
                .is_some_and(|d| d.status.satisfies_dependency())
        });
        if ready {
            out.push(id.clone());
        }
    }
    out
}

/// Pending tasks with at least one dependency in a blocking status, with the
/// offending edges. Used for the paused-run report.
pub fn blocked_tasks(
    tasks: &BTreeMap<String, TaskState>,
    catalog: &TaskCatalog,
) -> Vec<(String, Vec<String>)> {
    let mut out = Vec::new();
    for (id, state) in tasks {
        if state.status != TaskStatus::Pending {
            continue;
        }
        let Some(manifest) = catalog.get(id) else {
            continue;
        };
        let unmet: Vec<String> = manifest
            .dependencies
            .iter()
            .filter(|dep| {
                tasks
                    .get(dep.as_str())
                    .is_some_and(|d| d.status.blocks_dependents())
            })
            .cloned()
            .collect();
        if !unmet.is_empty() {
            out.push((id.clone(), unmet));
        }
    }
    out
}

/// Greedy batch selection.
///
/// Iterates candidates in input order; a candidate is accepted when its lock
/// set does not conflict with any already-accepted task's. Stops at
/// `max_parallel`. Input order is authoritative; `ready_candidates` already
/// breaks ties by lexicographic task id.
pub fn build_greedy_batch(
    candidates: &[String],
    catalog: &TaskCatalog,
    max_parallel: usize,
    locks_for: &LocksFor<'_>,
) -> BatchSelection {
    let mut batch = Vec::new();
    let mut remaining = Vec::new();
    let mut footprint = NormalizedLocks::default();

    for id in candidates {
        let Some(manifest) = catalog.get(id) else {
            continue;
        };
        if batch.len() >= max_parallel {
            remaining.push(id.clone());
            continue;
        }
        let locks = locks_for(manifest);
        if locks.conflicts_with(&footprint) {
            remaining.push(id.clone());
            continue;
        }
        footprint = footprint.merge(&locks);
        batch.push(id.clone());
    }

    BatchSelection { batch, remaining }
}

/// Default `locks_for`: the manifest's declared locks, normalized.
pub fn declared_locks(manifest: &TaskManifest) -> NormalizedLocks {
    normalize_locks(&manifest.locks)
}

/// Combined footprint of a selected batch, recorded in batch state.
pub fn batch_locks(
    batch: &[String],
    catalog: &TaskCatalog,
    locks_for: &LocksFor<'_>,
) -> NormalizedLocks {
    batch
        .iter()
        .filter_map(|id| catalog.get(id))
        .fold(NormalizedLocks::default(), |acc, m| acc.merge(&locks_for(m)))
}
