//! Lock algebra for batch scheduling.
//!
//! A lock set names the resources a task reads and writes. A write implies a
//! read, so normalization folds every write into the read set. Two sets
//! conflict iff one's writes intersect the other's reads or writes.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Raw lock declaration as it appears in a task manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLocks {
    #[serde(default)]
    pub reads: Vec<String>,
    #[serde(default)]
    pub writes: Vec<String>,
}

/// Deduplicated, sorted lock set with `reads ⊇ writes`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedLocks {
    pub reads: Vec<String>,
    pub writes: Vec<String>,
}

impl NormalizedLocks {
    pub fn is_empty(&self) -> bool {
        self.reads.is_empty() && self.writes.is_empty()
    }

    /// Pairwise conflict predicate: `writes_A ∩ (reads_B ∪ writes_B) ≠ ∅`
    /// or the symmetric case.
    pub fn conflicts_with(&self, other: &NormalizedLocks) -> bool {
        intersects(&self.writes, &other.reads)
            || intersects(&self.writes, &other.writes)
            || intersects(&other.writes, &self.reads)
    }

    /// Union of two lock sets, used to accumulate a batch's footprint.
    pub fn merge(&self, other: &NormalizedLocks) -> NormalizedLocks {
        let reads: BTreeSet<&String> = self.reads.iter().chain(&other.reads).collect();
        let writes: BTreeSet<&String> = self.writes.iter().chain(&other.writes).collect();
        NormalizedLocks {
            reads: reads.into_iter().cloned().collect(),
            writes: writes.into_iter().cloned().collect(),
        }
    }
}

/// Both inputs are sorted; walk them like a merge step.
fn intersects(a: &[String], b: &[String]) -> bool {
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Equal => return true,
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
        }
    }
    false
}

/// Normalize a raw declaration: dedupe, sort, and fold writes into reads.
pub fn normalize_locks(raw: &RawLocks) -> NormalizedLocks {
    let writes: BTreeSet<String> = raw.writes.iter().cloned().collect();
    let mut reads: BTreeSet<String> = raw.reads.iter().cloned().collect();
    reads.extend(writes.iter().cloned());
    NormalizedLocks {
        reads: reads.into_iter().collect(),
        writes: writes.into_iter().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(reads: &[&str], writes: &[&str]) -> RawLocks {
        RawLocks {
            reads: reads.iter().map(|s| (*s).to_string()).collect(),
            writes: writes.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    #[test]
    fn normalize_folds_writes_into_reads() {
        let locks = normalize_locks(&raw(&["a"], &["b", "a"]));
        assert_eq!(locks.reads, vec!["a", "b"]);
        assert_eq!(locks.writes, vec!["a", "b"]);
    }

    #[test]
    fn normalize_dedupes_and_sorts() {
        let locks = normalize_locks(&raw(&["z", "a", "z"], &[]));
        assert_eq!(locks.reads, vec!["a", "z"]);
        assert!(locks.writes.is_empty());
    }

    #[test]
    fn writer_conflicts_with_reader() {
        let a = normalize_locks(&raw(&[], &["src/lib.rs"]));
        let b = normalize_locks(&raw(&["src/lib.rs"], &[]));
        assert!(a.conflicts_with(&b));
        assert!(b.conflicts_with(&a));
    }

    #[test]
    fn writer_conflicts_with_writer() {
        let a = normalize_locks(&raw(&[], &["db"]));
        let b = normalize_locks(&raw(&[], &["db"]));
        assert!(a.conflicts_with(&b));
    }

    #[test]
    fn readers_never_conflict() {
        let a = normalize_locks(&raw(&["db", "api"], &[]));
        let b = normalize_locks(&raw(&["db", "api"], &[]));
        assert!(!a.conflicts_with(&b));
    }

    #[test]
    fn disjoint_writers_do_not_conflict() {
        let a = normalize_locks(&raw(&[], &["src/a.rs"]));
        let b = normalize_locks(&raw(&[], &["src/b.rs"]));
        assert!(!a.conflicts_with(&b));
    }

    #[test]
    fn merge_unions_both_sides() {
        let a = normalize_locks(&raw(&["r1"], &["w1"]));
        let b = normalize_locks(&raw(&["r2"], &["w2"]));
        let merged = a.merge(&b);
        assert_eq!(merged.reads, vec!["r1", "r2", "w1", "w2"]);
        assert_eq!(merged.writes, vec!["w1", "w2"]);
    }
}
