//! Control-plane integration hooks.
//!
//! The component graph, ownership index, and symbol index live outside the
//! engine; this module defines the read-only query contract the engine
//! consumes for scope derivation, and the lock-mode resolution that feeds
//! the scheduler.

use hive_core::config::{ControlPlaneConfig, LockMode};
use hive_core::{normalize_locks, NormalizedLocks, RawLocks, TaskManifest};
use serde::{Deserialize, Serialize};

/// Derived write scope for one task, produced by the control plane.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DerivedScopeReport {
    /// Resource names (components, surfaces) the task is expected to write.
    pub derived_write_resources: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derived_write_paths: Option<Vec<String>>,
    pub derived_locks: RawLocks,
    /// 0.0 – 1.0.
    pub confidence: f64,
    #[serde(default)]
    pub notes: Vec<String>,
}

/// Read-only scope-derivation hook.
pub trait ScopeOracle: Send + Sync {
    fn derive_task_write_scope(&self, manifest: &TaskManifest) -> DerivedScopeReport;
}

/// Effective lock set for a task under the configured lock mode.
///
/// Declared mode takes the manifest at its word. Derived mode asks the
/// oracle and falls back to the configured fallback resource when the oracle
/// returns nothing; the surface-lock overlay only applies here.
pub fn effective_locks(
    manifest: &TaskManifest,
    config: &ControlPlaneConfig,
    oracle: Option<&dyn ScopeOracle>,
) -> NormalizedLocks {
    match (config.lock_mode, oracle) {
        (LockMode::Derived, Some(oracle)) if config.enabled => {
            let report = oracle.derive_task_write_scope(manifest);
            let mut raw = report.derived_locks;
            if raw.reads.is_empty() && raw.writes.is_empty() {
                raw.writes.push(config.fallback_resource.clone());
            }
            if config.surface_locks_enabled {
                for surface in surface_overlay(manifest, config) {
                    raw.writes.push(surface);
                }
            }
            normalize_locks(&raw)
        }
        _ => normalize_locks(&manifest.locks),
    }
}

/// Surface locks for files the task declares it writes that match a
/// configured surface pattern. Matching is deliberately simple: a trailing
/// `**` makes the pattern a prefix, otherwise it must match exactly.
fn surface_overlay(manifest: &TaskManifest, config: &ControlPlaneConfig) -> Vec<String> {
    let mut out = Vec::new();
    for pattern in &config.surface_patterns {
        let matched = manifest.files.writes.iter().any(|path| {
            if let Some(prefix) = pattern.strip_suffix("**") {
                path.starts_with(prefix.trim_end_matches('/'))
            } else {
                path == pattern
            }
        });
        if matched {
            out.push(format!("surface:{pattern}"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest_with(writes: &[&str], file_writes: &[&str]) -> TaskManifest {
        TaskManifest {
            id: "001".to_string(),
            name: String::new(),
            spec: String::new(),
            dependencies: Vec::new(),
            locks: RawLocks {
                reads: Vec::new(),
                writes: writes.iter().map(|s| (*s).to_string()).collect(),
            },
            files: hive_core::manifest::FileScope {
                reads: Vec::new(),
                writes: file_writes.iter().map(|s| (*s).to_string()).collect(),
            },
            tdd_mode: hive_core::TddMode::Off,
            verify: hive_core::VerifySpec::default(),
            test_paths: Vec::new(),
            extra: serde_json::Map::new(),
        }
    }

    struct FixedOracle(RawLocks);

    impl ScopeOracle for FixedOracle {
        fn derive_task_write_scope(&self, _manifest: &TaskManifest) -> DerivedScopeReport {
            DerivedScopeReport {
                derived_locks: self.0.clone(),
                confidence: 0.9,
                ..DerivedScopeReport::default()
            }
        }
    }

    fn derived_config() -> ControlPlaneConfig {
        ControlPlaneConfig {
            enabled: true,
            lock_mode: LockMode::Derived,
            ..ControlPlaneConfig::default()
        }
    }

    #[test]
    fn declared_mode_uses_manifest_locks() {
        let manifest = manifest_with(&["db"], &[]);
        let config = ControlPlaneConfig::default();
        let oracle = FixedOracle(RawLocks {
            reads: Vec::new(),
            writes: vec!["component:x".to_string()],
        });
        let locks = effective_locks(&manifest, &config, Some(&oracle));
        assert_eq!(locks.writes, vec!["db"]);
    }

    #[test]
    fn derived_mode_uses_oracle_locks() {
        let manifest = manifest_with(&["db"], &[]);
        let config = derived_config();
        let oracle = FixedOracle(RawLocks {
            reads: Vec::new(),
            writes: vec!["component:x".to_string()],
        });
        let locks = effective_locks(&manifest, &config, Some(&oracle));
        assert_eq!(locks.writes, vec!["component:x"]);
    }

    #[test]
    fn derived_mode_falls_back_when_oracle_is_empty() {
        let manifest = manifest_with(&[], &[]);
        let config = derived_config();
        let oracle = FixedOracle(RawLocks::default());
        let locks = effective_locks(&manifest, &config, Some(&oracle));
        assert_eq!(locks.writes, vec!["repo"]);
    }

    #[test]
    fn derived_mode_without_oracle_degrades_to_declared() {
        let manifest = manifest_with(&["db"], &[]);
        let config = derived_config();
        let locks = effective_locks(&manifest, &config, None);
        assert_eq!(locks.writes, vec!["db"]);
    }

    #[test]
    fn surface_overlay_applies_only_in_derived_mode() {
        let manifest = manifest_with(&["db"], &["api/routes.rs"]);
        let mut config = derived_config();
        config.surface_locks_enabled = true;
        config.surface_patterns = vec!["api/**".to_string()];
        let oracle = FixedOracle(RawLocks {
            reads: Vec::new(),
            writes: vec!["component:api".to_string()],
        });

        let locks = effective_locks(&manifest, &config, Some(&oracle));
        assert!(locks.writes.contains(&"surface:api/**".to_string()));

        // Declared mode ignores the overlay even when enabled.
        config.lock_mode = LockMode::Declared;
        let locks = effective_locks(&manifest, &config, Some(&oracle));
        assert_eq!(locks.writes, vec!["db"]);
    }
}
