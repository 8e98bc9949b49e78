//! Task manifests and catalog loading.
//!
//! A task catalog is a directory tree: `tasks_dir/active/<id>-<slug>/task.yaml`
//! holds one manifest per task directory. Completed tasks are archived by the
//! engine to `tasks_dir/archive/run-<run_id>/<id>-<slug>`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::locks::RawLocks;
use crate::types::slugify;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse manifest {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("duplicate task id: {0}")]
    DuplicateId(String),
    #[error("task {task} depends on unknown task {dep}")]
    UnknownDependency { task: String, dep: String },
    #[error("task id may not be empty")]
    EmptyId,
}

pub type Result<T> = std::result::Result<T, ManifestError>;

/// Test-driven mode for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TddMode {
    #[default]
    Off,
    Strict,
}

impl TddMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Strict => "strict",
        }
    }
}

/// Verification commands declared by a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifySpec {
    /// Full verification command; exit 0 means pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doctor: Option<String>,
    /// Cheaper subset used mid-attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fast: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lint: Option<String>,
}

/// Declared file footprint of a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileScope {
    #[serde(default)]
    pub reads: Vec<String>,
    #[serde(default)]
    pub writes: Vec<String>,
}

/// One task's immutable input record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskManifest {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub spec: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub locks: RawLocks,
    #[serde(default)]
    pub files: FileScope,
    #[serde(default)]
    pub tdd_mode: TddMode,
    #[serde(default)]
    pub verify: VerifySpec,
    #[serde(default)]
    pub test_paths: Vec<String>,
    /// Unknown manifest keys, preserved for forward compatibility.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TaskManifest {
    /// Directory name for this task under `active/` and `archive/`.
    pub fn dir_name(&self) -> String {
        let slug = if self.name.is_empty() {
            "task".to_string()
        } else {
            slugify(&self.name)
        };
        format!("{}-{}", self.id, slug)
    }
}

/// The immutable set of tasks a run executes.
#[derive(Debug, Clone, Default)]
pub struct TaskCatalog {
    tasks: BTreeMap<String, TaskManifest>,
}

impl TaskCatalog {
    /// Build a catalog from manifests, validating ids and dependency edges.
    pub fn new(manifests: Vec<TaskManifest>) -> Result<Self> {
        let mut tasks = BTreeMap::new();
        for manifest in manifests {
            if manifest.id.is_empty() {
                return Err(ManifestError::EmptyId);
            }
            if tasks.contains_key(&manifest.id) {
                return Err(ManifestError::DuplicateId(manifest.id));
            }
            tasks.insert(manifest.id.clone(), manifest);
        }
        for manifest in tasks.values() {
            for dep in &manifest.dependencies {
                if !tasks.contains_key(dep) {
                    return Err(ManifestError::UnknownDependency {
                        task: manifest.id.clone(),
                        dep: dep.clone(),
                    });
                }
            }
        }
        Ok(Self { tasks })
    }

    /// Load every `active/<dir>/task.yaml` under `tasks_dir`.
    pub fn load(tasks_dir: &Path) -> Result<Self> {
        let active = tasks_dir.join("active");
        let mut manifests = Vec::new();
        if active.is_dir() {
            let mut entries: Vec<PathBuf> = std::fs::read_dir(&active)?
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_dir())
                .collect();
            entries.sort();
            for dir in entries {
                let path = dir.join("task.yaml");
                if !path.is_file() {
                    continue;
                }
                let content = std::fs::read_to_string(&path)?;
                let manifest: TaskManifest = serde_yaml::from_str(&content)
                    .map_err(|source| ManifestError::Parse { path, source })?;
                manifests.push(manifest);
            }
        }
        Self::new(manifests)
    }

    pub fn get(&self, id: &str) -> Option<&TaskManifest> {
        self.tasks.get(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &String> {
        self.tasks.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &TaskManifest)> {
        self.tasks.iter()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Path of a task's active directory under `tasks_dir`.
    pub fn active_dir(tasks_dir: &Path, manifest: &TaskManifest) -> PathBuf {
        tasks_dir.join("active").join(manifest.dir_name())
    }

    /// Path of a task's archive directory for a run.
    pub fn archive_dir(tasks_dir: &Path, run_id: &str, manifest: &TaskManifest) -> PathBuf {
        tasks_dir
            .join("archive")
            .join(format!("run-{run_id}"))
            .join(manifest.dir_name())
    }
}
