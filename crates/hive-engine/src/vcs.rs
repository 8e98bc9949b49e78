//! Version-control adapter.
//!
//! The engines consume the `Vcs` capability; `GitVcs` implements it by
//! shelling out to `git`. Task workspaces are independent worktrees sharing
//! the repository's object database. Integration merges happen in a detached
//! scratch worktree so `main` is never touched until the doctor passes.

use std::path::{Path, PathBuf};
use std::process::Command;

use hive_core::slugify;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum VcsError {
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("dirty working tree at {repo}: {listing}")]
    DirtyWorkingTree { repo: PathBuf, listing: String },
    #[error("fast-forward failed: {0}")]
    FastForwardFailed(String),
    #[error("failed to execute git: {0}")]
    Execution(#[from] std::io::Error),
    #[error("invalid utf-8 in git output")]
    InvalidUtf8,
}

pub type Result<T> = std::result::Result<T, VcsError>;

/// Outcome status of a temp-merge attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStatus {
    Merged,
    Conflict,
}

/// One branch to merge, with the task that owns it.
#[derive(Debug, Clone)]
pub struct MergeBranch {
    pub task_id: String,
    pub branch: String,
}

/// Temp-merge request. `branches` order is the merge order.
#[derive(Debug, Clone)]
pub struct MergeRequest {
    pub repo_path: PathBuf,
    pub main_branch: String,
    pub branches: Vec<MergeBranch>,
    /// Where the scratch worktree is created. Must not exist yet.
    pub workdir: PathBuf,
}

/// Result of a temp-merge attempt.
///
/// On `Merged`, `workdir` holds the merged tree (for the integration doctor)
/// and stays on disk until `discard_temp_merge` or a fast-forward. On
/// `Conflict` the scratch worktree is already gone; `conflicts` names the
/// offending branch and `merged` the branches merged before it. Nothing on
/// the main branch is mutated in either case.
#[derive(Debug, Clone)]
pub struct MergeResult {
    pub status: MergeStatus,
    pub merged: Vec<MergeBranch>,
    pub conflicts: Vec<MergeBranch>,
    pub merge_commit: Option<String>,
    pub workdir: Option<PathBuf>,
}

/// The version-control capability the engines depend on.
pub trait Vcs: Send + Sync {
    /// Fail with `DirtyWorkingTree` if any untracked or modified path exists.
    fn ensure_clean_working_tree(&self, repo: &Path) -> Result<()>;

    /// The commit SHA the run treats as its base; stable for the run's life.
    fn resolve_run_base_sha(&self, repo: &Path, main_branch: &str) -> Result<String>;

    /// Create the task's worktree with its branch checked out, creating the
    /// branch at `base_sha` if absent. Idempotent.
    fn create_task_workspace(
        &self,
        repo: &Path,
        workspace: &Path,
        branch: &str,
        base_sha: &str,
    ) -> Result<()>;

    fn remove_task_workspace(&self, repo: &Path, workspace: &Path) -> Result<()>;

    fn head_sha(&self, workspace: &Path) -> Result<String>;

    /// True iff `ancestor` is reachable from `descendant`.
    fn is_ancestor(&self, repo: &Path, ancestor: &str, descendant: &str) -> Result<bool>;

    /// Repo-relative paths changed between `base_ref` and the worktree HEAD.
    fn list_changed_files(&self, workspace: &Path, base_ref: &str) -> Result<Vec<String>>;

    /// Merge the listed task branches into a scratch worktree rooted at the
    /// current main tip. Stops at the first conflict.
    fn merge_task_branches(&self, request: &MergeRequest) -> Result<MergeResult>;

    /// Drop a scratch merge worktree; the merge commit becomes unreachable.
    fn discard_temp_merge(&self, repo: &Path, workdir: &Path) -> Result<()>;

    /// Advance `main_branch` to `merge_commit`. Precondition: the current
    /// main tip is an ancestor of `merge_commit`.
    fn fast_forward_main_to_merge(
        &self,
        repo: &Path,
        main_branch: &str,
        merge_commit: &str,
    ) -> Result<()>;

    /// Deterministic, filesystem-safe task branch name.
    fn build_task_branch_name(&self, prefix: &str, task_id: &str, task_name: &str) -> String;
}

/// Git implementation of [`Vcs`].
#[derive(Debug, Default, Clone)]
pub struct GitVcs;

impl GitVcs {
    pub fn new() -> Self {
        Self
    }

    fn run(dir: &Path, args: &[&str]) -> Result<String> {
        let output = Command::new("git").args(args).current_dir(dir).output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VcsError::CommandFailed(format!(
                "git {}: {}",
                args.join(" "),
                stderr.trim()
            )));
        }
        String::from_utf8(output.stdout)
            .map(|s| s.trim().to_string())
            .map_err(|_| VcsError::InvalidUtf8)
    }

    fn branch_exists(repo: &Path, branch: &str) -> Result<bool> {
        let output = Command::new("git")
            .args(["rev-parse", "--verify", &format!("refs/heads/{branch}")])
            .current_dir(repo)
            .output()?;
        Ok(output.status.success())
    }

    fn remove_worktree(repo: &Path, workdir: &Path) -> Result<()> {
        Self::run(
            repo,
            &[
                "worktree",
                "remove",
                "--force",
                workdir.to_string_lossy().as_ref(),
            ],
        )?;
        Ok(())
    }
}

impl Vcs for GitVcs {
    fn ensure_clean_working_tree(&self, repo: &Path) -> Result<()> {
        let listing = Self::run(repo, &["status", "--porcelain"])?;
        if listing.is_empty() {
            Ok(())
        } else {
            Err(VcsError::DirtyWorkingTree {
                repo: repo.to_path_buf(),
                listing,
            })
        }
    }

    fn resolve_run_base_sha(&self, repo: &Path, main_branch: &str) -> Result<String> {
        Self::run(repo, &["rev-parse", &format!("refs/heads/{main_branch}")])
    }

    fn create_task_workspace(
        &self,
        repo: &Path,
        workspace: &Path,
        branch: &str,
        base_sha: &str,
    ) -> Result<()> {
        if workspace.join(".git").exists() {
            // Already prepared by a previous attempt.
            return Ok(());
        }
        if let Some(parent) = workspace.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let workspace_str = workspace.to_string_lossy();
        if Self::branch_exists(repo, branch)? {
            Self::run(repo, &["worktree", "add", workspace_str.as_ref(), branch])?;
        } else {
            Self::run(
                repo,
                &[
                    "worktree",
                    "add",
                    "-b",
                    branch,
                    workspace_str.as_ref(),
                    base_sha,
                ],
            )?;
        }
        debug!(workspace = %workspace.display(), branch, "task workspace created");
        Ok(())
    }

    fn remove_task_workspace(&self, repo: &Path, workspace: &Path) -> Result<()> {
        Self::remove_worktree(repo, workspace)
    }

    fn head_sha(&self, workspace: &Path) -> Result<String> {
        Self::run(workspace, &["rev-parse", "HEAD"])
    }

    fn is_ancestor(&self, repo: &Path, ancestor: &str, descendant: &str) -> Result<bool> {
        let output = Command::new("git")
            .args(["merge-base", "--is-ancestor", ancestor, descendant])
            .current_dir(repo)
            .output()?;
        Ok(output.status.success())
    }

    fn list_changed_files(&self, workspace: &Path, base_ref: &str) -> Result<Vec<String>> {
        let listing = Self::run(
            workspace,
            &["diff", "--name-only", &format!("{base_ref}..HEAD")],
        )?;
        Ok(listing
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    fn merge_task_branches(&self, request: &MergeRequest) -> Result<MergeResult> {
        let repo = &request.repo_path;
        let main_tip = self.resolve_run_base_sha(repo, &request.main_branch)?;

        if let Some(parent) = request.workdir.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let workdir_str = request.workdir.to_string_lossy();
        Self::run(
            repo,
            &["worktree", "add", "--detach", workdir_str.as_ref(), &main_tip],
        )?;

        let mut merged = Vec::new();
        for entry in &request.branches {
            let output = Command::new("git")
                .args(["merge", "--no-ff", "--no-edit", &entry.branch])
                .current_dir(&request.workdir)
                .output()?;
            if output.status.success() {
                merged.push(entry.clone());
                continue;
            }
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            let conflicted = stdout.contains("CONFLICT")
                || stderr.contains("CONFLICT")
                || stdout.contains("Automatic merge failed")
                || stderr.contains("Automatic merge failed");
            // Leave the repo clean either way.
            let _ = Command::new("git")
                .args(["merge", "--abort"])
                .current_dir(&request.workdir)
                .output();
            Self::remove_worktree(repo, &request.workdir)?;
            if conflicted {
                warn!(branch = %entry.branch, task_id = %entry.task_id, "merge conflict");
                return Ok(MergeResult {
                    status: MergeStatus::Conflict,
                    merged,
                    conflicts: vec![entry.clone()],
                    merge_commit: None,
                    workdir: None,
                });
            }
            return Err(VcsError::CommandFailed(format!(
                "git merge {}: {}",
                entry.branch,
                stderr.trim()
            )));
        }

        let merge_commit = self.head_sha(&request.workdir)?;
        Ok(MergeResult {
            status: MergeStatus::Merged,
            merged,
            conflicts: Vec::new(),
            merge_commit: Some(merge_commit),
            workdir: Some(request.workdir.clone()),
        })
    }

    fn discard_temp_merge(&self, repo: &Path, workdir: &Path) -> Result<()> {
        Self::remove_worktree(repo, workdir)?;
        let _ = Self::run(repo, &["worktree", "prune"]);
        Ok(())
    }

    fn fast_forward_main_to_merge(
        &self,
        repo: &Path,
        main_branch: &str,
        merge_commit: &str,
    ) -> Result<()> {
        let main_tip = self.resolve_run_base_sha(repo, main_branch)?;
        if !self.is_ancestor(repo, &main_tip, merge_commit)? {
            return Err(VcsError::FastForwardFailed(format!(
                "{main_branch} tip {main_tip} is not an ancestor of {merge_commit}"
            )));
        }
        self.ensure_clean_working_tree(repo)?;
        Self::run(repo, &["checkout", main_branch])?;
        Self::run(repo, &["merge", "--ff-only", merge_commit])
            .map_err(|e| VcsError::FastForwardFailed(e.to_string()))?;
        let new_tip = Self::run(repo, &["rev-parse", "HEAD"])?;
        if new_tip != merge_commit {
            return Err(VcsError::FastForwardFailed(format!(
                "expected {merge_commit}, found {new_tip}"
            )));
        }
        Ok(())
    }

    fn build_task_branch_name(&self, prefix: &str, task_id: &str, task_name: &str) -> String {
        let mut slug = slugify(task_name);
        slug.truncate(48);
        let slug = slug.trim_end_matches('-');
        if slug.is_empty() {
            format!("{prefix}{task_id}")
        } else {
            format!("{prefix}{task_id}-{slug}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn git(dir: &Path, args: &[&str]) {
        let status = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap();
        assert!(
            status.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&status.stderr)
        );
    }

    /// Returns `(repo, scratch)`; scratch holds worktrees so the repo's own
    /// working tree stays clean.
    fn setup_test_repo() -> (TempDir, TempDir) {
        let dir = TempDir::new().unwrap();
        git(dir.path(), &["init", "-b", "main"]);
        git(dir.path(), &["config", "user.email", "test@test.com"]);
        git(dir.path(), &["config", "user.name", "Test"]);
        std::fs::write(dir.path().join("README.md"), "# Test").unwrap();
        git(dir.path(), &["add", "."]);
        git(dir.path(), &["commit", "-m", "Initial commit"]);
        (dir, TempDir::new().unwrap())
    }

    fn commit_file(workdir: &Path, name: &str, content: &str, message: &str) {
        std::fs::write(workdir.join(name), content).unwrap();
        git(workdir, &["add", "."]);
        git(workdir, &["commit", "-m", message]);
    }

    #[test]
    fn clean_tree_guard() {
        let (dir, _scratch) = setup_test_repo();
        let vcs = GitVcs::new();
        vcs.ensure_clean_working_tree(dir.path()).unwrap();

        std::fs::write(dir.path().join("untracked.txt"), "x").unwrap();
        let err = vcs.ensure_clean_working_tree(dir.path()).unwrap_err();
        assert!(matches!(err, VcsError::DirtyWorkingTree { .. }));
    }

    #[test]
    fn base_sha_resolves_main_tip() {
        let (dir, _scratch) = setup_test_repo();
        let vcs = GitVcs::new();
        let base = vcs.resolve_run_base_sha(dir.path(), "main").unwrap();
        assert_eq!(base.len(), 40);
    }

    #[test]
    fn task_workspace_is_idempotent() {
        let (dir, scratch) = setup_test_repo();
        let vcs = GitVcs::new();
        let base = vcs.resolve_run_base_sha(dir.path(), "main").unwrap();
        let ws = scratch.path().join("ws-task-001");

        vcs.create_task_workspace(dir.path(), &ws, "task/001", &base)
            .unwrap();
        assert!(ws.join("README.md").exists());
        // Second call is a no-op.
        vcs.create_task_workspace(dir.path(), &ws, "task/001", &base)
            .unwrap();
        assert_eq!(vcs.head_sha(&ws).unwrap(), base);

        vcs.remove_task_workspace(dir.path(), &ws).unwrap();
        assert!(!ws.exists());
    }

    #[test]
    fn changed_files_against_base() {
        let (dir, scratch) = setup_test_repo();
        let vcs = GitVcs::new();
        let base = vcs.resolve_run_base_sha(dir.path(), "main").unwrap();
        let ws = scratch.path().join("ws-changed");
        vcs.create_task_workspace(dir.path(), &ws, "task/001", &base)
            .unwrap();
        commit_file(&ws, "src.txt", "hello", "add src");

        let changed = vcs.list_changed_files(&ws, &base).unwrap();
        assert_eq!(changed, vec!["src.txt"]);
        vcs.remove_task_workspace(dir.path(), &ws).unwrap();
    }

    #[test]
    fn merge_two_disjoint_branches_then_fast_forward() {
        let (dir, scratch) = setup_test_repo();
        let vcs = GitVcs::new();
        let base = vcs.resolve_run_base_sha(dir.path(), "main").unwrap();
        let parent = scratch.path();

        for (branch, file) in [("task/001", "a.txt"), ("task/002", "b.txt")] {
            let ws = parent.join(format!("ws-{}", file));
            vcs.create_task_workspace(dir.path(), &ws, branch, &base)
                .unwrap();
            commit_file(&ws, file, "content", "change");
            vcs.remove_task_workspace(dir.path(), &ws).unwrap();
        }

        let result = vcs
            .merge_task_branches(&MergeRequest {
                repo_path: dir.path().to_path_buf(),
                main_branch: "main".to_string(),
                branches: vec![
                    MergeBranch {
                        task_id: "001".to_string(),
                        branch: "task/001".to_string(),
                    },
                    MergeBranch {
                        task_id: "002".to_string(),
                        branch: "task/002".to_string(),
                    },
                ],
                workdir: parent.join("integration-1"),
            })
            .unwrap();

        assert_eq!(result.status, MergeStatus::Merged);
        assert_eq!(result.merged.len(), 2);
        let merge_commit = result.merge_commit.clone().unwrap();
        let workdir = result.workdir.clone().unwrap();
        assert!(workdir.join("a.txt").exists());
        assert!(workdir.join("b.txt").exists());

        // Main is untouched until the fast-forward.
        assert_eq!(vcs.resolve_run_base_sha(dir.path(), "main").unwrap(), base);
        vcs.fast_forward_main_to_merge(dir.path(), "main", &merge_commit)
            .unwrap();
        assert_eq!(
            vcs.resolve_run_base_sha(dir.path(), "main").unwrap(),
            merge_commit
        );
        assert!(vcs.is_ancestor(dir.path(), &base, &merge_commit).unwrap());
        vcs.discard_temp_merge(dir.path(), &workdir).unwrap();
    }

    #[test]
    fn merge_conflict_names_offending_branch_and_leaves_main_alone() {
        let (dir, scratch) = setup_test_repo();
        let vcs = GitVcs::new();
        let base = vcs.resolve_run_base_sha(dir.path(), "main").unwrap();
        let parent = scratch.path();

        // Both branches rewrite the same file differently.
        for (branch, content) in [("task/001", "one"), ("task/002", "two")] {
            let ws = parent.join(format!("ws-{}", content));
            vcs.create_task_workspace(dir.path(), &ws, branch, &base)
                .unwrap();
            commit_file(&ws, "shared.txt", content, "change shared");
            vcs.remove_task_workspace(dir.path(), &ws).unwrap();
        }

        let result = vcs
            .merge_task_branches(&MergeRequest {
                repo_path: dir.path().to_path_buf(),
                main_branch: "main".to_string(),
                branches: vec![
                    MergeBranch {
                        task_id: "001".to_string(),
                        branch: "task/001".to_string(),
                    },
                    MergeBranch {
                        task_id: "002".to_string(),
                        branch: "task/002".to_string(),
                    },
                ],
                workdir: parent.join("integration-conflict"),
            })
            .unwrap();

        assert_eq!(result.status, MergeStatus::Conflict);
        assert_eq!(result.merged.len(), 1);
        assert_eq!(result.conflicts.len(), 1);
        assert_eq!(result.conflicts[0].task_id, "002");
        assert!(result.workdir.is_none());
        // Scratch worktree already removed; main unchanged.
        assert!(!parent.join("integration-conflict").exists());
        assert_eq!(vcs.resolve_run_base_sha(dir.path(), "main").unwrap(), base);
    }

    #[test]
    fn fast_forward_rejects_non_descendant() {
        let (dir, _scratch) = setup_test_repo();
        let vcs = GitVcs::new();
        let base = vcs.resolve_run_base_sha(dir.path(), "main").unwrap();

        // Advance main past the base, then try to fast-forward to the old tip.
        commit_file(dir.path(), "new.txt", "x", "advance main");
        let err = vcs
            .fast_forward_main_to_merge(dir.path(), "main", &base)
            .unwrap_err();
        assert!(matches!(err, VcsError::FastForwardFailed(_)));
    }

    #[test]
    fn branch_names_are_deterministic_and_safe() {
        let vcs = GitVcs::new();
        assert_eq!(
            vcs.build_task_branch_name("task/", "001", "Add the Parser!"),
            "task/001-add-the-parser"
        );
        assert_eq!(vcs.build_task_branch_name("task/", "002", ""), "task/002");
        let long = "x".repeat(100);
        let name = vcs.build_task_branch_name("task/", "003", &long);
        assert!(name.len() <= "task/003-".len() + 48);
    }
}
