//! Per-task workspace lifecycle.
//!
//! A workspace is a git worktree at a deterministic path under the run
//! directory, checked out on the task's branch. The worker reads the task
//! manifest and spec from a copy of the tasks subtree inside the workspace,
//! so the canonical paths stay stable even while the task directory moves
//! between stages.

use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

use crate::git;
use crate::paths::{copy_tree, RunPaths};

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("git error: {0}")]
    Git(#[from] git::GitError),
    #[error("failed to copy tasks subtree: {0}")]
    CopyTasks(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WorkspaceError>;

#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    repo_path: PathBuf,
    paths: RunPaths,
}

impl WorkspaceManager {
    pub fn new(repo_path: impl Into<PathBuf>, paths: RunPaths) -> Self {
        Self {
            repo_path: repo_path.into(),
            paths,
        }
    }

    /// Deterministic workspace directory for a task.
    pub fn workspace_dir(&self, task_dir_name: &str) -> PathBuf {
        self.paths.workspace_dir(task_dir_name)
    }

    /// Prepare the workspace worktree on the task branch. Idempotent.
    pub fn prepare(
        &self,
        task_dir_name: &str,
        main_branch: &str,
        task_branch: &str,
    ) -> Result<PathBuf> {
        let workspace_dir = self.workspace_dir(task_dir_name);
        let outcome =
            git::prepare_workspace(&self.repo_path, main_branch, task_branch, &workspace_dir)?;
        if outcome.created {
            info!(
                workspace = %workspace_dir.display(),
                branch = %task_branch,
                "workspace created"
            );
        }
        Ok(workspace_dir)
    }

    /// Copy the task's directory from the tasks root into the workspace so
    /// the worker reads canonical manifest/spec paths.
    ///
    /// Returns the workspace-relative directory of the copied task.
    pub fn copy_task_subtree(
        &self,
        workspace_dir: &Path,
        tasks_dir: &Path,
        task_relative_dir: &Path,
    ) -> Result<PathBuf> {
        let tasks_dir_name = tasks_dir
            .file_name()
            .map_or_else(|| PathBuf::from("tasks"), PathBuf::from);
        let relative = tasks_dir_name.join(task_relative_dir);
        let source = tasks_dir.join(task_relative_dir);
        let target = workspace_dir.join(&relative);
        copy_tree(&source, &target)?;
        Ok(relative)
    }

    /// Remove the workspace. Idempotent and best-effort; never raises if
    /// the directory has already been removed.
    pub fn remove(&self, task_dir_name: &str) {
        let workspace_dir = self.workspace_dir(task_dir_name);
        git::remove_workspace(&self.repo_path, &workspace_dir);
    }
}
