//! VCS gateway over the mainline repository.
//!
//! All operations shell out to git. Workspaces are git worktrees checked
//! out on per-task branches; merges happen in the primary checkout, in
//! planner order, one merge commit per branch. The first conflict aborts
//! the in-progress merge and leaves mainline at the last successful merge.

use chrono::{DateTime, Utc};
use std::path::Path;
use std::process::Command;
use thiserror::Error;
use tracing::{debug, warn};

use mycelium_core::manifest::slugify;
use mycelium_core::types::CheckpointCommit;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("failed to execute git: {0}")]
    Execution(#[from] std::io::Error),
    #[error("invalid utf-8 in git output")]
    InvalidUtf8,
    #[error("dirty working tree: {0}")]
    DirtyWorkingTree(String),
}

pub type Result<T> = std::result::Result<T, GitError>;

/// Prefix for checkpoint commit subjects; `list_checkpoint_commits` walks
/// the branch head while subjects carry it.
const CHECKPOINT_SUBJECT_PREFIX: &str = "checkpoint: attempt ";

/// Deterministic task branch name: `<prefix>/<id>-<slug>`.
pub fn build_task_branch_name(prefix: &str, task_id: &str, task_name: &str) -> String {
    format!("{}/{}-{}", prefix, task_id, slugify(task_name))
}

/// A branch to merge, in planner order.
#[derive(Debug, Clone)]
pub struct MergeBranch {
    pub task_id: String,
    pub branch_name: String,
}

/// Result of merging a batch's branches onto mainline.
#[derive(Debug, Clone)]
pub enum MergeOutcome {
    /// Every branch merged; mainline advanced to `merge_commit`.
    Ok { merge_commit: String },
    /// The named branch conflicted. The in-progress merge was aborted and
    /// mainline left at the last successful merge (`merge_commit`, if any
    /// branch merged before the conflict).
    Conflict {
        task_id: String,
        branch_name: String,
        message: String,
        merge_commit: Option<String>,
    },
}

fn run_git(cwd: &Path, args: &[&str]) -> Result<std::process::Output> {
    debug!(args = ?args, cwd = %cwd.display(), "git");
    Ok(Command::new("git").args(args).current_dir(cwd).output()?)
}

fn git_expect(cwd: &Path, args: &[&str]) -> Result<String> {
    let output = run_git(cwd, args)?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::CommandFailed(format!(
            "git {}: {}",
            args.join(" "),
            stderr.trim()
        )));
    }
    String::from_utf8(output.stdout)
        .map(|s| s.trim().to_string())
        .map_err(|_| GitError::InvalidUtf8)
}

/// Detect the default branch for a repository.
///
/// Tries `origin/HEAD` first, then local `main`, then `master`.
pub fn detect_default_branch(repo_path: &Path) -> Result<String> {
    let output = run_git(repo_path, &["symbolic-ref", "refs/remotes/origin/HEAD"])?;
    if output.status.success() {
        let full_ref = String::from_utf8(output.stdout)
            .map_err(|_| GitError::InvalidUtf8)?
            .trim()
            .to_string();
        if let Some(branch) = full_ref.strip_prefix("refs/remotes/origin/") {
            return Ok(branch.to_string());
        }
    }

    for candidate in ["main", "master"] {
        let check = run_git(
            repo_path,
            &["rev-parse", "--verify", &format!("refs/heads/{candidate}")],
        )?;
        if check.status.success() {
            return Ok(candidate.to_string());
        }
    }

    Ok("main".to_string())
}

pub fn branch_exists(repo_path: &Path, branch: &str) -> Result<bool> {
    let output = run_git(
        repo_path,
        &["rev-parse", "--verify", &format!("refs/heads/{branch}")],
    )?;
    Ok(output.status.success())
}

pub fn create_branch(repo_path: &Path, branch: &str, base: &str) -> Result<()> {
    git_expect(repo_path, &["branch", branch, base]).map(|_| ())
}

pub fn current_branch(repo_path: &Path) -> Result<String> {
    git_expect(repo_path, &["branch", "--show-current"])
}

pub fn rev_parse_head(repo_path: &Path) -> Result<String> {
    git_expect(repo_path, &["rev-parse", "HEAD"])
}

pub fn checkout_branch(repo_path: &Path, branch: &str) -> Result<()> {
    git_expect(repo_path, &["checkout", branch]).map(|_| ())
}

/// Clean means no tracked modifications. Untracked files (the planner's
/// tasks directory, scratch output) never block a merge.
pub fn is_working_tree_clean(repo_path: &Path) -> Result<bool> {
    let stdout = git_expect(
        repo_path,
        &["status", "--porcelain", "--untracked-files=no"],
    )?;
    Ok(stdout.is_empty())
}

/// Result of preparing a workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrepareOutcome {
    pub created: bool,
}

/// Ensure `workspace_dir` is a worktree of `repo_path` with `task_branch`
/// checked out, creating the branch from `main_branch` if missing.
///
/// Idempotent: an existing workspace already on the task branch is reused
/// untouched (resume relies on this); one on the wrong branch is switched.
pub fn prepare_workspace(
    repo_path: &Path,
    main_branch: &str,
    task_branch: &str,
    workspace_dir: &Path,
) -> Result<PrepareOutcome> {
    if workspace_dir.join(".git").exists() {
        let current = current_branch(workspace_dir)?;
        if current == task_branch {
            return Ok(PrepareOutcome { created: false });
        }
        if !branch_exists(repo_path, task_branch)? {
            create_branch(repo_path, task_branch, main_branch)?;
        }
        checkout_branch(workspace_dir, task_branch)?;
        return Ok(PrepareOutcome { created: false });
    }

    if let Some(parent) = workspace_dir.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| GitError::CommandFailed(format!("create workspace parent: {e}")))?;
    }

    if !branch_exists(repo_path, task_branch)? {
        create_branch(repo_path, task_branch, main_branch)?;
    }

    git_expect(
        repo_path,
        &[
            "worktree",
            "add",
            workspace_dir.to_string_lossy().as_ref(),
            task_branch,
        ],
    )?;

    Ok(PrepareOutcome { created: true })
}

/// List files changed in the workspace relative to `base`, committed and
/// uncommitted work included, as sorted repo-relative POSIX paths.
pub fn list_changed_files(workspace_path: &Path, base: &str) -> Result<Vec<String>> {
    let diff = git_expect(workspace_path, &["diff", "--name-only", base])?;
    let untracked = git_expect(
        workspace_path,
        &["ls-files", "--others", "--exclude-standard"],
    )?;

    let mut files: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();
    for line in diff.lines().chain(untracked.lines()) {
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            files.insert(trimmed.to_string());
        }
    }
    Ok(files.into_iter().collect())
}

/// Merge the given branches onto `main_branch`, in list order, one merge
/// commit per branch. No re-ordering to maximise success: the first
/// conflict is final for the batch.
pub fn merge_task_branches(
    repo_path: &Path,
    main_branch: &str,
    branches: &[MergeBranch],
) -> Result<MergeOutcome> {
    if !is_working_tree_clean(repo_path)? {
        return Err(GitError::DirtyWorkingTree(
            "cannot merge with uncommitted changes in the primary checkout".to_string(),
        ));
    }
    checkout_branch(repo_path, main_branch)?;

    let mut last_merge_commit: Option<String> = None;
    for branch in branches {
        let message = format!("Merge task {} ({})", branch.task_id, branch.branch_name);
        let output = run_git(
            repo_path,
            &["merge", "--no-ff", "-m", &message, &branch.branch_name],
        )?;

        if !output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            let combined = format!("{stdout}{stderr}");
            if combined.contains("CONFLICT") || combined.contains("Automatic merge failed") {
                // Abort to leave mainline at the last successful merge.
                let _ = run_git(repo_path, &["merge", "--abort"]);
                warn!(
                    task_id = %branch.task_id,
                    branch = %branch.branch_name,
                    "merge conflict; batch merge aborted"
                );
                return Ok(MergeOutcome::Conflict {
                    task_id: branch.task_id.clone(),
                    branch_name: branch.branch_name.clone(),
                    message: combined.trim().to_string(),
                    merge_commit: last_merge_commit,
                });
            }
            return Err(GitError::CommandFailed(format!(
                "git merge {}: {}",
                branch.branch_name,
                combined.trim()
            )));
        }

        last_merge_commit = Some(rev_parse_head(repo_path)?);
    }

    match last_merge_commit {
        Some(merge_commit) => Ok(MergeOutcome::Ok { merge_commit }),
        // Nothing to merge is not a conflict; mainline is unchanged.
        None => Ok(MergeOutcome::Ok {
            merge_commit: rev_parse_head(repo_path)?,
        }),
    }
}

/// Commit the workspace diff as a checkpoint on the task branch.
///
/// Returns None when there is nothing to commit.
pub fn commit_checkpoint(workspace_path: &Path, attempt: u32) -> Result<Option<String>> {
    git_expect(workspace_path, &["add", "-A"])?;

    let staged = run_git(workspace_path, &["diff", "--cached", "--quiet"])?;
    if staged.status.success() {
        return Ok(None);
    }

    let message = format!("{CHECKPOINT_SUBJECT_PREFIX}{attempt}");
    git_expect(workspace_path, &["commit", "-m", &message])?;
    rev_parse_head(workspace_path).map(Some)
}

/// Read back the checkpoint commits the worker made on this branch, oldest
/// first. Walks the head of the branch while commit subjects carry the
/// checkpoint prefix.
pub fn list_checkpoint_commits(workspace_path: &Path) -> Result<Vec<CheckpointCommit>> {
    let log = git_expect(
        workspace_path,
        &["log", "--format=%H%x09%cI%x09%s", "HEAD"],
    )?;

    let mut commits = Vec::new();
    for line in log.lines() {
        let mut parts = line.splitn(3, '\t');
        let (Some(sha), Some(date), Some(subject)) = (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        let Some(attempt_str) = subject.strip_prefix(CHECKPOINT_SUBJECT_PREFIX) else {
            // First non-checkpoint commit ends the worker's run of commits.
            break;
        };
        let Ok(attempt) = attempt_str.trim().parse::<u32>() else {
            break;
        };
        let created_at = DateTime::parse_from_rfc3339(date)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());
        commits.push(CheckpointCommit {
            attempt,
            sha: sha.to_string(),
            created_at,
        });
    }

    commits.reverse();
    Ok(commits)
}

/// Remove a workspace worktree. Best-effort and idempotent: a missing
/// directory is success, and a failed `git worktree remove` falls back to
/// deleting the directory and pruning.
pub fn remove_workspace(repo_path: &Path, workspace_dir: &Path) {
    if !workspace_dir.exists() {
        return;
    }
    let removed = run_git(
        repo_path,
        &[
            "worktree",
            "remove",
            "--force",
            workspace_dir.to_string_lossy().as_ref(),
        ],
    )
    .map(|o| o.status.success())
    .unwrap_or(false);

    if !removed {
        if let Err(e) = std::fs::remove_dir_all(workspace_dir) {
            warn!(workspace = %workspace_dir.display(), error = %e, "failed to remove workspace");
        }
        let _ = run_git(repo_path, &["worktree", "prune"]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Create a test git repository with an initial commit.
    fn setup_test_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        for args in [
            vec!["init", "-b", "main"],
            vec!["config", "user.email", "test@test.com"],
            vec!["config", "user.name", "Test"],
        ] {
            Command::new("git")
                .args(&args)
                .current_dir(dir.path())
                .output()
                .unwrap();
        }
        std::fs::write(dir.path().join("README.md"), "# Test").unwrap();
        commit_all(dir.path(), "Initial commit");
        dir
    }

    fn commit_all(repo: &Path, message: &str) {
        Command::new("git")
            .args(["add", "."])
            .current_dir(repo)
            .output()
            .unwrap();
        Command::new("git")
            .args(["commit", "-m", message])
            .current_dir(repo)
            .output()
            .unwrap();
    }

    #[test]
    fn branch_name_is_prefix_id_slug() {
        assert_eq!(
            build_task_branch_name("mycelium", "001", "Cleanup Demo"),
            "mycelium/001-cleanup-demo"
        );
    }

    #[test]
    fn prepare_workspace_creates_worktree_and_branch() {
        let repo = setup_test_repo();
        let ws_root = TempDir::new().unwrap();
        let workspace = ws_root.path().join("ws-prepare");

        let outcome =
            prepare_workspace(repo.path(), "main", "mycelium/001-demo", &workspace).unwrap();
        assert!(outcome.created);
        assert!(workspace.exists());
        assert_eq!(current_branch(&workspace).unwrap(), "mycelium/001-demo");

        remove_workspace(repo.path(), &workspace);
    }

    #[test]
    fn prepare_workspace_is_idempotent() {
        let repo = setup_test_repo();
        let ws_root = TempDir::new().unwrap();
        let workspace = ws_root.path().join("ws-idem");

        let first =
            prepare_workspace(repo.path(), "main", "mycelium/002-demo", &workspace).unwrap();
        assert!(first.created);
        let second =
            prepare_workspace(repo.path(), "main", "mycelium/002-demo", &workspace).unwrap();
        assert!(!second.created);

        remove_workspace(repo.path(), &workspace);
    }

    #[test]
    fn list_changed_files_is_sorted_and_includes_untracked() {
        let repo = setup_test_repo();
        let ws_root = TempDir::new().unwrap();
        let workspace = ws_root.path().join("ws-changed");
        prepare_workspace(repo.path(), "main", "mycelium/003-demo", &workspace).unwrap();

        std::fs::write(workspace.join("zeta.txt"), "z").unwrap();
        std::fs::write(workspace.join("alpha.txt"), "a").unwrap();
        std::fs::write(workspace.join("README.md"), "# Changed").unwrap();

        let files = list_changed_files(&workspace, "main").unwrap();
        assert_eq!(files, vec!["README.md", "alpha.txt", "zeta.txt"]);

        remove_workspace(repo.path(), &workspace);
    }

    #[test]
    fn commit_and_list_checkpoints_round_trip() {
        let repo = setup_test_repo();
        let ws_root = TempDir::new().unwrap();
        let workspace = ws_root.path().join("ws-ckpt");
        prepare_workspace(repo.path(), "main", "mycelium/004-demo", &workspace).unwrap();

        assert!(commit_checkpoint(&workspace, 1).unwrap().is_none());

        std::fs::write(workspace.join("work.txt"), "v1").unwrap();
        let sha1 = commit_checkpoint(&workspace, 1).unwrap().unwrap();
        std::fs::write(workspace.join("work.txt"), "v2").unwrap();
        let sha2 = commit_checkpoint(&workspace, 2).unwrap().unwrap();

        let commits = list_checkpoint_commits(&workspace).unwrap();
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].attempt, 1);
        assert_eq!(commits[0].sha, sha1);
        assert_eq!(commits[1].attempt, 2);
        assert_eq!(commits[1].sha, sha2);

        remove_workspace(repo.path(), &workspace);
    }

    #[test]
    fn merge_task_branches_merges_in_order() {
        let repo = setup_test_repo();
        let ws_root = TempDir::new().unwrap();
        let ws_a = ws_root.path().join("ws-ma");
        let ws_b = ws_root.path().join("ws-mb");
        prepare_workspace(repo.path(), "main", "mycelium/00a", &ws_a).unwrap();
        prepare_workspace(repo.path(), "main", "mycelium/00b", &ws_b).unwrap();

        std::fs::write(ws_a.join("a.txt"), "a").unwrap();
        commit_checkpoint(&ws_a, 1).unwrap();
        std::fs::write(ws_b.join("b.txt"), "b").unwrap();
        commit_checkpoint(&ws_b, 1).unwrap();

        let outcome = merge_task_branches(
            repo.path(),
            "main",
            &[
                MergeBranch {
                    task_id: "a".to_string(),
                    branch_name: "mycelium/00a".to_string(),
                },
                MergeBranch {
                    task_id: "b".to_string(),
                    branch_name: "mycelium/00b".to_string(),
                },
            ],
        )
        .unwrap();

        let MergeOutcome::Ok { merge_commit } = outcome else {
            panic!("expected ok merge");
        };
        assert_eq!(rev_parse_head(repo.path()).unwrap(), merge_commit);
        assert!(repo.path().join("a.txt").exists());
        assert!(repo.path().join("b.txt").exists());

        remove_workspace(repo.path(), &ws_a);
        remove_workspace(repo.path(), &ws_b);
    }

    #[test]
    fn merge_conflict_aborts_and_reports_first_conflicting_task() {
        let repo = setup_test_repo();
        let ws_root = TempDir::new().unwrap();
        let ws_a = ws_root.path().join("ws-ca");
        let ws_b = ws_root.path().join("ws-cb");
        prepare_workspace(repo.path(), "main", "mycelium/0ca", &ws_a).unwrap();
        prepare_workspace(repo.path(), "main", "mycelium/0cb", &ws_b).unwrap();

        // Both branches rewrite the same line of the same file.
        std::fs::write(ws_a.join("README.md"), "# From A").unwrap();
        commit_checkpoint(&ws_a, 1).unwrap();
        std::fs::write(ws_b.join("README.md"), "# From B").unwrap();
        commit_checkpoint(&ws_b, 1).unwrap();

        let outcome = merge_task_branches(
            repo.path(),
            "main",
            &[
                MergeBranch {
                    task_id: "a".to_string(),
                    branch_name: "mycelium/0ca".to_string(),
                },
                MergeBranch {
                    task_id: "b".to_string(),
                    branch_name: "mycelium/0cb".to_string(),
                },
            ],
        )
        .unwrap();

        let MergeOutcome::Conflict {
            task_id,
            merge_commit,
            ..
        } = outcome
        else {
            panic!("expected conflict");
        };
        assert_eq!(task_id, "b");
        // Mainline sits at task a's merge and the tree is clean.
        assert_eq!(
            merge_commit.as_deref(),
            Some(rev_parse_head(repo.path()).unwrap().as_str())
        );
        assert!(is_working_tree_clean(repo.path()).unwrap());
        assert_eq!(
            std::fs::read_to_string(repo.path().join("README.md")).unwrap(),
            "# From A"
        );

        remove_workspace(repo.path(), &ws_a);
        remove_workspace(repo.path(), &ws_b);
    }

    #[test]
    fn remove_workspace_is_idempotent() {
        let repo = setup_test_repo();
        let ws_root = TempDir::new().unwrap();
        let workspace = ws_root.path().join("ws-rm");
        prepare_workspace(repo.path(), "main", "mycelium/0rm", &workspace).unwrap();

        remove_workspace(repo.path(), &workspace);
        assert!(!workspace.exists());
        // Second removal never raises.
        remove_workspace(repo.path(), &workspace);
    }

    #[test]
    fn detect_default_branch_finds_main() {
        let repo = setup_test_repo();
        assert_eq!(detect_default_branch(repo.path()).unwrap(), "main");
    }
}
