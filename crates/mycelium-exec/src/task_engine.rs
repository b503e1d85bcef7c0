//! Per-task orchestration: stage moves, workspace prep, worker attempts.
//!
//! One engine instance serves the whole run. Stage-directory renames are
//! serialised on an in-process lock on the tasks root so concurrent
//! attempts never race on the filesystem.

use mycelium_core::config::ProjectConfig;
use mycelium_core::events::{OrchestratorEvent, TaskOutcomePayload, TaskStageMovePayload};
use mycelium_core::manifest::{TaskSpec, TaskStage};
use mycelium_core::types::{TaskStatus, UsageTotals};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::git;
use crate::logs::{LogError, OrchestratorLog, TaskLog};
use crate::paths::RunPaths;
use crate::policy;
use crate::state::{SharedState, StateError};
use crate::worker::{WorkerInputs, WorkerLocalState, WorkerRunner};
use crate::workspace::{WorkspaceError, WorkspaceManager};

#[derive(Debug, Error)]
pub enum TaskEngineError {
    #[error("state error: {0}")]
    State(#[from] StateError),
    #[error("workspace error: {0}")]
    Workspace(#[from] WorkspaceError),
    #[error("worker error: {0}")]
    Worker(#[from] crate::worker::WorkerError),
    #[error("log error: {0}")]
    Log(#[from] LogError),
    #[error("policy error: {0}")]
    Policy(#[from] policy::PolicyError),
    #[error("failed to move task directory {from} -> {to}: {source}")]
    StageMove {
        from: String,
        to: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, TaskEngineError>;

/// Outcome of one attempt, consumed by the batch engine.
#[derive(Debug, Clone)]
pub struct TaskAttemptOutcome {
    pub task_id: String,
    pub success: bool,
    pub error_message: Option<String>,
    pub reset_to_pending: bool,
    pub usage: UsageTotals,
}

pub struct TaskEngine {
    config: Arc<ProjectConfig>,
    paths: RunPaths,
    workspaces: WorkspaceManager,
    shared: Arc<SharedState>,
    orchestrator_log: Arc<OrchestratorLog>,
    /// Serialises renames under the tasks root.
    stage_lock: Mutex<()>,
    cancel: CancellationToken,
    /// Debug hook forwarded to the worker; used by resume tests.
    pub crash_after_start: bool,
}

impl TaskEngine {
    pub fn new(
        config: Arc<ProjectConfig>,
        paths: RunPaths,
        shared: Arc<SharedState>,
        orchestrator_log: Arc<OrchestratorLog>,
        cancel: CancellationToken,
    ) -> Self {
        let workspaces = WorkspaceManager::new(config.repo_path.clone(), paths.clone());
        Self {
            config,
            paths,
            workspaces,
            shared,
            orchestrator_log,
            stage_lock: Mutex::new(()),
            cancel,
            crash_after_start: false,
        }
    }

    fn tasks_root(&self) -> PathBuf {
        self.config.repo_path.join(&self.config.tasks_dir)
    }

    /// Move a backlog task into the active stage. Tasks already active or
    /// legacy stay where they are.
    pub fn ensure_task_active_stage(&self, spec: &mut TaskSpec) -> Result<()> {
        if spec.stage != TaskStage::Backlog {
            return Ok(());
        }
        let _guard = self.stage_lock.lock().expect("stage lock poisoned");

        let from = self.tasks_root().join("backlog").join(&spec.dir_name);
        let to_dir = self.tasks_root().join("active");
        let to = to_dir.join(&spec.dir_name);
        std::fs::create_dir_all(&to_dir).map_err(|source| TaskEngineError::StageMove {
            from: from.display().to_string(),
            to: to.display().to_string(),
            source,
        })?;
        std::fs::rename(&from, &to).map_err(|source| TaskEngineError::StageMove {
            from: from.display().to_string(),
            to: to.display().to_string(),
            source,
        })?;
        spec.stage = TaskStage::Active;

        self.orchestrator_log
            .emit(&OrchestratorEvent::TaskStageMove(TaskStageMovePayload {
                task_id: spec.id().to_string(),
                from: "backlog".to_string(),
                to: "active".to_string(),
            }));
        info!(task_id = %spec.id(), "task moved backlog -> active");
        Ok(())
    }

    /// Move a completed task's directory into `archive/<run_id>`.
    pub fn archive_task(&self, spec: &TaskSpec, run_id: &str) -> Result<()> {
        let _guard = self.stage_lock.lock().expect("stage lock poisoned");

        let from = self.tasks_root().join(spec.relative_dir());
        if !from.exists() {
            // Already archived by an earlier pass.
            return Ok(());
        }
        let to_dir = self.tasks_root().join("archive").join(run_id);
        let to = to_dir.join(&spec.dir_name);
        std::fs::create_dir_all(&to_dir).map_err(|source| TaskEngineError::StageMove {
            from: from.display().to_string(),
            to: to.display().to_string(),
            source,
        })?;
        std::fs::rename(&from, &to).map_err(|source| TaskEngineError::StageMove {
            from: from.display().to_string(),
            to: to.display().to_string(),
            source,
        })?;

        self.orchestrator_log
            .emit(&OrchestratorEvent::TaskStageMove(TaskStageMovePayload {
                task_id: spec.id().to_string(),
                from: spec.stage.as_str().to_string(),
                to: format!("archive/{run_id}"),
            }));
        Ok(())
    }

    /// Run one fresh attempt of a task.
    pub async fn run_task_attempt(&self, spec: &mut TaskSpec) -> Result<TaskAttemptOutcome> {
        self.ensure_task_active_stage(spec)?;
        self.attempt(spec, false).await
    }

    /// Re-enter a task that was `running` when a prior process died. The
    /// workspace and branch are preserved, so the worker resumes its thread.
    pub async fn resume_running_task(&self, spec: &mut TaskSpec) -> Result<TaskAttemptOutcome> {
        self.attempt(spec, true).await
    }

    async fn attempt(&self, spec: &TaskSpec, resume: bool) -> Result<TaskAttemptOutcome> {
        let task_id = spec.id().to_string();
        let branch = git::build_task_branch_name(
            &self.config.task_branch_prefix,
            &task_id,
            &spec.manifest.name,
        );

        // Policy decision fixes the effective doctor command for this attempt.
        let decision = policy::decide(&self.config, &spec.manifest);
        let reports_dir = self.paths.reports_dir(&task_id);
        policy::write_report(&reports_dir.join("policy.json"), &decision)?;
        policy::write_report(&reports_dir.join("checkset.json"), &decision)?;

        let main_branch = self.main_branch();
        let workspace_path = self
            .workspaces
            .prepare(&spec.dir_name, &main_branch, &branch)?;
        let task_relative_dir = self.workspaces.copy_task_subtree(
            &workspace_path,
            &self.tasks_root(),
            &spec.relative_dir(),
        )?;

        let logs_dir = self.paths.task_logs_dir(&spec.dir_name);

        // Commit branch/workspace/logs_dir before the worker can crash.
        let (attempt, resume_thread_id, container_id_hint) = self.shared.mutate(|state| {
            let task = state.tasks.entry(task_id.clone()).or_default();
            task.status = TaskStatus::Running;
            task.attempts += 1;
            task.started_at.get_or_insert_with(chrono::Utc::now);
            task.branch = Some(branch.clone());
            task.workspace = Some(workspace_path.display().to_string());
            task.logs_dir = Some(logs_dir.display().to_string());
            (
                task.attempts,
                if resume { task.thread_id.clone() } else { None },
                if resume { task.container_id.clone() } else { None },
            )
        })?;

        let task_log = TaskLog::open(&self.paths.task_events_path(&spec.dir_name), &task_id)?;
        let worker_state_path = self.paths.worker_state_path(&spec.dir_name);

        let inputs = WorkerInputs {
            task_id: task_id.clone(),
            task_slug: spec.slug.clone(),
            task_branch: branch,
            workspace_path,
            task_relative_dir,
            attempt,
            lint_command: self.config.lint.clone(),
            lint_timeout_sec: self.config.lint_timeout_sec,
            doctor_command: decision.effective_doctor().to_string(),
            doctor_timeout_sec: self.config.doctor_timeout_sec,
            max_retries: self.config.max_retries,
            bootstrap_cmds: self.config.bootstrap_cmds.clone(),
            agent: self.config.agent.clone(),
            docker: self.config.docker.clone(),
            checkpoint_commits: self.config.checkpoint_commits,
            default_test_paths: self.config.default_test_paths.clone(),
            logs_dir,
            worker_state_path: worker_state_path.clone(),
            crash_after_start: self.crash_after_start,
            resume_thread_id,
            container_id_hint,
        };

        let runner = WorkerRunner::new(
            inputs,
            &task_log,
            &self.orchestrator_log,
            self.cancel.clone(),
        );
        let shared = Arc::clone(&self.shared);
        let container_task_id = task_id.clone();
        let result = runner
            .run(move |container_id| {
                // Persist the container id before the agent does any work,
                // so a crash right after can find and reuse it.
                let outcome = shared.mutate(|state| {
                    if let Some(task) = state.tasks.get_mut(&container_task_id) {
                        task.container_id = Some(container_id.to_string());
                    }
                });
                if let Err(e) = outcome {
                    warn!(error = %e, "failed to persist container id");
                }
            })
            .await?;

        // Merge worker-local durable state back into the task record.
        let local = WorkerLocalState::load(&worker_state_path);
        self.shared.mutate(|state| {
            if let Some(task) = state.tasks.get_mut(&task_id) {
                task.merge_checkpoints(local.checkpoint_commits.clone());
                if let Some(thread_id) = result.thread_id.clone().or(local.thread_id.clone()) {
                    task.thread_id = Some(thread_id);
                }
                if let Some(container_id) = result.container_id.clone() {
                    task.container_id = Some(container_id);
                }
            }
        })?;

        // The batch engine handles the pending transition; the resume path
        // additionally records that an in-flight thread was abandoned.
        if result.reset_to_pending && resume {
            self.orchestrator_log
                .emit(&OrchestratorEvent::TaskReset(TaskOutcomePayload {
                    task_id: task_id.clone(),
                    error: result.error_message.clone(),
                    attempts: Some(attempt),
                }));
        }

        Ok(TaskAttemptOutcome {
            task_id,
            success: result.success,
            error_message: result.error_message,
            reset_to_pending: result.reset_to_pending,
            usage: result.usage,
        })
    }

    fn main_branch(&self) -> String {
        self.config.main_branch.clone().unwrap_or_else(|| {
            git::detect_default_branch(&self.config.repo_path)
                .unwrap_or_else(|_| "main".to_string())
        })
    }
}
