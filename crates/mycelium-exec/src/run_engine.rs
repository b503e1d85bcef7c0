//! Top-level run loop.
//!
//! Loads (or recovers) the run state, pre-skips tasks the ledger already
//! vouches for, then repeatedly selects the next batch of lock-compatible
//! tasks, fans them out to the task engine under a concurrency bound, and
//! hands the finished batch to the batch engine. Batches are strictly
//! sequential: the next cannot start until the previous is finalized and
//! persisted.

use chrono::Utc;
use mycelium_core::config::ProjectConfig;
use mycelium_core::events::{OrchestratorEvent, RunStartPayload, RunStopPayload};
use mycelium_core::fingerprint::compute_fingerprint;
use mycelium_core::manifest::{load_task_specs, locks_conflict, TaskSpec};
use mycelium_core::types::{
    BatchRecord, BatchStatus, ContainerDisposition, RunId, RunState, RunStatus, StopInfo,
    TaskState, TaskStatus,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::batch_engine::BatchEngine;
use crate::command::RunMetrics;
use crate::git;
use crate::ledger::TaskLedger;
use crate::logs::OrchestratorLog;
use crate::paths::RunPaths;
use crate::signals::StopSignal;
use crate::state::{RunStateStore, SharedState};
use crate::task_engine::{TaskAttemptOutcome, TaskEngine};
use crate::validators::{LlmClient, ValidationPipeline};

/// Application-level errors with context, used at the engine top level.
pub type AppResult<T> = eyre::Result<T>;

/// Construction options for a run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Mycelium home; defaults to `mycelium_home()`.
    pub home: Option<PathBuf>,
    /// Reopen this run id instead of starting a new run.
    pub run_id: Option<String>,
    /// Explicit resume after a known crash: force-reset in-flight tasks.
    pub resume: bool,
    /// Debug hook forwarded to workers; used by resume tests.
    pub crash_after_start: bool,
}

pub struct RunEngine {
    config: Arc<ProjectConfig>,
    paths: RunPaths,
    shared: Arc<SharedState>,
    log: Arc<OrchestratorLog>,
    task_engine: Arc<TaskEngine>,
    batch_engine: BatchEngine,
    stop: StopSignal,
    metrics: Arc<RunMetrics>,
    specs: Vec<TaskSpec>,
}

impl RunEngine {
    pub fn new(
        config: ProjectConfig,
        options: RunOptions,
        llm: Arc<dyn LlmClient>,
        stop: StopSignal,
    ) -> AppResult<Self> {
        let config = Arc::new(config);
        let home = options
            .home
            .clone()
            .unwrap_or_else(crate::paths::mycelium_home);

        let run_id = options
            .run_id
            .clone()
            .map_or_else(RunId::new, RunId::from_string);
        let paths = RunPaths::new(home, config.project.clone(), run_id.to_string());
        let store = RunStateStore::new(paths.state_path());
        let log = Arc::new(OrchestratorLog::open(&paths.orchestrator_log_path())?);

        // Acquire or initialise the run state, with stale recovery.
        let state = if store.exists() {
            if options.resume {
                let (state, reset) = store.recover("explicit resume", Utc::now())?;
                if !reset.is_empty() {
                    info!(reset = reset.len(), "explicit resume reset in-flight tasks");
                }
                state
            } else {
                let (state, recovery) =
                    store.load(true, config.stale_after_ms, Utc::now())?;
                if let Some(payload) = recovery {
                    log.emit(&OrchestratorEvent::RunStaleRecovery(payload));
                }
                state
            }
        } else {
            RunState::new(config.project.clone(), run_id, Utc::now())
        };

        // Load every planned task from the scheduling stages.
        let tasks_root = config.repo_path.join(&config.tasks_dir);
        let specs = load_task_specs(&tasks_root)?;

        let main_branch = config.main_branch.clone().unwrap_or_else(|| {
            git::detect_default_branch(&config.repo_path).unwrap_or_else(|_| "main".to_string())
        });

        let shared = Arc::new(SharedState::new(store, state));
        let metrics = Arc::new(RunMetrics::default());

        let mut task_engine = TaskEngine::new(
            Arc::clone(&config),
            paths.clone(),
            Arc::clone(&shared),
            Arc::clone(&log),
            stop.cancel_token(),
        );
        task_engine.crash_after_start = options.crash_after_start;
        let task_engine = Arc::new(task_engine);

        let pipeline = ValidationPipeline::new(
            config.validators.clone(),
            llm,
            paths.clone(),
            config.repo_path.clone(),
        );
        let batch_engine = BatchEngine::new(
            Arc::clone(&config),
            paths.clone(),
            Arc::clone(&shared),
            Arc::clone(&log),
            pipeline,
            Arc::clone(&task_engine),
            Arc::clone(&metrics),
            None,
            stop.clone(),
            main_branch,
        );

        Ok(Self {
            config,
            paths,
            shared,
            log,
            task_engine,
            batch_engine,
            stop,
            metrics,
            specs,
        })
    }

    pub fn run_id(&self) -> String {
        self.shared.read(|state| state.run_id.to_string())
    }

    pub fn state_path(&self) -> PathBuf {
        self.paths.state_path()
    }

    /// Execute the run to its final status.
    pub async fn run(&mut self) -> AppResult<RunStatus> {
        self.initialise()?;
        self.pre_skip_from_ledger()?;

        loop {
            if self.stop.is_stopping() {
                self.enter_paused_stop()?;
                break;
            }

            let batch_ids = self.select_batch();
            if batch_ids.is_empty() {
                self.finalize_run()?;
                break;
            }

            let batch_id = self.record_batch_start(&batch_ids)?;
            let results = self.fan_out(&batch_ids).await;

            let batch_specs: Vec<TaskSpec> = batch_ids
                .iter()
                .filter_map(|id| self.specs.iter().find(|s| s.id() == id).cloned())
                .collect();
            let stop_reason = self
                .batch_engine
                .finalize_batch(batch_id, &batch_specs, &results)
                .await?;

            if let Some(reason) = stop_reason {
                info!(reason = reason.as_str(), "run stopped by batch");
                break;
            }
            if self.stop.is_stopping() {
                self.enter_paused_stop()?;
                break;
            }
        }

        let status = self.shared.read(|state| state.status);
        self.write_summary(status);
        Ok(status)
    }

    fn initialise(&mut self) -> AppResult<()> {
        // Every planned task has a state entry; every declared dependency
        // must resolve to a known task (planned now or finished earlier).
        let spec_count = self.specs.len();
        self.shared.mutate(|state| {
            for spec in &self.specs {
                state
                    .tasks
                    .entry(spec.id().to_string())
                    .or_insert_with(TaskState::new);
            }
            state.status = RunStatus::Running;
            state.stop = None;
        })?;

        for spec in &self.specs {
            for dep in &spec.manifest.dependencies {
                let known = self.shared.read(|state| state.tasks.contains_key(dep));
                if !known {
                    eyre::bail!(
                        "task {} depends on unknown task {dep}; re-run the planner",
                        spec.id()
                    );
                }
            }
        }

        self.log.emit(&OrchestratorEvent::RunStart(RunStartPayload {
            run_id: self.run_id(),
            project: self.config.project.clone(),
            task_count: spec_count,
        }));
        Ok(())
    }

    /// Skip tasks whose ledger entry is authoritative for their current
    /// fingerprint.
    fn pre_skip_from_ledger(&self) -> AppResult<()> {
        let ledger = TaskLedger::new(self.paths.ledger_path());
        let tasks_root = self.config.repo_path.join(&self.config.tasks_dir);

        for spec in &self.specs {
            let already_done = self
                .shared
                .read(|state| state.tasks.get(spec.id()).is_some_and(|t| t.status.is_done()));
            if already_done {
                continue;
            }

            let Some(entry) = ledger.lookup(spec.id())? else {
                continue;
            };
            if !entry.integration_doctor_passed {
                continue;
            }
            let fingerprint = match compute_fingerprint(
                &spec.manifest_path(&tasks_root),
                &spec.spec_path(&tasks_root),
            ) {
                Ok(fingerprint) => fingerprint,
                Err(e) => {
                    warn!(task_id = %spec.id(), error = %e, "fingerprint failed; not skipping");
                    continue;
                }
            };
            if fingerprint != entry.fingerprint {
                continue;
            }

            info!(task_id = %spec.id(), "ledger fingerprint match; skipping");
            self.shared.mutate(|state| {
                if let Some(task) = state.tasks.get_mut(spec.id()) {
                    task.status = TaskStatus::Skipped;
                    task.completed_at = Some(Utc::now());
                }
            })?;
        }
        Ok(())
    }

    fn select_batch(&self) -> Vec<String> {
        self.shared.read(|state| select_batch_ids(&self.specs, state))
    }

    fn record_batch_start(&self, batch_ids: &[String]) -> AppResult<u64> {
        let batch_id = self.shared.mutate(|state| {
            let batch_id = state.next_batch_id();
            state.batches.push(BatchRecord {
                batch_id,
                task_ids: batch_ids.to_vec(),
                status: BatchStatus::Running,
                started_at: Utc::now(),
                completed_at: None,
                merge_commit: None,
                integration_doctor_passed: None,
                integration_doctor_canary: None,
            });
            batch_id
        })?;
        self.log.emit(&OrchestratorEvent::BatchStart(
            mycelium_core::events::BatchStartPayload {
                batch_id,
                task_ids: batch_ids.to_vec(),
            },
        ));
        Ok(batch_id)
    }

    /// Fan the batch out over the task engine with bounded concurrency.
    /// Engine-level errors become task failures, never a crashed run.
    async fn fan_out(&mut self, batch_ids: &[String]) -> Vec<TaskAttemptOutcome> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel as usize));
        let mut join_set: JoinSet<(TaskSpec, TaskAttemptOutcome)> = JoinSet::new();

        for task_id in batch_ids {
            let Some(spec) = self.specs.iter().find(|s| s.id() == task_id).cloned() else {
                continue;
            };
            let resume = self
                .shared
                .read(|state| state.tasks.get(task_id).map(|t| t.status))
                == Some(TaskStatus::Running);
            let engine = Arc::clone(&self.task_engine);
            let semaphore = Arc::clone(&semaphore);

            join_set.spawn(async move {
                // The semaphore lives for the whole fan-out; acquisition
                // cannot fail.
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("semaphore closed during fan-out");
                let mut spec = spec;
                let attempt = if resume {
                    engine.resume_running_task(&mut spec).await
                } else {
                    engine.run_task_attempt(&mut spec).await
                };
                let outcome = match attempt {
                    Ok(outcome) => outcome,
                    Err(e) => TaskAttemptOutcome {
                        task_id: spec.id().to_string(),
                        success: false,
                        error_message: Some(e.to_string()),
                        reset_to_pending: false,
                        usage: Default::default(),
                    },
                };
                (spec, outcome)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((spec, outcome)) => {
                    // Stage moves happened inside the attempt; keep our view
                    // of the tasks directory current.
                    if let Some(existing) =
                        self.specs.iter_mut().find(|s| s.id() == spec.id())
                    {
                        *existing = spec;
                    }
                    results.push(outcome);
                }
                Err(e) => error!(error = %e, "worker task panicked"),
            }
        }
        results
    }

    /// Stop-signal exit: persist `paused` plus the stop record; cleanup is
    /// suppressed so resume finds workspaces and containers intact.
    fn enter_paused_stop(&self) -> AppResult<()> {
        let signal = self.stop.signal_name().unwrap_or_else(|| "signal".to_string());
        self.log.emit(&OrchestratorEvent::RunStop(RunStopPayload {
            signal: signal.clone(),
        }));
        self.shared.mutate(|state| {
            state.status = RunStatus::Paused;
            state.stop = Some(StopInfo {
                signal,
                containers: ContainerDisposition::LeftRunning,
                stop_containers_requested: false,
            });
        })?;
        Ok(())
    }

    /// No schedulable work remains: settle the final run status.
    fn finalize_run(&self) -> AppResult<()> {
        self.shared.mutate(|state| {
            if state.status != RunStatus::Running {
                // A stop reason already settled it.
                return;
            }
            let all_done = state.tasks.values().all(|t| t.status.is_done());
            let any_failed = state
                .tasks
                .values()
                .any(|t| t.status == TaskStatus::Failed);
            let any_parked = state.tasks.values().any(|t| {
                matches!(
                    t.status,
                    TaskStatus::NeedsHumanReview | TaskStatus::RescopeRequired
                )
            });
            state.status = if all_done {
                RunStatus::Complete
            } else if any_failed {
                RunStatus::Failed
            } else if any_parked {
                // Human review is a pause, not a terminal failure.
                RunStatus::Paused
            } else {
                RunStatus::Failed
            };
        })?;
        Ok(())
    }

    /// Post-run summary artifact. Best-effort: never fails the run.
    fn write_summary(&self, status: RunStatus) {
        let summary = self.shared.read(|state| {
            let mut by_status: std::collections::BTreeMap<&str, usize> = Default::default();
            for task in state.tasks.values() {
                *by_status.entry(task.status.as_str()).or_default() += 1;
            }
            serde_json::json!({
                "run_id": state.run_id.to_string(),
                "project": state.project,
                "status": status.as_str(),
                "tasks": by_status,
                "batches": state.batches.len(),
                "usage": state.usage,
                "metrics": self.metrics.snapshot(),
            })
        });
        let path = self.paths.summary_path();
        if let Err(e) = std::fs::write(&path, serde_json::to_string_pretty(&summary).unwrap_or_default())
        {
            warn!(path = %path.display(), error = %e, "failed to write run summary");
        }
    }
}

/// Maximal set of schedulable tasks, in planner order, whose pairwise
/// resource locks do not conflict. Tasks left `running` by a prior process
/// are included so they get resumed.
fn select_batch_ids(specs: &[TaskSpec], state: &RunState) -> Vec<String> {
    let mut selected: Vec<&TaskSpec> = Vec::new();
    for spec in specs {
        let Some(task) = state.tasks.get(spec.id()) else {
            continue;
        };
        if !matches!(task.status, TaskStatus::Pending | TaskStatus::Running) {
            continue;
        }
        let deps_done = spec
            .manifest
            .dependencies
            .iter()
            .all(|dep| state.tasks.get(dep).is_some_and(|d| d.status.is_done()));
        if !deps_done {
            continue;
        }
        let conflicts = selected
            .iter()
            .any(|other| locks_conflict(&spec.manifest.locks, &other.manifest.locks));
        if conflicts {
            continue;
        }
        selected.push(spec);
    }
    selected.iter().map(|s| s.id().to_string()).collect()
}
