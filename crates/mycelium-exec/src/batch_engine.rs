//! Batch finalization.
//!
//! When every worker in a batch has terminated, this engine applies the
//! outcomes in planner order: usage accounting, compliance, validators,
//! budget, merge, integration doctor, canary, ledger, archive, cleanup.
//! Every status transition is persisted before the next dependent step, so
//! a crash at any point resumes without replaying a merge.

use chrono::Utc;
use mycelium_core::config::{CanarySeverity, CleanupPolicy, ProjectConfig};
use mycelium_core::events::{
    BatchCompletePayload, BatchMergeConflictPayload, BatchMergingPayload, DoctorCanaryPayload,
    IntegrationDoctorPayload, LedgerWritePayload, OrchestratorEvent, TaskOutcomePayload,
};
use mycelium_core::fingerprint::compute_fingerprint;
use mycelium_core::manifest::TaskSpec;
use mycelium_core::types::{
    BatchStatus, CanaryOutcome, DoctorTrigger, HumanReview, LedgerEntry, LedgerStatus, RunStatus,
    StopReason, TaskStatus,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::budget::BudgetTracker;
use crate::command::{run_shell, truncate_output, DoctorTimer, RunMetrics};
use crate::compliance::{self, ComplianceStatus, OwnershipModel};
use crate::git::{self, MergeBranch, MergeOutcome};
use crate::ledger::TaskLedger;
use crate::logs::OrchestratorLog;
use crate::paths::RunPaths;
use crate::state::{SharedState, StateError};
use crate::task_engine::{TaskAttemptOutcome, TaskEngine};
use crate::validators::{DoctorRunRecord, TaskValidationContext, ValidationPipeline};
use crate::worker::cleanup_task;
use crate::workspace::WorkspaceManager;

/// Doctor output embedded into human-review summaries is capped here.
const REVIEW_SUMMARY_BYTES: usize = 4 * 1024;

#[derive(Debug, Error)]
pub enum BatchEngineError {
    #[error("state error: {0}")]
    State(#[from] StateError),
    #[error("git error: {0}")]
    Git(#[from] git::GitError),
    #[error("command error: {0}")]
    Command(#[from] crate::command::CommandError),
}

pub type Result<T> = std::result::Result<T, BatchEngineError>;

pub struct BatchEngine {
    config: Arc<ProjectConfig>,
    paths: RunPaths,
    shared: Arc<SharedState>,
    log: Arc<OrchestratorLog>,
    pipeline: ValidationPipeline,
    budget: BudgetTracker,
    task_engine: Arc<TaskEngine>,
    workspaces: WorkspaceManager,
    metrics: Arc<RunMetrics>,
    ownership: Option<Arc<dyn OwnershipModel>>,
    stop: crate::signals::StopSignal,
    main_branch: String,
    /// Tasks finished since the doctor validator last ran on cadence.
    finished_since_doctor: AtomicU32,
}

impl BatchEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<ProjectConfig>,
        paths: RunPaths,
        shared: Arc<SharedState>,
        log: Arc<OrchestratorLog>,
        pipeline: ValidationPipeline,
        task_engine: Arc<TaskEngine>,
        metrics: Arc<RunMetrics>,
        ownership: Option<Arc<dyn OwnershipModel>>,
        stop: crate::signals::StopSignal,
        main_branch: String,
    ) -> Self {
        let budget = BudgetTracker::new(config.budgets.clone());
        let workspaces = WorkspaceManager::new(config.repo_path.clone(), paths.clone());
        Self {
            config,
            paths,
            shared,
            log,
            pipeline,
            budget,
            task_engine,
            workspaces,
            metrics,
            ownership,
            stop,
            main_branch,
            finished_since_doctor: AtomicU32::new(0),
        }
    }

    /// Finalize one batch. Returns the stop reason, if any; the run engine
    /// uses it to decide whether another batch may start.
    pub async fn finalize_batch(
        &self,
        batch_id: u64,
        specs: &[TaskSpec],
        results: &[TaskAttemptOutcome],
    ) -> Result<Option<StopReason>> {
        let by_id: BTreeMap<&str, &TaskAttemptOutcome> =
            results.iter().map(|r| (r.task_id.as_str(), r)).collect();

        // 1. Usage accounting.
        self.shared.mutate(|state| {
            for result in results {
                if let Some(task) = state.tasks.get_mut(&result.task_id) {
                    task.usage.absorb(&result.usage);
                }
                state.usage.absorb(&result.usage);
            }
        })?;

        // 2. Per-task post-processing in planner order.
        for spec in specs {
            let Some(result) = by_id.get(spec.id()) else {
                continue;
            };
            if !result.success {
                if result.reset_to_pending {
                    self.shared.mutate(|state| {
                        if let Some(task) = state.tasks.get_mut(spec.id()) {
                            task.status = TaskStatus::Pending;
                            task.last_error = result.error_message.clone();
                        }
                    })?;
                    self.log
                        .emit(&OrchestratorEvent::TaskReset(TaskOutcomePayload {
                            task_id: spec.id().to_string(),
                            error: result.error_message.clone(),
                            attempts: None,
                        }));
                } else {
                    self.shared.mutate(|state| {
                        if let Some(task) = state.tasks.get_mut(spec.id()) {
                            task.status = TaskStatus::Failed;
                            task.last_error = result.error_message.clone();
                            task.completed_at = Some(Utc::now());
                        }
                    })?;
                    self.log
                        .emit(&OrchestratorEvent::TaskFailed(TaskOutcomePayload {
                            task_id: spec.id().to_string(),
                            error: result.error_message.clone(),
                            attempts: None,
                        }));
                }
                continue;
            }

            self.run_compliance(spec)?;
        }

        // 3. Validators over tasks still in flight.
        self.run_validators(specs)?;

        // 4. Budget check.
        let mut stop_reason: Option<StopReason> = None;
        let verdict = self.shared.read(|state| self.budget.evaluate_breaches(state));
        for breach in &verdict.breaches {
            let payload = breach.to_payload();
            if verdict.stop_reason.is_some() {
                self.log.emit(&OrchestratorEvent::BudgetBlock(payload));
            } else {
                self.log.emit(&OrchestratorEvent::BudgetWarn(payload));
            }
        }
        if let Some(reason) = verdict.stop_reason {
            stop_reason = Some(reason);
            self.shared.mutate(|state| {
                state.status = RunStatus::Failed;
            })?;
        }

        // 5. Cadence-driven doctor validator.
        if stop_reason.is_none() && !self.stop.is_stopping() {
            self.maybe_run_cadence_doctor(specs, &by_id)?;
        }

        // 6. Merge validated tasks in planner order.
        let mut batch_merge_commit: Option<String> = None;
        let mut merged_any = false;
        if stop_reason.is_none() {
            let to_merge = self.validated_merge_list(specs);
            if !to_merge.is_empty() {
                self.log.emit(&OrchestratorEvent::BatchMerging(BatchMergingPayload {
                    batch_id,
                    branches: to_merge.iter().map(|b| b.branch_name.clone()).collect(),
                }));
                match git::merge_task_branches(&self.config.repo_path, &self.main_branch, &to_merge)?
                {
                    MergeOutcome::Ok { merge_commit } => {
                        batch_merge_commit = Some(merge_commit);
                        merged_any = true;
                    }
                    MergeOutcome::Conflict {
                        task_id,
                        branch_name,
                        message,
                        merge_commit,
                    } => {
                        stop_reason = Some(StopReason::MergeConflict);
                        batch_merge_commit = merge_commit;
                        self.log.emit(&OrchestratorEvent::BatchMergeConflict(
                            BatchMergeConflictPayload {
                                batch_id,
                                task_id: task_id.clone(),
                                branch: branch_name,
                                message: truncate_output(&message, REVIEW_SUMMARY_BYTES),
                            },
                        ));
                        self.park_validated_tasks(
                            "merge",
                            &format!("merge conflict on task {task_id}"),
                            Some(truncate_output(&message, REVIEW_SUMMARY_BYTES)),
                        )?;
                        self.shared.mutate(|state| {
                            state.status = RunStatus::Failed;
                        })?;
                    }
                }
            }
        }

        // 7. Integration doctor at the repo root.
        let mut integration_doctor_passed: Option<bool> = None;
        let mut integration_doctor_output = String::new();
        if merged_any && stop_reason.is_none() {
            self.log.emit(&OrchestratorEvent::DoctorIntegrationStart(
                IntegrationDoctorPayload {
                    batch_id,
                    exit_code: None,
                    duration_ms: None,
                },
            ));
            let outcome = {
                let _timer = DoctorTimer::start(&self.metrics);
                run_shell(
                    &self.config.doctor,
                    &self.config.repo_path,
                    self.config.doctor_timeout_sec,
                    &[],
                )
                .await?
            };
            let payload = IntegrationDoctorPayload {
                batch_id,
                exit_code: Some(outcome.exit_code),
                duration_ms: Some(outcome.duration_ms),
            };
            if outcome.passed() {
                integration_doctor_passed = Some(true);
                self.log
                    .emit(&OrchestratorEvent::DoctorIntegrationPass(payload));
            } else {
                integration_doctor_passed = Some(false);
                integration_doctor_output = outcome.combined_output();
                self.log
                    .emit(&OrchestratorEvent::DoctorIntegrationFail(payload));
                stop_reason = Some(StopReason::IntegrationDoctorFailed);
                self.park_validated_tasks(
                    "integration_doctor",
                    "integration doctor failed after merge",
                    Some(truncate_output(&integration_doctor_output, REVIEW_SUMMARY_BYTES)),
                )?;
                self.shared.mutate(|state| {
                    state.status = RunStatus::Failed;
                })?;
            }
        }

        // 8. Doctor canary.
        let canary_outcome = if integration_doctor_passed == Some(true) {
            Some(self.run_canary(batch_id, specs, &by_id).await?)
        } else {
            None
        };

        // 9. Finalize task statuses for this batch.
        let mut completed_ids: Vec<String> = Vec::new();
        if stop_reason.is_none() {
            completed_ids = self.shared.mutate(|state| {
                let mut completed = Vec::new();
                for spec in specs {
                    if let Some(task) = state.tasks.get_mut(spec.id()) {
                        if task.status == TaskStatus::Validated {
                            task.status = TaskStatus::Complete;
                            task.completed_at = Some(Utc::now());
                            completed.push(spec.id().to_string());
                        }
                    }
                }
                completed
            })?;
            for task_id in &completed_ids {
                self.log
                    .emit(&OrchestratorEvent::TaskComplete(TaskOutcomePayload {
                        task_id: task_id.clone(),
                        error: None,
                        attempts: None,
                    }));
            }
        }

        // 10. Complete the batch record.
        let batch_status = self.shared.mutate(|state| {
            let batch_failed = stop_reason.is_some()
                || specs.iter().any(|spec| {
                    state
                        .tasks
                        .get(spec.id())
                        .is_some_and(|t| !t.status.is_done())
                });
            let status = if batch_failed {
                BatchStatus::Failed
            } else {
                BatchStatus::Complete
            };
            if let Some(batch) = state.batches.iter_mut().find(|b| b.batch_id == batch_id) {
                batch.status = status;
                batch.completed_at = Some(Utc::now());
                batch.merge_commit = batch_merge_commit.clone();
                batch.integration_doctor_passed = integration_doctor_passed;
                batch.integration_doctor_canary = canary_outcome;
            }
            status
        })?;
        self.log
            .emit(&OrchestratorEvent::BatchComplete(BatchCompletePayload {
                batch_id,
                status: batch_status.as_str().to_string(),
                merge_commit: batch_merge_commit.clone(),
                stop_reason,
            }));

        // 11. Ledger writes; errors are logged, never fatal.
        if integration_doctor_passed == Some(true) {
            if let Some(merge_commit) = &batch_merge_commit {
                self.write_ledger_entries(specs, merge_commit);
            }
        }

        // 12. Post-merge doctor validator on a suspicious integration failure.
        if integration_doctor_passed == Some(false)
            && self.config.validators.doctor.mode.is_enabled()
        {
            let records = self.doctor_run_records(specs, &by_id);
            self.pipeline.run_doctor_validator(
                DoctorTrigger::IntegrationDoctorFailed,
                &records,
                &truncate_output(&integration_doctor_output, REVIEW_SUMMARY_BYTES),
                &self.log,
            );
        }

        // 13. Archive completed tasks.
        let run_id = self.shared.read(|state| state.run_id.to_string());
        for spec in specs {
            if completed_ids.iter().any(|id| id == spec.id()) {
                if let Err(e) = self.task_engine.archive_task(spec, &run_id) {
                    warn!(task_id = %spec.id(), error = %e, "failed to archive task");
                }
            }
        }

        // 14. Cleanup, suppressed while stopping so resume finds state.
        if integration_doctor_passed == Some(true) && !self.stop.is_stopping() {
            self.cleanup_batch(specs, &completed_ids).await;
        }

        info!(
            batch_id,
            status = batch_status.as_str(),
            stop_reason = ?stop_reason,
            "batch finalized"
        );
        Ok(stop_reason)
    }

    fn run_compliance(&self, spec: &TaskSpec) -> Result<()> {
        if !self.config.compliance.mode.is_enabled() {
            return Ok(());
        }
        let workspace = self.paths.workspace_dir(&spec.dir_name);
        let report_path = self.paths.reports_dir(spec.id()).join("compliance.json");
        let outcome = compliance::check(&compliance::ComplianceInputs {
            workspace_path: &workspace,
            main_branch: &self.main_branch,
            manifest: &spec.manifest,
            static_resources: &self.config.resources,
            fallback_resource: &self.config.compliance.fallback_resource,
            ownership: self.ownership.as_deref(),
            mode: self.config.compliance.mode,
            report_path: Some(&report_path),
        });

        match outcome {
            Ok(outcome) => {
                self.metrics
                    .record_compliance_violations(outcome.violations.len() as u64);
                if outcome.status == ComplianceStatus::Block {
                    let reason = outcome
                        .violations
                        .first()
                        .map_or_else(String::new, |v| format!("{}: {}", v.path, v.reasons.join(", ")));
                    self.shared.mutate(|state| {
                        if let Some(task) = state.tasks.get_mut(spec.id()) {
                            task.status = TaskStatus::NeedsHumanReview;
                            task.human_review = Some(HumanReview {
                                validator: "compliance".to_string(),
                                reason: format!("write-scope violation ({reason})"),
                                summary: None,
                                report_path: Some(report_path.display().to_string()),
                            });
                        }
                    })?;
                }
            }
            Err(e) => {
                // A broken compliance check is a task failure, not a crash.
                warn!(task_id = %spec.id(), error = %e, "compliance check failed");
            }
        }
        Ok(())
    }

    fn run_validators(&self, specs: &[TaskSpec]) -> Result<()> {
        for spec in specs {
            let is_running = self
                .shared
                .read(|state| state.tasks.get(spec.id()).map(|t| t.status))
                == Some(TaskStatus::Running);
            if !is_running {
                continue;
            }

            let workspace = self.paths.workspace_dir(&spec.dir_name);
            let changed_files =
                git::list_changed_files(&workspace, &self.main_branch).unwrap_or_default();
            let context = TaskValidationContext {
                task_id: spec.id().to_string(),
                slug: spec.slug.clone(),
                description: spec.manifest.description.clone(),
                diff_summary: format!("{} files changed", changed_files.len()),
                changed_files,
                test_paths: spec.manifest.test_paths.iter().cloned().collect(),
            };
            let report = self.pipeline.run_for_task(&context, &self.log);

            self.shared.mutate(|state| {
                if let Some(task) = state.tasks.get_mut(spec.id()) {
                    for result in report.results.clone() {
                        task.record_validator_result(result);
                    }
                    if let Some(blocked) = report.blocked.first() {
                        task.status = TaskStatus::NeedsHumanReview;
                        task.human_review = Some(HumanReview {
                            validator: blocked.validator.clone(),
                            reason: blocked.reason.clone(),
                            summary: blocked.summary.clone(),
                            report_path: blocked.report_path.clone(),
                        });
                    } else {
                        task.status = TaskStatus::Validated;
                    }
                }
            })?;

            if report.blocked.is_empty() {
                self.finished_since_doctor.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    fn maybe_run_cadence_doctor(
        &self,
        specs: &[TaskSpec],
        by_id: &BTreeMap<&str, &TaskAttemptOutcome>,
    ) -> Result<()> {
        let cadence = self.config.validators.doctor.cadence;
        if !self.config.validators.doctor.mode.is_enabled() || cadence == 0 {
            return Ok(());
        }
        if self.finished_since_doctor.load(Ordering::Relaxed) < cadence {
            return Ok(());
        }
        self.finished_since_doctor.store(0, Ordering::Relaxed);

        let records = self.doctor_run_records(specs, by_id);
        let changed: Vec<String> = specs
            .iter()
            .flat_map(|spec| {
                git::list_changed_files(&self.paths.workspace_dir(&spec.dir_name), &self.main_branch)
                    .unwrap_or_default()
            })
            .collect();
        let verdict = self.pipeline.run_doctor_validator(
            DoctorTrigger::Cadence,
            &records,
            &changed.join("\n"),
            &self.log,
        );

        // An ineffective doctor invalidates this batch's green lights.
        if let Some(blocked) = verdict.blocked {
            self.park_validated_tasks(
                &blocked.validator,
                &blocked.reason,
                blocked.summary.clone(),
            )?;
        }
        Ok(())
    }

    async fn run_canary(
        &self,
        batch_id: u64,
        specs: &[TaskSpec],
        by_id: &BTreeMap<&str, &TaskAttemptOutcome>,
    ) -> Result<CanaryOutcome> {
        if !self.config.doctor_canary.enabled {
            self.log
                .emit(&OrchestratorEvent::DoctorCanarySkipped(DoctorCanaryPayload {
                    batch_id,
                    outcome: Some(CanaryOutcome::Skipped),
                    exit_code: None,
                }));
            return Ok(CanaryOutcome::Skipped);
        }

        self.log
            .emit(&OrchestratorEvent::DoctorCanaryStart(DoctorCanaryPayload {
                batch_id,
                outcome: None,
                exit_code: None,
            }));
        let envs = vec![(self.config.doctor_canary.env_var.clone(), "1".to_string())];
        let outcome = run_shell(
            &self.config.doctor,
            &self.config.repo_path,
            self.config.doctor_timeout_sec,
            &envs,
        )
        .await?;

        if outcome.exit_code == 0 {
            // The user's doctor ignored the canary flag.
            self.log.emit(&OrchestratorEvent::DoctorCanaryUnexpectedPass(
                DoctorCanaryPayload {
                    batch_id,
                    outcome: Some(CanaryOutcome::UnexpectedPass),
                    exit_code: Some(0),
                },
            ));
            if self.config.doctor_canary.severity == CanarySeverity::Error
                && self.config.validators.doctor.mode.is_enabled()
            {
                let records = self.doctor_run_records(specs, by_id);
                self.pipeline.run_doctor_validator(
                    DoctorTrigger::DoctorCanaryFailed,
                    &records,
                    "doctor passed with the canary flag set",
                    &self.log,
                );
            }
            Ok(CanaryOutcome::UnexpectedPass)
        } else {
            self.log.emit(&OrchestratorEvent::DoctorCanaryExpectedFail(
                DoctorCanaryPayload {
                    batch_id,
                    outcome: Some(CanaryOutcome::ExpectedFail),
                    exit_code: Some(outcome.exit_code),
                },
            ));
            Ok(CanaryOutcome::ExpectedFail)
        }
    }

    /// Branches of currently `validated` tasks, in planner order.
    fn validated_merge_list(&self, specs: &[TaskSpec]) -> Vec<MergeBranch> {
        self.shared.read(|state| {
            specs
                .iter()
                .filter_map(|spec| {
                    let task = state.tasks.get(spec.id())?;
                    if task.status != TaskStatus::Validated {
                        return None;
                    }
                    Some(MergeBranch {
                        task_id: spec.id().to_string(),
                        branch_name: task.branch.clone()?,
                    })
                })
                .collect()
        })
    }

    /// Move every `validated` task to `needs_human_review` with the given
    /// reason; used for merge conflicts, doctor failures and an
    /// ineffective-doctor verdict.
    fn park_validated_tasks(
        &self,
        validator: &str,
        reason: &str,
        summary: Option<String>,
    ) -> Result<()> {
        self.shared.mutate(|state| {
            for task in state.tasks.values_mut() {
                if task.status == TaskStatus::Validated {
                    task.status = TaskStatus::NeedsHumanReview;
                    task.human_review = Some(HumanReview {
                        validator: validator.to_string(),
                        reason: reason.to_string(),
                        summary: summary.clone(),
                        report_path: None,
                    });
                }
            }
        })?;
        Ok(())
    }

    fn doctor_run_records(
        &self,
        specs: &[TaskSpec],
        by_id: &BTreeMap<&str, &TaskAttemptOutcome>,
    ) -> Vec<DoctorRunRecord> {
        let mut records: Vec<DoctorRunRecord> = Vec::new();
        // Newest first: walk the batch in reverse planner order.
        for spec in specs.iter().rev() {
            let Some(result) = by_id.get(spec.id()) else {
                continue;
            };
            let attempts = self
                .shared
                .read(|state| state.tasks.get(spec.id()).map_or(1, |t| t.attempts.max(1)));
            let log_path = self.paths.task_doctor_log_path(&spec.dir_name, attempts);
            let snippet = std::fs::read_to_string(&log_path).unwrap_or_default();
            records.push(DoctorRunRecord {
                task_id: spec.id().to_string(),
                passed: result.success,
                log_snippet: snippet,
            });
        }
        records
    }

    fn write_ledger_entries(&self, specs: &[TaskSpec], merge_commit: &str) {
        let ledger = TaskLedger::new(self.paths.ledger_path());
        let tasks_root = self.config.repo_path.join(&self.config.tasks_dir);
        let run_id = self.shared.read(|state| state.run_id.clone());

        for spec in specs {
            let status = self
                .shared
                .read(|state| state.tasks.get(spec.id()).map(|t| t.status));
            let ledger_status = match status {
                Some(TaskStatus::Complete) => LedgerStatus::Complete,
                Some(TaskStatus::Skipped) => LedgerStatus::Skipped,
                _ => continue,
            };

            self.log
                .emit(&OrchestratorEvent::LedgerWriteStart(LedgerWritePayload {
                    task_id: spec.id().to_string(),
                    fingerprint: None,
                    error: None,
                }));

            // Fingerprint the task at its moved (post-stage) location.
            let manifest_path = spec.manifest_path(&tasks_root);
            let spec_path = spec.spec_path(&tasks_root);
            let write = compute_fingerprint(&manifest_path, &spec_path)
                .map_err(|e| e.to_string())
                .and_then(|fingerprint| {
                    ledger
                        .upsert(LedgerEntry {
                            task_id: spec.id().to_string(),
                            fingerprint: fingerprint.clone(),
                            status: ledger_status,
                            merge_commit: merge_commit.to_string(),
                            integration_doctor_passed: true,
                            completed_at: Utc::now(),
                            run_id: run_id.clone(),
                            source: "batch".to_string(),
                        })
                        .map(|()| fingerprint)
                        .map_err(|e| e.to_string())
                });

            match write {
                Ok(fingerprint) => {
                    self.log
                        .emit(&OrchestratorEvent::LedgerWriteComplete(LedgerWritePayload {
                            task_id: spec.id().to_string(),
                            fingerprint: Some(fingerprint),
                            error: None,
                        }));
                }
                Err(error) => {
                    // Never fails the batch.
                    warn!(task_id = %spec.id(), error = %error, "ledger write failed");
                    self.log
                        .emit(&OrchestratorEvent::LedgerWriteError(LedgerWritePayload {
                            task_id: spec.id().to_string(),
                            fingerprint: None,
                            error: Some(error),
                        }));
                }
            }
        }
    }

    async fn cleanup_batch(&self, specs: &[TaskSpec], completed_ids: &[String]) {
        for spec in specs {
            if !completed_ids.iter().any(|id| id == spec.id()) {
                continue;
            }
            if self.config.cleanup.workspaces == CleanupPolicy::OnSuccess {
                self.workspaces.remove(&spec.dir_name);
            }
            if self.config.cleanup.containers == CleanupPolicy::OnSuccess {
                let container_id = self
                    .shared
                    .read(|state| state.tasks.get(spec.id()).and_then(|t| t.container_id.clone()));
                cleanup_task(&self.config.repo_path, container_id.as_deref()).await;
            }
        }
    }
}
