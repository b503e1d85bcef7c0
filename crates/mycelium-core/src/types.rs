//! Core state types for the executor.
//!
//! Everything here is serialized into the durable run-state document, the
//! task ledger, or the JSONL event streams, so serde representations are
//! part of the on-disk contract and must stay stable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

/// Identifier for a single run of the executor.
///
/// Uses `UUIDv7` for time-ordered lexicographic sorting of run directories.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for RunId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Task identifier as assigned by the planner. Stable within a plan.
pub type TaskId = String;

// --- Enumerations ---

/// Run lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Paused,
    Complete,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }
}

/// Per-task lifecycle status.
///
/// `Validated` is a batch-internal state: the task passed its validators and
/// is eligible for merge, but the merge has not happened yet. A crash between
/// the two leaves the task `validated`; stale recovery treats it like
/// `running` and demotes it to `pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Validated,
    Complete,
    Skipped,
    Failed,
    NeedsHumanReview,
    RescopeRequired,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Validated => "validated",
            Self::Complete => "complete",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
            Self::NeedsHumanReview => "needs_human_review",
            Self::RescopeRequired => "rescope_required",
        }
    }

    /// Finished successfully: counts toward run completion.
    pub fn is_done(self) -> bool {
        matches!(self, Self::Complete | Self::Skipped)
    }

    /// In-flight states that stale recovery demotes back to `pending`.
    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Running | Self::Validated)
    }

    /// States that require a human before the run can ever complete.
    pub fn needs_attention(self) -> bool {
        matches!(
            self,
            Self::Failed | Self::NeedsHumanReview | Self::RescopeRequired
        )
    }
}

/// Batch lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Running,
    Complete,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }
}

/// Enforcement mode shared by validators, budgets, compliance and checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementMode {
    #[default]
    Off,
    Warn,
    Block,
}

impl EnforcementMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Warn => "warn",
            Self::Block => "block",
        }
    }

    pub fn is_enabled(self) -> bool {
        !matches!(self, Self::Off)
    }
}

/// Outcome of one validator invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidatorStatus {
    Pass,
    Fail,
    Error,
}

impl ValidatorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Error => "error",
        }
    }
}

/// Why the doctor validator was invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoctorTrigger {
    Cadence,
    IntegrationDoctorFailed,
    DoctorCanaryFailed,
    Manual,
}

impl DoctorTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cadence => "cadence",
            Self::IntegrationDoctorFailed => "integration_doctor_failed",
            Self::DoctorCanaryFailed => "doctor_canary_failed",
            Self::Manual => "manual",
        }
    }
}

/// Outcome of the doctor canary invocation after a batch merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanaryOutcome {
    /// Canary exited non-zero: the doctor respects the canary flag.
    ExpectedFail,
    /// Canary exited zero: the doctor is not testing what it claims.
    UnexpectedPass,
    Skipped,
}

impl CanaryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExpectedFail => "expected_fail",
            Self::UnexpectedPass => "unexpected_pass",
            Self::Skipped => "skipped",
        }
    }
}

/// Reason a batch (and therefore the run) stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    MergeConflict,
    IntegrationDoctorFailed,
    BudgetBlock,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MergeConflict => "merge_conflict",
            Self::IntegrationDoctorFailed => "integration_doctor_failed",
            Self::BudgetBlock => "budget_block",
        }
    }
}

/// What happened to worker containers when a stop signal arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerDisposition {
    LeftRunning,
    Stopped,
}

// --- Aggregates ---

/// Aggregated token/cost usage for a task or a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct UsageTotals {
    pub input_tokens: u64,
    pub cached_input_tokens: u64,
    pub output_tokens: u64,
    pub estimated_cost: f64,
}

impl UsageTotals {
    /// Fold another snapshot into this one.
    pub fn absorb(&mut self, other: &UsageTotals) {
        self.input_tokens += other.input_tokens;
        self.cached_input_tokens += other.cached_input_tokens;
        self.output_tokens += other.output_tokens;
        self.estimated_cost += other.estimated_cost;
    }

    /// All tokens billed for this snapshot, cached input included.
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.cached_input_tokens + self.output_tokens
    }
}

/// A commit the worker made at the end of an attempt to preserve progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointCommit {
    pub attempt: u32,
    pub sha: String,
    pub created_at: DateTime<Utc>,
}

/// One validator's recorded outcome on a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorResult {
    pub validator: String,
    pub status: ValidatorStatus,
    pub mode: EnforcementMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<DoctorTrigger>,
}

/// Why a task was parked for human review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumanReview {
    pub validator: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_path: Option<String>,
}

/// Mutable per-task execution state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskState {
    pub status: TaskStatus,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    /// Ordered by attempt; at most one entry per attempt.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checkpoint_commits: Vec<CheckpointCommit>,
    /// At most one entry per validator name: later replaces earlier.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validator_results: Vec<ValidatorResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub human_review: Option<HumanReview>,
    #[serde(default)]
    pub usage: UsageTotals,
}

impl TaskState {
    pub fn new() -> Self {
        Self {
            status: TaskStatus::Pending,
            attempts: 0,
            last_error: None,
            started_at: None,
            completed_at: None,
            branch: None,
            workspace: None,
            logs_dir: None,
            thread_id: None,
            container_id: None,
            checkpoint_commits: Vec::new(),
            validator_results: Vec::new(),
            human_review: None,
            usage: UsageTotals::default(),
        }
    }

    /// Record a validator outcome, replacing any prior entry for the same
    /// validator name.
    pub fn record_validator_result(&mut self, result: ValidatorResult) {
        self.validator_results
            .retain(|r| r.validator != result.validator);
        self.validator_results.push(result);
    }

    /// Merge checkpoint commits read back from the worker, deduplicating by
    /// attempt number. Existing entries win; the list stays attempt-ordered.
    pub fn merge_checkpoints(&mut self, incoming: Vec<CheckpointCommit>) {
        for commit in incoming {
            if self
                .checkpoint_commits
                .iter()
                .any(|c| c.attempt == commit.attempt)
            {
                continue;
            }
            self.checkpoint_commits.push(commit);
        }
        self.checkpoint_commits.sort_by_key(|c| c.attempt);
    }
}

impl Default for TaskState {
    fn default() -> Self {
        Self::new()
    }
}

/// Record of one batch within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRecord {
    /// 1-based position within the run.
    pub batch_id: u64,
    pub task_ids: Vec<TaskId>,
    pub status: BatchStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_commit: Option<String>,
    /// Tri-state: None until the integration doctor has run.
    #[serde(default)]
    pub integration_doctor_passed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integration_doctor_canary: Option<CanaryOutcome>,
}

/// Stop-signal bookkeeping persisted into the run state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopInfo {
    pub signal: String,
    pub containers: ContainerDisposition,
    pub stop_containers_requested: bool,
}

/// The durable run-state document. One per (project, run_id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub project: String,
    pub run_id: RunId,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Keyed by task id; `BTreeMap` keeps serialization deterministic.
    pub tasks: BTreeMap<TaskId, TaskState>,
    pub batches: Vec<BatchRecord>,
    #[serde(default)]
    pub usage: UsageTotals,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopInfo>,
}

/// A structural invariant of the run-state document does not hold.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaViolation {
    #[error("task {task} depends on {dependency}, which is not in the state")]
    MissingDependency { task: TaskId, dependency: TaskId },
    #[error("task {task} appears in more than one non-failed batch")]
    TaskInMultipleBatches { task: TaskId },
    #[error("updated_at precedes started_at")]
    ClockSkew,
    #[error("run is complete but task {task} is {status}")]
    IncompleteTask { task: TaskId, status: String },
    #[error("batch ids are not 1-based and consecutive")]
    BatchIdSequence,
}

impl RunState {
    pub fn new(project: impl Into<String>, run_id: RunId, now: DateTime<Utc>) -> Self {
        Self {
            project: project.into(),
            run_id,
            status: RunStatus::Pending,
            started_at: now,
            updated_at: now,
            tasks: BTreeMap::new(),
            batches: Vec::new(),
            usage: UsageTotals::default(),
            stop: None,
        }
    }

    /// Check the structural invariants that every persisted document must
    /// satisfy. Dependency presence is checked by the caller (it needs the
    /// manifests); everything else lives here.
    pub fn validate(&self) -> Result<(), SchemaViolation> {
        if self.updated_at < self.started_at {
            return Err(SchemaViolation::ClockSkew);
        }

        for (idx, batch) in self.batches.iter().enumerate() {
            if batch.batch_id != (idx as u64) + 1 {
                return Err(SchemaViolation::BatchIdSequence);
            }
        }

        let mut seen: std::collections::BTreeSet<&str> = std::collections::BTreeSet::new();
        for batch in &self.batches {
            if batch.status == BatchStatus::Failed {
                continue;
            }
            for task_id in &batch.task_ids {
                if !seen.insert(task_id.as_str()) {
                    return Err(SchemaViolation::TaskInMultipleBatches {
                        task: task_id.clone(),
                    });
                }
            }
        }

        if self.status == RunStatus::Complete {
            for (task_id, task) in &self.tasks {
                if !task.status.is_done() {
                    return Err(SchemaViolation::IncompleteTask {
                        task: task_id.clone(),
                        status: task.status.as_str().to_string(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Next 1-based batch id.
    pub fn next_batch_id(&self) -> u64 {
        self.batches.len() as u64 + 1
    }
}

/// Final outcome of a previously completed task, recorded in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerStatus {
    Complete,
    Skipped,
}

impl LedgerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Skipped => "skipped",
        }
    }
}

/// Content-addressed record of a task that merged and passed the
/// integration doctor. Authoritative for its fingerprint: future runs with
/// a matching fingerprint skip the task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub task_id: TaskId,
    pub fingerprint: String,
    pub status: LedgerStatus,
    pub merge_commit: String,
    pub integration_doctor_passed: bool,
    pub completed_at: DateTime<Utc>,
    pub run_id: RunId,
    pub source: String,
}
