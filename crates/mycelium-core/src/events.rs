//! Event model for the JSONL log streams.
//!
//! Producers build a typed event; the logger serialises it into a stable
//! `{ts, type, payload}` envelope, one JSON object per line. Task-scoped
//! events additionally carry `task_id` and `attempt` at the envelope level.
//! Readers parse payloads per event type.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{
    CanaryOutcome, DoctorTrigger, EnforcementMode, StopReason, TaskId, UsageTotals,
    ValidatorStatus,
};

/// Format a timestamp the way every envelope carries it: RFC3339 UTC with
/// millisecond precision.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

// --- Orchestrator stream (runs/<run_id>/orchestrator.jsonl) ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStartPayload {
    pub run_id: String,
    pub project: String,
    pub task_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchStartPayload {
    pub batch_id: u64,
    pub task_ids: Vec<TaskId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchCompletePayload {
    pub batch_id: u64,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchMergingPayload {
    pub batch_id: u64,
    pub branches: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchMergeConflictPayload {
    pub batch_id: u64,
    pub task_id: TaskId,
    pub branch: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationDoctorPayload {
    pub batch_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoctorCanaryPayload {
    pub batch_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<CanaryOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorEventPayload {
    pub validator: String,
    pub task_id: TaskId,
    pub mode: EnforcementMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ValidatorStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<DoctorTrigger>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetPayload {
    pub scope: String,
    pub metric: String,
    pub observed: f64,
    pub limit: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcomePayload {
    pub task_id: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStageMovePayload {
    pub task_id: TaskId,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStopPayload {
    pub signal: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaleRecoveryPayload {
    pub reset_count: usize,
    pub task_ids: Vec<TaskId>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerWritePayload {
    pub task_id: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Events written to the orchestrator stream.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    RunStart(RunStartPayload),
    BatchStart(BatchStartPayload),
    BatchComplete(BatchCompletePayload),
    BatchMerging(BatchMergingPayload),
    BatchMergeConflict(BatchMergeConflictPayload),
    DoctorIntegrationStart(IntegrationDoctorPayload),
    DoctorIntegrationPass(IntegrationDoctorPayload),
    DoctorIntegrationFail(IntegrationDoctorPayload),
    DoctorCanaryStart(DoctorCanaryPayload),
    DoctorCanaryUnexpectedPass(DoctorCanaryPayload),
    DoctorCanaryExpectedFail(DoctorCanaryPayload),
    DoctorCanarySkipped(DoctorCanaryPayload),
    ValidatorStart(ValidatorEventPayload),
    ValidatorPass(ValidatorEventPayload),
    ValidatorFail(ValidatorEventPayload),
    ValidatorError(ValidatorEventPayload),
    ValidatorBlock(ValidatorEventPayload),
    BudgetWarn(BudgetPayload),
    BudgetBlock(BudgetPayload),
    TaskComplete(TaskOutcomePayload),
    TaskFailed(TaskOutcomePayload),
    TaskReset(TaskOutcomePayload),
    TaskRetry(TaskOutcomePayload),
    TaskStageMove(TaskStageMovePayload),
    RunStop(RunStopPayload),
    RunStaleRecovery(StaleRecoveryPayload),
    LedgerWriteStart(LedgerWritePayload),
    LedgerWriteComplete(LedgerWritePayload),
    LedgerWriteError(LedgerWritePayload),
}

impl OrchestratorEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::RunStart(_) => "run.start",
            Self::BatchStart(_) => "batch.start",
            Self::BatchComplete(_) => "batch.complete",
            Self::BatchMerging(_) => "batch.merging",
            Self::BatchMergeConflict(_) => "batch.merge_conflict",
            Self::DoctorIntegrationStart(_) => "doctor.integration.start",
            Self::DoctorIntegrationPass(_) => "doctor.integration.pass",
            Self::DoctorIntegrationFail(_) => "doctor.integration.fail",
            Self::DoctorCanaryStart(_) => "doctor.canary.start",
            Self::DoctorCanaryUnexpectedPass(_) => "doctor.canary.unexpected_pass",
            Self::DoctorCanaryExpectedFail(_) => "doctor.canary.expected_fail",
            Self::DoctorCanarySkipped(_) => "doctor.canary.skipped",
            Self::ValidatorStart(_) => "validator.start",
            Self::ValidatorPass(_) => "validator.pass",
            Self::ValidatorFail(_) => "validator.fail",
            Self::ValidatorError(_) => "validator.error",
            Self::ValidatorBlock(_) => "validator.block",
            Self::BudgetWarn(_) => "budget.warn",
            Self::BudgetBlock(_) => "budget.block",
            Self::TaskComplete(_) => "task.complete",
            Self::TaskFailed(_) => "task.failed",
            Self::TaskReset(_) => "task.reset",
            Self::TaskRetry(_) => "task.retry",
            Self::TaskStageMove(_) => "task.stage.move",
            Self::RunStop(_) => "run.stop",
            Self::RunStaleRecovery(_) => "run.stale_recovery",
            Self::LedgerWriteStart(_) => "ledger.write.start",
            Self::LedgerWriteComplete(_) => "ledger.write.complete",
            Self::LedgerWriteError(_) => "ledger.write.error",
        }
    }

    fn payload_value(&self) -> Value {
        let result = match self {
            Self::RunStart(p) => serde_json::to_value(p),
            Self::BatchStart(p) => serde_json::to_value(p),
            Self::BatchComplete(p) => serde_json::to_value(p),
            Self::BatchMerging(p) => serde_json::to_value(p),
            Self::BatchMergeConflict(p) => serde_json::to_value(p),
            Self::DoctorIntegrationStart(p)
            | Self::DoctorIntegrationPass(p)
            | Self::DoctorIntegrationFail(p) => serde_json::to_value(p),
            Self::DoctorCanaryStart(p)
            | Self::DoctorCanaryUnexpectedPass(p)
            | Self::DoctorCanaryExpectedFail(p)
            | Self::DoctorCanarySkipped(p) => serde_json::to_value(p),
            Self::ValidatorStart(p)
            | Self::ValidatorPass(p)
            | Self::ValidatorFail(p)
            | Self::ValidatorError(p)
            | Self::ValidatorBlock(p) => serde_json::to_value(p),
            Self::BudgetWarn(p) | Self::BudgetBlock(p) => serde_json::to_value(p),
            Self::TaskComplete(p)
            | Self::TaskFailed(p)
            | Self::TaskReset(p)
            | Self::TaskRetry(p) => serde_json::to_value(p),
            Self::TaskStageMove(p) => serde_json::to_value(p),
            Self::RunStop(p) => serde_json::to_value(p),
            Self::RunStaleRecovery(p) => serde_json::to_value(p),
            Self::LedgerWriteStart(p)
            | Self::LedgerWriteComplete(p)
            | Self::LedgerWriteError(p) => serde_json::to_value(p),
        };
        result.unwrap_or(Value::Null)
    }

    /// Serialise into the `{ts, type, payload}` envelope.
    pub fn to_envelope(&self, ts: DateTime<Utc>) -> Value {
        serde_json::json!({
            "ts": format_ts(ts),
            "type": self.event_type(),
            "payload": self.payload_value(),
        })
    }
}

// --- Task stream (runs/<run_id>/tasks/<id>-<slug>/events.jsonl) ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnStartPayload {
    pub turn: u32,
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnCompletePayload {
    pub turn: u32,
    pub exit_code: i32,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageTotals>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandPayload {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub timed_out: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerPayload {
    pub container_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerErrorPayload {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPayload {
    pub turn: u32,
    pub reason: String,
}

/// Events written to a task's own stream by the worker runner.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    TurnStart(TurnStartPayload),
    TurnComplete(TurnCompletePayload),
    DoctorStart(CommandPayload),
    DoctorPass(CommandPayload),
    DoctorFail(CommandPayload),
    LintStart(CommandPayload),
    LintPass(CommandPayload),
    LintFail(CommandPayload),
    ContainerStart(ContainerPayload),
    ContainerExit(ContainerPayload),
    TaskRetry(RetryPayload),
    WorkerLocalError(WorkerErrorPayload),
}

impl TaskEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::TurnStart(_) => "turn.start",
            Self::TurnComplete(_) => "turn.complete",
            Self::DoctorStart(_) => "doctor.start",
            Self::DoctorPass(_) => "doctor.pass",
            Self::DoctorFail(_) => "doctor.fail",
            Self::LintStart(_) => "lint.start",
            Self::LintPass(_) => "lint.pass",
            Self::LintFail(_) => "lint.fail",
            Self::ContainerStart(_) => "container.start",
            Self::ContainerExit(_) => "container.exit",
            Self::TaskRetry(_) => "task.retry",
            Self::WorkerLocalError(_) => "worker.local.error",
        }
    }

    fn payload_value(&self) -> Value {
        let result = match self {
            Self::TurnStart(p) => serde_json::to_value(p),
            Self::TurnComplete(p) => serde_json::to_value(p),
            Self::DoctorStart(p)
            | Self::DoctorPass(p)
            | Self::DoctorFail(p)
            | Self::LintStart(p)
            | Self::LintPass(p)
            | Self::LintFail(p) => serde_json::to_value(p),
            Self::ContainerStart(p) | Self::ContainerExit(p) => serde_json::to_value(p),
            Self::TaskRetry(p) => serde_json::to_value(p),
            Self::WorkerLocalError(p) => serde_json::to_value(p),
        };
        result.unwrap_or(Value::Null)
    }

    /// Serialise into the task-scoped envelope carrying `task_id` and
    /// `attempt` alongside the common fields.
    pub fn to_envelope(&self, ts: DateTime<Utc>, task_id: &str, attempt: u32) -> Value {
        serde_json::json!({
            "ts": format_ts(ts),
            "type": self.event_type(),
            "task_id": task_id,
            "attempt": attempt,
            "payload": self.payload_value(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_ts_has_millisecond_precision() {
        let ts = DateTime::parse_from_rfc3339("2026-01-02T03:04:05.678901Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(format_ts(ts), "2026-01-02T03:04:05.678Z");
    }

    #[test]
    fn orchestrator_envelope_has_stable_shape() {
        let event = OrchestratorEvent::BatchStart(BatchStartPayload {
            batch_id: 1,
            task_ids: vec!["001".to_string(), "002".to_string()],
        });
        let envelope = event.to_envelope(Utc::now());
        assert_eq!(envelope["type"], "batch.start");
        assert_eq!(envelope["payload"]["batch_id"], 1);
        assert_eq!(envelope["payload"]["task_ids"][1], "002");
        assert!(envelope["ts"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn event_type_names_match_stream_contract() {
        let payload = IntegrationDoctorPayload {
            batch_id: 3,
            exit_code: Some(1),
            duration_ms: Some(10),
        };
        assert_eq!(
            OrchestratorEvent::DoctorIntegrationFail(payload.clone()).event_type(),
            "doctor.integration.fail"
        );
        assert_eq!(
            OrchestratorEvent::DoctorIntegrationStart(payload).event_type(),
            "doctor.integration.start"
        );
        assert_eq!(
            OrchestratorEvent::RunStaleRecovery(StaleRecoveryPayload {
                reset_count: 0,
                task_ids: vec![],
                reason: "stale".to_string(),
            })
            .event_type(),
            "run.stale_recovery"
        );
    }

    #[test]
    fn task_envelope_carries_task_id_and_attempt() {
        let event = TaskEvent::TurnComplete(TurnCompletePayload {
            turn: 1,
            exit_code: 0,
            duration_ms: 1500,
            usage: Some(UsageTotals {
                input_tokens: 10,
                cached_input_tokens: 0,
                output_tokens: 20,
                estimated_cost: 0.01,
            }),
            thread_id: Some("thr-1".to_string()),
        });
        let envelope = event.to_envelope(Utc::now(), "001", 2);
        assert_eq!(envelope["type"], "turn.complete");
        assert_eq!(envelope["task_id"], "001");
        assert_eq!(envelope["attempt"], 2);
        assert_eq!(envelope["payload"]["usage"]["input_tokens"], 10);
        assert_eq!(envelope["payload"]["thread_id"], "thr-1");
    }

    #[test]
    fn doctor_fail_envelope_records_timeout() {
        let event = TaskEvent::DoctorFail(CommandPayload {
            command: "cargo test".to_string(),
            exit_code: Some(-1),
            duration_ms: Some(600_000),
            timed_out: true,
            log_path: Some("doctor-1.log".to_string()),
        });
        let envelope = event.to_envelope(Utc::now(), "001", 1);
        assert_eq!(envelope["payload"]["timed_out"], true);
        assert_eq!(envelope["payload"]["exit_code"], -1);
    }
}
