//! Worker runner: one attempt of one task.
//!
//! Runs bootstrap commands, drives the coding agent through an initial turn
//! and bounded retry turns, then gates the attempt with lint and doctor
//! commands. Every agent turn and command invocation is streamed into the
//! task's JSONL log. The runner is synchronous from the engines'
//! perspective: the engine awaits it and receives a pure result.

use chrono::Utc;
use mycelium_core::config::{AgentConfig, DockerConfig};
use mycelium_core::events::{
    CommandPayload, ContainerPayload, RetryPayload, TaskEvent, TurnCompletePayload,
    TurnStartPayload, WorkerErrorPayload,
};
use mycelium_core::events::TaskOutcomePayload;
use mycelium_core::manifest::TaskManifest;
use mycelium_core::types::{CheckpointCommit, UsageTotals};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::command::{run_shell, truncate_output, CommandOutcome};
use crate::git;
use crate::logs::{OrchestratorLog, TaskLog};

/// Failure output included in a retry prompt is capped at this size.
const MAX_FAILURE_CONTEXT_BYTES: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("git error: {0}")]
    Git(#[from] git::GitError),
    #[error("command error: {0}")]
    Command(#[from] crate::command::CommandError),
}

pub type Result<T> = std::result::Result<T, WorkerError>;

/// Inputs for one attempt.
#[derive(Debug, Clone)]
pub struct WorkerInputs {
    pub task_id: String,
    pub task_slug: String,
    pub task_branch: String,
    pub workspace_path: PathBuf,
    /// Workspace-relative directory holding manifest.json and spec.md.
    pub task_relative_dir: PathBuf,
    pub attempt: u32,
    pub lint_command: Option<String>,
    pub lint_timeout_sec: u32,
    pub doctor_command: String,
    pub doctor_timeout_sec: u32,
    pub max_retries: u32,
    pub bootstrap_cmds: Vec<String>,
    pub agent: AgentConfig,
    pub docker: DockerConfig,
    pub checkpoint_commits: bool,
    pub default_test_paths: Vec<String>,
    /// Directory receiving doctor-<attempt>.log files.
    pub logs_dir: PathBuf,
    /// Worker-local state file, merged back by the task engine.
    pub worker_state_path: PathBuf,
    /// Debug hook: abort the process right after the container start has
    /// been persisted. Exercised by resume tests.
    pub crash_after_start: bool,
    /// Resume an existing agent thread instead of starting fresh.
    pub resume_thread_id: Option<String>,
    /// Stopped container to restart instead of creating a new one.
    pub container_id_hint: Option<String>,
}

/// Pure result of one attempt.
#[derive(Debug, Clone)]
pub struct WorkerRunnerResult {
    pub success: bool,
    pub error_message: Option<String>,
    /// The failure was transient (agent thread lost, cooperative stop);
    /// the task should return to `pending` and re-enter scheduling.
    pub reset_to_pending: bool,
    pub container_id: Option<String>,
    pub thread_id: Option<String>,
    pub usage: UsageTotals,
}

impl WorkerRunnerResult {
    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_message: Some(message.into()),
            reset_to_pending: false,
            container_id: None,
            thread_id: None,
            usage: UsageTotals::default(),
        }
    }
}

/// Worker-local durable state, written next to the task's logs so the task
/// engine can merge checkpoints and ids even if the worker dies later.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerLocalState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checkpoint_commits: Vec<CheckpointCommit>,
}

impl WorkerLocalState {
    pub fn load(path: &Path) -> Self {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default()
    }

    fn save(&self, path: &Path) {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Ok(body) = serde_json::to_string_pretty(self) {
            if let Err(e) = std::fs::write(path, body) {
                warn!(path = %path.display(), error = %e, "failed to write worker state");
            }
        }
    }
}

/// What a turn is reacting to; keys the retry guidance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureKind {
    Lint,
    Doctor,
}

impl FailureKind {
    fn guidance(self) -> &'static str {
        match self {
            Self::Lint => {
                "The lint command failed. Fix the lint findings below without changing behavior, \
                 then stop."
            }
            Self::Doctor => {
                "The verification command failed. Read the failure output below carefully and fix \
                 it before doing any new work."
            }
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Lint => "lint",
            Self::Doctor => "doctor",
        }
    }
}

/// One attempt of one task.
pub struct WorkerRunner<'a> {
    inputs: WorkerInputs,
    task_log: &'a TaskLog,
    orchestrator_log: &'a OrchestratorLog,
    cancel: CancellationToken,
}

impl<'a> WorkerRunner<'a> {
    pub fn new(
        inputs: WorkerInputs,
        task_log: &'a TaskLog,
        orchestrator_log: &'a OrchestratorLog,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inputs,
            task_log,
            orchestrator_log,
            cancel,
        }
    }

    /// Run the attempt. `on_container_ready` is invoked (and must persist
    /// state) before any agent work happens inside the container, so a
    /// crash afterwards can find and reuse it.
    pub async fn run(&self, on_container_ready: impl FnOnce(&str)) -> Result<WorkerRunnerResult> {
        let mut local_state = WorkerLocalState::load(&self.inputs.worker_state_path);

        // 1. Container lifecycle.
        let container_id = if self.inputs.docker.enabled {
            match self.start_container().await {
                Ok(id) => {
                    self.task_log.emit(
                        &TaskEvent::ContainerStart(ContainerPayload {
                            container_id: id.clone(),
                            exit_code: None,
                        }),
                        self.inputs.attempt,
                    );
                    local_state.container_id = Some(id.clone());
                    local_state.save(&self.inputs.worker_state_path);
                    on_container_ready(&id);
                    if self.inputs.crash_after_start {
                        // Resume tests kill the process here on purpose.
                        std::process::abort();
                    }
                    Some(id)
                }
                Err(message) => {
                    self.emit_local_error(&message);
                    return Ok(WorkerRunnerResult::failed(message));
                }
            }
        } else {
            if self.inputs.crash_after_start {
                std::process::abort();
            }
            None
        };

        // 2. Bootstrap, sequentially; the first non-zero exit is permanent
        // for this attempt.
        for cmd in &self.inputs.bootstrap_cmds {
            let outcome = self.exec(cmd, self.inputs.doctor_timeout_sec, &[], container_id.as_deref()).await?;
            if !outcome.passed() {
                let message = format!(
                    "bootstrap command failed (exit {}): {}",
                    outcome.exit_code, cmd
                );
                self.emit_local_error(&message);
                self.stop_container(container_id.as_deref()).await;
                let mut result = WorkerRunnerResult::failed(message);
                result.container_id = container_id;
                return Ok(result);
            }
        }

        // 3..4. Agent turns gated by lint and doctor.
        let result = self
            .run_turns(&mut local_state, container_id.as_deref())
            .await?;

        local_state.save(&self.inputs.worker_state_path);

        // 6. Stop (not remove) the container so resume can restart it.
        self.stop_container(container_id.as_deref()).await;

        let mut result = result;
        result.container_id = container_id;
        result.thread_id = local_state.thread_id.clone();
        Ok(result)
    }

    async fn run_turns(
        &self,
        local_state: &mut WorkerLocalState,
        container_id: Option<&str>,
    ) -> Result<WorkerRunnerResult> {
        let max_turns = self.inputs.max_retries + 1;
        let mut usage = UsageTotals::default();
        let mut pending_failure: Option<(FailureKind, String)> = None;
        let mut last_error = String::new();

        for turn in 1..=max_turns {
            if self.cancel.is_cancelled() {
                let mut result = WorkerRunnerResult::failed("stop requested during attempt");
                result.reset_to_pending = true;
                result.usage = usage;
                return Ok(result);
            }

            let kind = match (&pending_failure, &self.inputs.resume_thread_id) {
                (Some(_), _) => "retry",
                (None, Some(_)) if turn == 1 => "resume",
                _ => "initial",
            };
            self.task_log.emit(
                &TaskEvent::TurnStart(TurnStartPayload {
                    turn,
                    kind: kind.to_string(),
                }),
                self.inputs.attempt,
            );

            let prompt = match &pending_failure {
                Some((failure_kind, output)) => self.build_retry_prompt(*failure_kind, output),
                None => self.build_initial_prompt()?,
            };

            let turn_outcome = self.run_agent_turn(&prompt, local_state).await?;
            usage.absorb(&turn_outcome.usage);

            self.task_log.emit(
                &TaskEvent::TurnComplete(TurnCompletePayload {
                    turn,
                    exit_code: turn_outcome.exit_code,
                    duration_ms: turn_outcome.duration_ms,
                    usage: Some(turn_outcome.usage),
                    thread_id: local_state.thread_id.clone(),
                }),
                self.inputs.attempt,
            );

            if turn_outcome.transient {
                let mut result =
                    WorkerRunnerResult::failed(turn_outcome.error.unwrap_or_else(|| {
                        "agent reported a transient failure".to_string()
                    }));
                result.reset_to_pending = true;
                result.usage = usage;
                return Ok(result);
            }
            if let Some(error) = turn_outcome.error {
                self.emit_local_error(&error);
                let mut result = WorkerRunnerResult::failed(error);
                result.usage = usage;
                return Ok(result);
            }

            if self.inputs.checkpoint_commits {
                match git::commit_checkpoint(&self.inputs.workspace_path, self.inputs.attempt) {
                    Ok(Some(sha)) => {
                        local_state
                            .checkpoint_commits
                            .retain(|c| c.attempt != self.inputs.attempt);
                        local_state.checkpoint_commits.push(CheckpointCommit {
                            attempt: self.inputs.attempt,
                            sha,
                            created_at: Utc::now(),
                        });
                        local_state.save(&self.inputs.worker_state_path);
                    }
                    Ok(None) => {}
                    Err(e) => warn!(task_id = %self.inputs.task_id, error = %e, "checkpoint commit failed"),
                }
            }

            // Lint gate.
            if let Some(lint_cmd) = self.inputs.lint_command.clone() {
                let outcome = self
                    .gated_command(&lint_cmd, self.inputs.lint_timeout_sec, container_id, true)
                    .await?;
                if !outcome.passed() {
                    last_error = format!("lint failed (exit {})", outcome.exit_code);
                    if turn < max_turns {
                        self.emit_retry(turn, FailureKind::Lint);
                        pending_failure = Some((
                            FailureKind::Lint,
                            truncate_output(&outcome.combined_output(), MAX_FAILURE_CONTEXT_BYTES),
                        ));
                        continue;
                    }
                    let mut result = WorkerRunnerResult::failed(last_error);
                    result.usage = usage;
                    return Ok(result);
                }
            }

            // Doctor gate.
            let outcome = self
                .gated_command(
                    &self.inputs.doctor_command,
                    self.inputs.doctor_timeout_sec,
                    container_id,
                    false,
                )
                .await?;
            if outcome.passed() {
                info!(task_id = %self.inputs.task_id, turn, "attempt succeeded");
                return Ok(WorkerRunnerResult {
                    success: true,
                    error_message: None,
                    reset_to_pending: false,
                    container_id: None,
                    thread_id: local_state.thread_id.clone(),
                    usage,
                });
            }

            last_error = if outcome.timed_out {
                format!(
                    "doctor timed out after {}s",
                    self.inputs.doctor_timeout_sec
                )
            } else {
                format!("doctor failed (exit {})", outcome.exit_code)
            };
            if turn < max_turns {
                self.emit_retry(turn, FailureKind::Doctor);
                pending_failure = Some((
                    FailureKind::Doctor,
                    truncate_output(&outcome.combined_output(), MAX_FAILURE_CONTEXT_BYTES),
                ));
            }
        }

        let mut result = WorkerRunnerResult::failed(last_error);
        result.usage = usage;
        Ok(result)
    }

    /// Run lint or doctor, streaming the start/pass/fail events and (for
    /// doctor) writing the raw output log.
    async fn gated_command(
        &self,
        command: &str,
        timeout_sec: u32,
        container_id: Option<&str>,
        is_lint: bool,
    ) -> Result<CommandOutcome> {
        let start_payload = CommandPayload {
            command: command.to_string(),
            exit_code: None,
            duration_ms: None,
            timed_out: false,
            log_path: None,
        };
        let start_event = if is_lint {
            TaskEvent::LintStart(start_payload.clone())
        } else {
            TaskEvent::DoctorStart(start_payload.clone())
        };
        self.task_log.emit(&start_event, self.inputs.attempt);

        let outcome = self.exec(command, timeout_sec, &[], container_id).await?;

        let log_path = if is_lint {
            None
        } else {
            let path = self
                .inputs
                .logs_dir
                .join(format!("doctor-{}.log", self.inputs.attempt));
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            if let Err(e) = std::fs::write(&path, outcome.combined_output()) {
                warn!(path = %path.display(), error = %e, "failed to write doctor log");
            }
            Some(path.display().to_string())
        };

        let done_payload = CommandPayload {
            command: command.to_string(),
            exit_code: Some(outcome.exit_code),
            duration_ms: Some(outcome.duration_ms),
            timed_out: outcome.timed_out,
            log_path,
        };
        let event = match (is_lint, outcome.passed()) {
            (true, true) => TaskEvent::LintPass(done_payload),
            (true, false) => TaskEvent::LintFail(done_payload),
            (false, true) => TaskEvent::DoctorPass(done_payload),
            (false, false) => TaskEvent::DoctorFail(done_payload),
        };
        self.task_log.emit(&event, self.inputs.attempt);

        Ok(outcome)
    }

    /// Execute a shell command in the workspace, inside the container when
    /// one is running.
    async fn exec(
        &self,
        command: &str,
        timeout_sec: u32,
        envs: &[(String, String)],
        container_id: Option<&str>,
    ) -> Result<CommandOutcome> {
        let effective = match container_id {
            Some(id) => format!("docker exec {} sh -c {}", id, shell_quote(command)),
            None => command.to_string(),
        };
        Ok(run_shell(&effective, &self.inputs.workspace_path, timeout_sec, envs).await?)
    }

    async fn run_agent_turn(
        &self,
        prompt: &str,
        local_state: &mut WorkerLocalState,
    ) -> Result<AgentTurnOutcome> {
        let agent = &self.inputs.agent;
        let mut command = format!(
            "{} -p --output-format json --dangerously-skip-permissions --model {}",
            agent.bin, agent.model
        );
        if let Some(effort) = &agent.reasoning_effort {
            command.push_str(&format!(" --reasoning-effort {effort}"));
        }
        if let Some(config_dir) = &agent.config_dir {
            command.push_str(&format!(
                " --settings {}",
                shell_quote(&config_dir.display().to_string())
            ));
        }
        if let Some(thread_id) = local_state
            .thread_id
            .as_deref()
            .or(self.inputs.resume_thread_id.as_deref())
        {
            command.push_str(&format!(" --resume {thread_id}"));
        }
        command.push(' ');
        command.push_str(&shell_quote(prompt));

        let outcome = run_shell(
            &command,
            &self.inputs.workspace_path,
            agent.turn_timeout_sec,
            &[],
        )
        .await?;

        if outcome.timed_out {
            return Ok(AgentTurnOutcome {
                exit_code: outcome.exit_code,
                duration_ms: outcome.duration_ms,
                usage: UsageTotals::default(),
                error: Some(format!(
                    "agent turn timed out after {}s",
                    agent.turn_timeout_sec
                )),
                transient: false,
            });
        }

        let parsed = parse_agent_output(&outcome.stdout);
        if let Some(thread_id) = parsed.thread_id {
            local_state.thread_id = Some(thread_id);
        }

        if outcome.exit_code != 0 {
            let message = format!(
                "agent exited {}: {}",
                outcome.exit_code,
                truncate_output(&outcome.combined_output(), 1024)
            );
            return Ok(AgentTurnOutcome {
                exit_code: outcome.exit_code,
                duration_ms: outcome.duration_ms,
                usage: parsed.usage,
                error: Some(message),
                transient: parsed.transient,
            });
        }

        Ok(AgentTurnOutcome {
            exit_code: 0,
            duration_ms: outcome.duration_ms,
            usage: parsed.usage,
            error: None,
            transient: false,
        })
    }

    fn build_initial_prompt(&self) -> Result<String> {
        let task_dir = self
            .inputs
            .workspace_path
            .join(&self.inputs.task_relative_dir);
        let spec = std::fs::read_to_string(task_dir.join("spec.md")).unwrap_or_default();
        let manifest_raw =
            std::fs::read_to_string(task_dir.join("manifest.json")).unwrap_or_default();
        let manifest: Option<TaskManifest> = serde_json::from_str(&manifest_raw).ok();

        let mut prompt = String::new();
        prompt.push_str(&format!(
            "You are implementing task {} ({}) on branch {}.\n\n",
            self.inputs.task_id, self.inputs.task_slug, self.inputs.task_branch
        ));
        if let Some(manifest) = &manifest {
            prompt.push_str(&format!("Task description: {}\n\n", manifest.description));
            if !manifest.files.writes.is_empty() {
                prompt.push_str(&format!(
                    "Only modify files matching: {}\n",
                    manifest
                        .files
                        .writes
                        .iter()
                        .cloned()
                        .collect::<Vec<_>>()
                        .join(", ")
                ));
            }
            if !manifest.test_paths.is_empty() {
                prompt.push_str(&format!(
                    "Tests for this task live at: {}\n",
                    manifest
                        .test_paths
                        .iter()
                        .cloned()
                        .collect::<Vec<_>>()
                        .join(", ")
                ));
            } else if !self.inputs.default_test_paths.is_empty() {
                prompt.push_str(&format!(
                    "Project tests live at: {}\n",
                    self.inputs.default_test_paths.join(", ")
                ));
            }
        }
        prompt.push_str(&format!(
            "\nFull task spec ({}/spec.md):\n\n{}\n",
            self.inputs.task_relative_dir.display(),
            spec
        ));
        prompt.push_str(&format!(
            "\nWhen you are done, the command `{}` must exit zero.\n",
            self.inputs.doctor_command
        ));
        Ok(prompt)
    }

    fn build_retry_prompt(&self, kind: FailureKind, failure_output: &str) -> String {
        format!(
            "{}\n\n--- {} output ---\n{}\n",
            kind.guidance(),
            kind.as_str(),
            failure_output
        )
    }

    fn emit_retry(&self, turn: u32, kind: FailureKind) {
        self.task_log.emit(
            &TaskEvent::TaskRetry(RetryPayload {
                turn,
                reason: kind.as_str().to_string(),
            }),
            self.inputs.attempt,
        );
        self.orchestrator_log
            .emit(&mycelium_core::events::OrchestratorEvent::TaskRetry(
                TaskOutcomePayload {
                    task_id: self.inputs.task_id.clone(),
                    error: Some(format!("{} failed", kind.as_str())),
                    attempts: Some(self.inputs.attempt),
                },
            ));
    }

    fn emit_local_error(&self, message: &str) {
        warn!(task_id = %self.inputs.task_id, message, "worker error");
        self.task_log.emit(
            &TaskEvent::WorkerLocalError(WorkerErrorPayload {
                message: message.to_string(),
            }),
            self.inputs.attempt,
        );
    }

    async fn start_container(&self) -> std::result::Result<String, String> {
        // Restart a stopped container from a previous attempt if hinted.
        if let Some(hint) = &self.inputs.container_id_hint {
            let restart = run_shell(
                &format!("docker start {hint}"),
                &self.inputs.workspace_path,
                60,
                &[],
            )
            .await;
            if matches!(&restart, Ok(outcome) if outcome.passed()) {
                return Ok(hint.clone());
            }
            warn!(container_id = %hint, "container hint did not restart; creating fresh");
        }

        let image = self
            .inputs
            .docker
            .image
            .clone()
            .ok_or_else(|| "docker enabled without an image".to_string())?;
        let command = format!(
            "docker run -d -v {}:/workspace -w /workspace {} sleep infinity",
            shell_quote(&self.inputs.workspace_path.display().to_string()),
            shell_quote(&image)
        );
        let outcome = run_shell(&command, &self.inputs.workspace_path, 120, &[])
            .await
            .map_err(|e| format!("docker run failed: {e}"))?;
        if !outcome.passed() {
            return Err(format!(
                "docker run failed (exit {}): {}",
                outcome.exit_code,
                outcome.stderr.trim()
            ));
        }
        Ok(outcome.stdout.trim().to_string())
    }

    /// Stop (not remove) the container; resume restarts it.
    async fn stop_container(&self, container_id: Option<&str>) {
        let Some(id) = container_id else { return };
        let command = format!(
            "docker stop -t {} {}",
            self.inputs.docker.stop_timeout_sec, id
        );
        let exit_code = match run_shell(&command, &self.inputs.workspace_path, 120, &[]).await {
            Ok(outcome) => Some(outcome.exit_code),
            Err(e) => {
                warn!(container_id = %id, error = %e, "docker stop failed");
                None
            }
        };
        self.task_log.emit(
            &TaskEvent::ContainerExit(ContainerPayload {
                container_id: id.to_string(),
                exit_code,
            }),
            self.inputs.attempt,
        );
    }
}

/// Remove a task's container entirely. Idempotent: a missing container is
/// logged, never an error.
pub async fn cleanup_task(workspace_hint: &Path, container_id_hint: Option<&str>) {
    let Some(id) = container_id_hint else { return };
    let cwd = if workspace_hint.is_dir() {
        workspace_hint.to_path_buf()
    } else {
        PathBuf::from(".")
    };
    match run_shell(&format!("docker rm -f {id}"), &cwd, 60, &[]).await {
        Ok(outcome) if outcome.passed() => {
            info!(container_id = %id, "container removed");
        }
        Ok(outcome) => {
            info!(container_id = %id, exit_code = outcome.exit_code, "container already gone");
        }
        Err(e) => warn!(container_id = %id, error = %e, "container cleanup failed"),
    }
}

#[derive(Debug)]
struct AgentTurnOutcome {
    exit_code: i32,
    duration_ms: u64,
    usage: UsageTotals,
    error: Option<String>,
    transient: bool,
}

#[derive(Debug, Default)]
struct ParsedAgentOutput {
    usage: UsageTotals,
    thread_id: Option<String>,
    transient: bool,
}

/// Parse the agent CLI's JSON result from stdout.
///
/// The agent prints one JSON object (possibly after other output); the last
/// parseable JSON line wins. Usage fields and the session/thread id are
/// extracted tolerantly; a `thread_lost` subtype marks the failure
/// transient so the task re-queues instead of failing.
fn parse_agent_output(stdout: &str) -> ParsedAgentOutput {
    let mut parsed = ParsedAgentOutput::default();

    let value = stdout
        .lines()
        .rev()
        .find_map(|line| serde_json::from_str::<serde_json::Value>(line.trim()).ok());
    let Some(value) = value else {
        return parsed;
    };

    if let Some(usage) = value.get("usage") {
        parsed.usage = UsageTotals {
            input_tokens: usage["input_tokens"].as_u64().unwrap_or(0),
            cached_input_tokens: usage["cache_read_input_tokens"]
                .as_u64()
                .or_else(|| usage["cached_input_tokens"].as_u64())
                .unwrap_or(0),
            output_tokens: usage["output_tokens"].as_u64().unwrap_or(0),
            estimated_cost: value["total_cost_usd"]
                .as_f64()
                .or_else(|| value["estimated_cost"].as_f64())
                .unwrap_or(0.0),
        };
    }

    parsed.thread_id = value["session_id"]
        .as_str()
        .or_else(|| value["thread_id"].as_str())
        .map(str::to_string);

    parsed.transient = value["subtype"].as_str() == Some("thread_lost")
        || value["transient"].as_bool() == Some(true);

    parsed
}

/// Quote a string for `sh -c` embedding.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
