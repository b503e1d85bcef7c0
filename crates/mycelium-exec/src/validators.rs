//! Post-hoc validators over a finished task.
//!
//! Validators are independent LLM-judged checks on a task's diff and
//! artifacts. Each runs in declared order (test, style, architecture) with
//! its configured mode: `warn` contributes a result entry but never blocks;
//! `block` with a failing verdict produces a blocked entry that parks the
//! task for human review. The doctor validator is batch-level and
//! trigger-driven rather than per task.

use chrono::Utc;
use mycelium_core::config::ValidatorsConfig;
use mycelium_core::events::{OrchestratorEvent, ValidatorEventPayload};
use mycelium_core::types::{DoctorTrigger, EnforcementMode, ValidatorResult, ValidatorStatus};
use serde::{Deserialize, Serialize};
use std::process::Command;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::command::truncate_output;
use crate::logs::OrchestratorLog;
use crate::paths::{ts_compact, RunPaths};

/// Doctor-run log snippets handed to the doctor validator are capped here.
const DOCTOR_SNIPPET_BYTES: usize = 2 * 1024;
/// The doctor validator sees at most this many recent runs, newest first.
const DOCTOR_MAX_RUNS: usize = 6;

#[derive(Debug, Error)]
pub enum ValidatorError {
    #[error("llm call failed: {0}")]
    Llm(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ValidatorError>;

/// Response contract of the LLM client used by validators.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub text: String,
    /// JSON parsed from the response when a schema was requested.
    pub parsed: Option<serde_json::Value>,
    pub finish_reason: String,
}

/// Minimal LLM interface the validators consume. The production client
/// shells out to the agent CLI; tests script the responses.
pub trait LlmClient: Send + Sync {
    fn complete(&self, prompt: &str, schema: Option<&serde_json::Value>) -> Result<LlmResponse>;
}

/// LLM client backed by the agent CLI in print mode.
#[derive(Debug, Clone)]
pub struct AgentCliClient {
    pub bin: String,
    pub model: String,
}

impl LlmClient for AgentCliClient {
    fn complete(&self, prompt: &str, schema: Option<&serde_json::Value>) -> Result<LlmResponse> {
        let mut full_prompt = prompt.to_string();
        if let Some(schema) = schema {
            full_prompt.push_str(&format!(
                "\n\nRespond with a single JSON object matching this schema, nothing else:\n{schema}"
            ));
        }

        let output = Command::new(&self.bin)
            .args(["-p", "--output-format", "json", "--model", &self.model])
            .arg(&full_prompt)
            .output()
            .map_err(|e| ValidatorError::Llm(format!("failed to spawn {}: {e}", self.bin)))?;
        if !output.status.success() {
            return Err(ValidatorError::Llm(format!(
                "agent exited {}: {}",
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        // The CLI wraps the answer in a result envelope; the validator text
        // is the `result` field when present.
        let envelope: Option<serde_json::Value> = stdout
            .lines()
            .rev()
            .find_map(|line| serde_json::from_str(line.trim()).ok());
        let text = envelope
            .as_ref()
            .and_then(|v| v["result"].as_str())
            .map_or_else(|| stdout.trim().to_string(), str::to_string);
        let parsed = extract_json_object(&text);

        Ok(LlmResponse {
            text,
            parsed,
            finish_reason: "stop".to_string(),
        })
    }
}

/// Pull the first JSON object out of free-form model text.
fn extract_json_object(text: &str) -> Option<serde_json::Value> {
    if let Ok(value) = serde_json::from_str(text.trim()) {
        return Some(value);
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    serde_json::from_str(&text[start..=end]).ok()
}

/// What the pipeline knows about a finished task.
#[derive(Debug, Clone)]
pub struct TaskValidationContext {
    pub task_id: String,
    pub slug: String,
    pub description: String,
    pub changed_files: Vec<String>,
    pub diff_summary: String,
    pub test_paths: Vec<String>,
}

/// A validator verdict that blocks the task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockedEntry {
    pub validator: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_path: Option<String>,
    pub mode: EnforcementMode,
    pub status: ValidatorStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<DoctorTrigger>,
}

/// Pipeline output for one task.
#[derive(Debug, Clone)]
pub struct TaskValidationReport {
    pub task_id: String,
    pub results: Vec<ValidatorResult>,
    pub blocked: Vec<BlockedEntry>,
}

/// One doctor invocation record fed to the doctor validator.
#[derive(Debug, Clone)]
pub struct DoctorRunRecord {
    pub task_id: String,
    pub passed: bool,
    pub log_snippet: String,
}

/// Verdict of the batch-level doctor validator.
#[derive(Debug, Clone)]
pub struct DoctorValidatorVerdict {
    pub effective: bool,
    pub result: ValidatorResult,
    pub blocked: Option<BlockedEntry>,
}

pub struct ValidationPipeline {
    config: ValidatorsConfig,
    llm: Arc<dyn LlmClient>,
    paths: RunPaths,
    repo_path: std::path::PathBuf,
}

impl ValidationPipeline {
    pub fn new(
        config: ValidatorsConfig,
        llm: Arc<dyn LlmClient>,
        paths: RunPaths,
        repo_path: std::path::PathBuf,
    ) -> Self {
        Self {
            config,
            llm,
            paths,
            repo_path,
        }
    }

    /// Run the enabled per-task validators in declared order.
    pub fn run_for_task(
        &self,
        context: &TaskValidationContext,
        log: &OrchestratorLog,
    ) -> TaskValidationReport {
        let mut results = Vec::new();
        let mut blocked = Vec::new();

        if self.config.test.mode.is_enabled() {
            self.run_one(
                "test",
                self.config.test.mode,
                &self.test_prompt(context),
                context,
                log,
                &mut results,
                &mut blocked,
            );
        }
        if self.config.style.mode.is_enabled() {
            self.run_one(
                "style",
                self.config.style.mode,
                &self.style_prompt(context),
                context,
                log,
                &mut results,
                &mut blocked,
            );
        }
        if self.config.architecture.mode.is_enabled() {
            self.run_architecture(context, log, &mut results, &mut blocked);
        }

        TaskValidationReport {
            task_id: context.task_id.clone(),
            results,
            blocked,
        }
    }

    fn run_architecture(
        &self,
        context: &TaskValidationContext,
        log: &OrchestratorLog,
        results: &mut Vec<ValidatorResult>,
        blocked: &mut Vec<BlockedEntry>,
    ) {
        let docs: Vec<String> = self
            .config
            .architecture
            .docs_paths
            .iter()
            .filter(|p| self.repo_path.join(p).exists())
            .cloned()
            .collect();

        if docs.is_empty() {
            if self.config.architecture.fail_if_docs_missing {
                let result = ValidatorResult {
                    validator: "architecture".to_string(),
                    status: ValidatorStatus::Fail,
                    mode: self.config.architecture.mode,
                    summary: Some("architecture docs are missing".to_string()),
                    report_path: None,
                    trigger: None,
                };
                self.emit(log, &result, context);
                if self.config.architecture.mode == EnforcementMode::Block {
                    blocked.push(BlockedEntry {
                        validator: "architecture".to_string(),
                        reason: "architecture docs are missing".to_string(),
                        summary: result.summary.clone(),
                        report_path: None,
                        mode: result.mode,
                        status: result.status,
                        trigger: None,
                    });
                }
                results.push(result);
            }
            // Docs absent and tolerated: validator is skipped entirely.
            return;
        }

        let doc_text: String = docs
            .iter()
            .filter_map(|p| std::fs::read_to_string(self.repo_path.join(p)).ok())
            .collect::<Vec<_>>()
            .join("\n\n");
        let prompt = format!(
            "You are an architecture reviewer. Given the project's architecture notes and a \
             task's change summary, judge whether the change respects the documented structure.\n\n\
             Architecture notes:\n{}\n\nTask {}: {}\nChanged files:\n{}\n\nDiff summary:\n{}",
            truncate_output(&doc_text, 16 * 1024),
            context.task_id,
            context.description,
            context.changed_files.join("\n"),
            context.diff_summary,
        );
        self.run_one(
            "architecture",
            self.config.architecture.mode,
            &prompt,
            context,
            log,
            results,
            blocked,
        );
    }

    /// Invoke one LLM validator, persist its report, record the result and
    /// any blocked entry.
    fn run_one(
        &self,
        validator: &str,
        mode: EnforcementMode,
        prompt: &str,
        context: &TaskValidationContext,
        log: &OrchestratorLog,
        results: &mut Vec<ValidatorResult>,
        blocked: &mut Vec<BlockedEntry>,
    ) {
        log.emit(&OrchestratorEvent::ValidatorStart(ValidatorEventPayload {
            validator: validator.to_string(),
            task_id: context.task_id.clone(),
            mode,
            status: None,
            summary: None,
            trigger: None,
        }));

        let schema = verdict_schema();
        let (status, summary, report_body) = match self.llm.complete(prompt, Some(&schema)) {
            Ok(response) => match response.parsed.as_ref() {
                Some(parsed) => {
                    let pass = parsed["pass"].as_bool().unwrap_or(false);
                    let summary = parsed["summary"].as_str().map(str::to_string);
                    (
                        if pass {
                            ValidatorStatus::Pass
                        } else {
                            ValidatorStatus::Fail
                        },
                        summary,
                        parsed.clone(),
                    )
                }
                None => (
                    ValidatorStatus::Error,
                    Some("validator response was not valid JSON".to_string()),
                    serde_json::json!({"raw": response.text}),
                ),
            },
            Err(e) => (
                ValidatorStatus::Error,
                Some(e.to_string()),
                serde_json::json!({"error": e.to_string()}),
            ),
        };

        let report_path = self.write_report(validator, context, &report_body);

        let result = ValidatorResult {
            validator: validator.to_string(),
            status,
            mode,
            summary: summary.clone(),
            report_path: report_path.clone(),
            trigger: None,
        };
        self.emit(log, &result, context);

        // An erroring validator never blocks; only an explicit failing
        // verdict in block mode does.
        if mode == EnforcementMode::Block && status == ValidatorStatus::Fail {
            log.emit(&OrchestratorEvent::ValidatorBlock(ValidatorEventPayload {
                validator: validator.to_string(),
                task_id: context.task_id.clone(),
                mode,
                status: Some(status),
                summary: summary.clone(),
                trigger: None,
            }));
            blocked.push(BlockedEntry {
                validator: validator.to_string(),
                reason: summary
                    .clone()
                    .unwrap_or_else(|| format!("{validator} validator failed")),
                summary,
                report_path,
                mode,
                status,
                trigger: None,
            });
        }

        results.push(result);
    }

    /// Batch-level doctor validator: analyse recent doctor runs together
    /// with a diff summary against mainline.
    pub fn run_doctor_validator(
        &self,
        trigger: DoctorTrigger,
        recent_runs: &[DoctorRunRecord],
        diff_summary: &str,
        log: &OrchestratorLog,
    ) -> DoctorValidatorVerdict {
        let mode = self.config.doctor.mode;
        log.emit(&OrchestratorEvent::ValidatorStart(ValidatorEventPayload {
            validator: "doctor".to_string(),
            task_id: String::new(),
            mode,
            status: None,
            summary: None,
            trigger: Some(trigger),
        }));

        let mut prompt = String::from(
            "You are auditing a project's doctor command (the shell command that gates merges). \
             Judge whether it is effective: does it actually exercise the code that changed?\n\n",
        );
        prompt.push_str(&format!("Trigger: {}\n\nRecent doctor runs (newest first):\n", trigger.as_str()));
        for run in recent_runs.iter().take(DOCTOR_MAX_RUNS) {
            prompt.push_str(&format!(
                "- task {} [{}]\n{}\n",
                run.task_id,
                if run.passed { "pass" } else { "fail" },
                truncate_output(&run.log_snippet, DOCTOR_SNIPPET_BYTES),
            ));
        }
        prompt.push_str(&format!("\nDiff summary against mainline:\n{diff_summary}\n"));

        let schema = serde_json::json!({
            "type": "object",
            "properties": {
                "effective": {"type": "boolean"},
                "coverage_assessment": {"type": "string"},
                "concerns": {"type": "array", "items": {"type": "string"}},
                "recommendations": {"type": "array", "items": {"type": "string"}},
                "confidence": {"type": "number"}
            },
            "required": ["effective", "coverage_assessment"]
        });

        let (effective, status, summary, report_body) =
            match self.llm.complete(&prompt, Some(&schema)) {
                Ok(response) => match response.parsed.as_ref() {
                    Some(parsed) => {
                        let effective = parsed["effective"].as_bool().unwrap_or(true);
                        (
                            effective,
                            if effective {
                                ValidatorStatus::Pass
                            } else {
                                ValidatorStatus::Fail
                            },
                            parsed["coverage_assessment"].as_str().map(str::to_string),
                            parsed.clone(),
                        )
                    }
                    None => (
                        true,
                        ValidatorStatus::Error,
                        Some("doctor validator response was not valid JSON".to_string()),
                        serde_json::json!({"raw": response.text}),
                    ),
                },
                Err(e) => (
                    true,
                    ValidatorStatus::Error,
                    Some(e.to_string()),
                    serde_json::json!({"error": e.to_string()}),
                ),
            };

        let context = TaskValidationContext {
            task_id: "batch".to_string(),
            slug: "doctor".to_string(),
            description: String::new(),
            changed_files: Vec::new(),
            diff_summary: String::new(),
            test_paths: Vec::new(),
        };
        let report_path = self.write_report("doctor", &context, &report_body);

        let result = ValidatorResult {
            validator: "doctor".to_string(),
            status,
            mode,
            summary: summary.clone(),
            report_path: report_path.clone(),
            trigger: Some(trigger),
        };
        self.emit(log, &result, &context);

        let blocked = if mode == EnforcementMode::Block && !effective && status == ValidatorStatus::Fail
        {
            log.emit(&OrchestratorEvent::ValidatorBlock(ValidatorEventPayload {
                validator: "doctor".to_string(),
                task_id: String::new(),
                mode,
                status: Some(status),
                summary: summary.clone(),
                trigger: Some(trigger),
            }));
            Some(BlockedEntry {
                validator: "doctor".to_string(),
                reason: summary
                    .clone()
                    .unwrap_or_else(|| "doctor command judged ineffective".to_string()),
                summary,
                report_path,
                mode,
                status,
                trigger: Some(trigger),
            })
        } else {
            None
        };

        DoctorValidatorVerdict {
            effective,
            result,
            blocked,
        }
    }

    fn emit(&self, log: &OrchestratorLog, result: &ValidatorResult, context: &TaskValidationContext) {
        let payload = ValidatorEventPayload {
            validator: result.validator.clone(),
            task_id: context.task_id.clone(),
            mode: result.mode,
            status: Some(result.status),
            summary: result.summary.clone(),
            trigger: result.trigger,
        };
        let event = match result.status {
            ValidatorStatus::Pass => OrchestratorEvent::ValidatorPass(payload),
            ValidatorStatus::Fail => OrchestratorEvent::ValidatorFail(payload),
            ValidatorStatus::Error => OrchestratorEvent::ValidatorError(payload),
        };
        log.emit(&event);
        info!(
            validator = %result.validator,
            task_id = %context.task_id,
            status = result.status.as_str(),
            "validator finished"
        );
    }

    fn write_report(
        &self,
        validator: &str,
        context: &TaskValidationContext,
        body: &serde_json::Value,
    ) -> Option<String> {
        let path = self.paths.validator_report_path(
            validator,
            &context.task_id,
            &context.slug,
            &ts_compact(Utc::now()),
        );
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!(error = %e, "failed to create validator report dir");
                return None;
            }
        }
        match std::fs::write(&path, serde_json::to_string_pretty(body).unwrap_or_default()) {
            Ok(()) => Some(path.display().to_string()),
            Err(e) => {
                // Report-write failures never fail the batch.
                warn!(path = %path.display(), error = %e, "failed to write validator report");
                None
            }
        }
    }

    fn test_prompt(&self, context: &TaskValidationContext) -> String {
        format!(
            "You are a test reviewer. Judge whether the change for task {} ({}) is adequately \
             tested.\n\nDescription: {}\nDeclared test paths:\n{}\nChanged files:\n{}\n\nDiff \
             summary:\n{}\n\nReport pass=false if meaningful behavior changed without test \
             coverage.",
            context.task_id,
            context.slug,
            context.description,
            context.test_paths.join("\n"),
            context.changed_files.join("\n"),
            context.diff_summary,
        )
    }

    fn style_prompt(&self, context: &TaskValidationContext) -> String {
        format!(
            "You are a style reviewer. Judge whether the change for task {} ({}) matches the \
             surrounding code's conventions.\n\nChanged files:\n{}\n\nDiff summary:\n{}",
            context.task_id,
            context.slug,
            context.changed_files.join("\n"),
            context.diff_summary,
        )
    }
}

fn verdict_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "pass": {"type": "boolean"},
            "summary": {"type": "string"},
            "concerns": {"type": "array", "items": {"type": "string"}},
            "coverage_gaps": {"type": "array", "items": {"type": "string"}},
            "recommendations": {"type": "array", "items": {"type": "string"}},
            "confidence": {"type": "number"}
        },
        "required": ["pass", "summary"]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mycelium_core::config::{
        ArchitectureValidatorConfig, DoctorValidatorConfig, ValidatorConfig,
    };
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// LLM stub returning canned responses in order.
    struct ScriptedLlm {
        responses: Mutex<Vec<Result<LlmResponse>>>,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedLlm {
        fn new(responses: Vec<Result<LlmResponse>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                prompts: Mutex::new(Vec::new()),
            }
        }

        fn json(value: serde_json::Value) -> Result<LlmResponse> {
            Ok(LlmResponse {
                text: value.to_string(),
                parsed: Some(value),
                finish_reason: "stop".to_string(),
            })
        }
    }

    impl LlmClient for ScriptedLlm {
        fn complete(&self, prompt: &str, _schema: Option<&serde_json::Value>) -> Result<LlmResponse> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(ValidatorError::Llm("no scripted response".to_string()));
            }
            responses.remove(0)
        }
    }

    fn context() -> TaskValidationContext {
        TaskValidationContext {
            task_id: "001".to_string(),
            slug: "demo".to_string(),
            description: "demo task".to_string(),
            changed_files: vec!["src/lib.rs".to_string()],
            diff_summary: "1 file changed".to_string(),
            test_paths: vec!["tests/demo.rs".to_string()],
        }
    }

    fn pipeline(
        config: ValidatorsConfig,
        llm: Arc<dyn LlmClient>,
        home: &TempDir,
    ) -> (ValidationPipeline, OrchestratorLog) {
        let paths = RunPaths::new(home.path(), "demo", "r1");
        let log = OrchestratorLog::open(&paths.orchestrator_log_path()).unwrap();
        (
            ValidationPipeline::new(config, llm, paths, home.path().to_path_buf()),
            log,
        )
    }

    fn validators(test: EnforcementMode, style: EnforcementMode) -> ValidatorsConfig {
        ValidatorsConfig {
            test: ValidatorConfig { mode: test },
            style: ValidatorConfig { mode: style },
            architecture: ArchitectureValidatorConfig::default(),
            doctor: DoctorValidatorConfig::default(),
        }
    }

    #[test]
    fn passing_validator_yields_pass_result() {
        let home = TempDir::new().unwrap();
        let llm = Arc::new(ScriptedLlm::new(vec![ScriptedLlm::json(
            serde_json::json!({"pass": true, "summary": "well tested"}),
        )]));
        let (pipeline, log) = pipeline(
            validators(EnforcementMode::Block, EnforcementMode::Off),
            llm,
            &home,
        );

        let report = pipeline.run_for_task(&context(), &log);
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].validator, "test");
        assert_eq!(report.results[0].status, ValidatorStatus::Pass);
        assert!(report.blocked.is_empty());
        assert!(report.results[0].report_path.is_some());
    }

    #[test]
    fn failing_block_validator_blocks_the_task() {
        let home = TempDir::new().unwrap();
        let llm = Arc::new(ScriptedLlm::new(vec![ScriptedLlm::json(
            serde_json::json!({"pass": false, "summary": "no tests for new branch"}),
        )]));
        let (pipeline, log) = pipeline(
            validators(EnforcementMode::Block, EnforcementMode::Off),
            llm,
            &home,
        );

        let report = pipeline.run_for_task(&context(), &log);
        assert_eq!(report.blocked.len(), 1);
        assert_eq!(report.blocked[0].validator, "test");
        assert_eq!(report.blocked[0].reason, "no tests for new branch");
        assert_eq!(report.blocked[0].status, ValidatorStatus::Fail);
    }

    #[test]
    fn failing_warn_validator_never_blocks() {
        let home = TempDir::new().unwrap();
        let llm = Arc::new(ScriptedLlm::new(vec![ScriptedLlm::json(
            serde_json::json!({"pass": false, "summary": "style drift"}),
        )]));
        let (pipeline, log) = pipeline(
            validators(EnforcementMode::Off, EnforcementMode::Warn),
            llm,
            &home,
        );

        let report = pipeline.run_for_task(&context(), &log);
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].validator, "style");
        assert_eq!(report.results[0].status, ValidatorStatus::Fail);
        assert!(report.blocked.is_empty());
    }

    #[test]
    fn llm_error_is_recorded_but_does_not_block() {
        let home = TempDir::new().unwrap();
        let llm = Arc::new(ScriptedLlm::new(vec![Err(ValidatorError::Llm(
            "boom".to_string(),
        ))]));
        let (pipeline, log) = pipeline(
            validators(EnforcementMode::Block, EnforcementMode::Off),
            llm,
            &home,
        );

        let report = pipeline.run_for_task(&context(), &log);
        assert_eq!(report.results[0].status, ValidatorStatus::Error);
        assert!(report.blocked.is_empty());
    }

    #[test]
    fn validators_run_in_declared_order() {
        let home = TempDir::new().unwrap();
        let llm = Arc::new(ScriptedLlm::new(vec![
            ScriptedLlm::json(serde_json::json!({"pass": true, "summary": "t"})),
            ScriptedLlm::json(serde_json::json!({"pass": true, "summary": "s"})),
        ]));
        let llm_ref = Arc::clone(&llm);
        let (pipeline, log) = pipeline(
            validators(EnforcementMode::Warn, EnforcementMode::Warn),
            llm,
            &home,
        );

        let report = pipeline.run_for_task(&context(), &log);
        let names: Vec<&str> = report.results.iter().map(|r| r.validator.as_str()).collect();
        assert_eq!(names, vec!["test", "style"]);

        let prompts = llm_ref.prompts.lock().unwrap();
        assert!(prompts[0].contains("test reviewer"));
        assert!(prompts[1].contains("style reviewer"));
    }

    #[test]
    fn architecture_skipped_when_docs_missing() {
        let home = TempDir::new().unwrap();
        let mut config = validators(EnforcementMode::Off, EnforcementMode::Off);
        config.architecture = ArchitectureValidatorConfig {
            mode: EnforcementMode::Block,
            docs_paths: vec!["docs/ARCHITECTURE.md".to_string()],
            fail_if_docs_missing: false,
        };
        let llm = Arc::new(ScriptedLlm::new(vec![]));
        let (pipeline, log) = pipeline(config, llm, &home);

        let report = pipeline.run_for_task(&context(), &log);
        assert!(report.results.is_empty());
        assert!(report.blocked.is_empty());
    }

    #[test]
    fn architecture_blocks_when_docs_required_but_missing() {
        let home = TempDir::new().unwrap();
        let mut config = validators(EnforcementMode::Off, EnforcementMode::Off);
        config.architecture = ArchitectureValidatorConfig {
            mode: EnforcementMode::Block,
            docs_paths: vec!["docs/ARCHITECTURE.md".to_string()],
            fail_if_docs_missing: true,
        };
        let llm = Arc::new(ScriptedLlm::new(vec![]));
        let (pipeline, log) = pipeline(config, llm, &home);

        let report = pipeline.run_for_task(&context(), &log);
        assert_eq!(report.blocked.len(), 1);
        assert_eq!(report.blocked[0].validator, "architecture");
    }

    #[test]
    fn architecture_runs_when_docs_present() {
        let home = TempDir::new().unwrap();
        std::fs::create_dir_all(home.path().join("docs")).unwrap();
        std::fs::write(home.path().join("docs/ARCHITECTURE.md"), "# Layers").unwrap();

        let mut config = validators(EnforcementMode::Off, EnforcementMode::Off);
        config.architecture = ArchitectureValidatorConfig {
            mode: EnforcementMode::Warn,
            docs_paths: vec!["docs/ARCHITECTURE.md".to_string()],
            fail_if_docs_missing: false,
        };
        let llm = Arc::new(ScriptedLlm::new(vec![ScriptedLlm::json(
            serde_json::json!({"pass": true, "summary": "respects layering"}),
        )]));
        let (pipeline, log) = pipeline(config, llm, &home);

        let report = pipeline.run_for_task(&context(), &log);
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].validator, "architecture");
        assert_eq!(report.results[0].status, ValidatorStatus::Pass);
    }

    #[test]
    fn doctor_validator_reports_ineffective_doctor() {
        let home = TempDir::new().unwrap();
        let mut config = validators(EnforcementMode::Off, EnforcementMode::Off);
        config.doctor = DoctorValidatorConfig {
            mode: EnforcementMode::Block,
            cadence: 2,
        };
        let llm = Arc::new(ScriptedLlm::new(vec![ScriptedLlm::json(serde_json::json!({
            "effective": false,
            "coverage_assessment": "doctor never runs the api tests"
        }))]));
        let llm_ref = Arc::clone(&llm);
        let (pipeline, log) = pipeline(config, llm, &home);

        let runs = vec![DoctorRunRecord {
            task_id: "001".to_string(),
            passed: true,
            log_snippet: "ok".to_string(),
        }];
        let verdict =
            pipeline.run_doctor_validator(DoctorTrigger::Cadence, &runs, "2 files", &log);
        assert!(!verdict.effective);
        assert_eq!(verdict.result.status, ValidatorStatus::Fail);
        assert_eq!(verdict.result.trigger, Some(DoctorTrigger::Cadence));
        assert!(verdict.blocked.is_some());

        let prompts = llm_ref.prompts.lock().unwrap();
        assert!(prompts[0].contains("Trigger: cadence"));
    }

    #[test]
    fn doctor_validator_effective_does_not_block() {
        let home = TempDir::new().unwrap();
        let mut config = validators(EnforcementMode::Off, EnforcementMode::Off);
        config.doctor = DoctorValidatorConfig {
            mode: EnforcementMode::Block,
            cadence: 2,
        };
        let llm = Arc::new(ScriptedLlm::new(vec![ScriptedLlm::json(serde_json::json!({
            "effective": true,
            "coverage_assessment": "covers the diff"
        }))]));
        let (pipeline, log) = pipeline(config, llm, &home);

        let verdict = pipeline.run_doctor_validator(
            DoctorTrigger::IntegrationDoctorFailed,
            &[],
            "",
            &log,
        );
        assert!(verdict.effective);
        assert!(verdict.blocked.is_none());
    }

    #[test]
    fn extract_json_object_handles_wrapped_text() {
        let value = extract_json_object("verdict follows {\"pass\": true, \"summary\": \"x\"} done");
        assert_eq!(value.unwrap()["pass"], true);
        assert!(extract_json_object("nothing here").is_none());
    }
}
