//! End-to-end runs against real git repositories with a stub agent CLI.

use mycelium_core::config::ProjectConfig;
use mycelium_core::types::{CanaryOutcome, RunStatus, TaskStatus};
use mycelium_exec::validators::{LlmClient, LlmResponse, ValidatorError};
use mycelium_exec::{RunEngine, RunOptions, StopSignal};
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use tempfile::TempDir;

/// LLM stub that answers every validator call with the same JSON verdict.
struct FixedLlm(serde_json::Value);

impl LlmClient for FixedLlm {
    fn complete(
        &self,
        _prompt: &str,
        _schema: Option<&serde_json::Value>,
    ) -> Result<LlmResponse, ValidatorError> {
        Ok(LlmResponse {
            text: self.0.to_string(),
            parsed: Some(self.0.clone()),
            finish_reason: "stop".to_string(),
        })
    }
}

/// LLM stub for runs where no validator should ever fire.
struct NoLlm;

impl LlmClient for NoLlm {
    fn complete(
        &self,
        _prompt: &str,
        _schema: Option<&serde_json::Value>,
    ) -> Result<LlmResponse, ValidatorError> {
        Err(ValidatorError::Llm("no validator expected".to_string()))
    }
}

struct Fixture {
    repo: TempDir,
    home: TempDir,
    agent_bin: PathBuf,
    counter_path: PathBuf,
}

impl Fixture {
    /// Repo with a gitignored tasks directory and a stub agent that writes
    /// one file named after its workspace, so parallel tasks never collide.
    fn new() -> Self {
        let repo = TempDir::new().unwrap();
        let home = TempDir::new().unwrap();

        for args in [
            vec!["init", "-b", "main"],
            vec!["config", "user.email", "test@test.com"],
            vec!["config", "user.name", "Test"],
        ] {
            Command::new("git")
                .args(&args)
                .current_dir(repo.path())
                .output()
                .unwrap();
        }
        std::fs::write(repo.path().join(".gitignore"), "tasks/\n").unwrap();
        std::fs::write(repo.path().join("README.md"), "# Target repo\n").unwrap();
        Command::new("git")
            .args(["add", "."])
            .current_dir(repo.path())
            .output()
            .unwrap();
        Command::new("git")
            .args(["commit", "-m", "Initial commit"])
            .current_dir(repo.path())
            .output()
            .unwrap();

        let counter_path = home.path().join("agent-invocations");
        let agent_bin = home.path().join("stub-agent");
        std::fs::write(
            &agent_bin,
            format!(
                "#!/bin/sh\n\
                 echo run >> {counter}\n\
                 echo done > \"$(basename \"$PWD\").txt\"\n\
                 echo '{{\"type\":\"result\",\"session_id\":\"thr-1\",\"usage\":{{\"input_tokens\":10,\"output_tokens\":10}},\"total_cost_usd\":0.01}}'\n",
                counter = counter_path.display()
            ),
        )
        .unwrap();
        let mut perms = std::fs::metadata(&agent_bin).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&agent_bin, perms).unwrap();

        Self {
            repo,
            home,
            agent_bin,
            counter_path,
        }
    }

    fn add_task(&self, id: &str, name: &str, task_doctor: &str, manifest_extra: serde_json::Value) {
        let dir = self
            .repo
            .path()
            .join("tasks/backlog")
            .join(format!("{id}-{name}"));
        std::fs::create_dir_all(&dir).unwrap();
        let mut manifest = serde_json::json!({
            "id": id,
            "name": name,
            "description": format!("demo task {id}"),
            "estimated_minutes": 5,
            "verify": {"doctor": task_doctor}
        });
        if let (Some(base), Some(extra)) = (manifest.as_object_mut(), manifest_extra.as_object()) {
            for (key, value) in extra {
                base.insert(key.clone(), value.clone());
            }
        }
        std::fs::write(dir.join("manifest.json"), manifest.to_string()).unwrap();
        std::fs::write(dir.join("spec.md"), format!("# Task {id}\n\nDo the thing.\n")).unwrap();
    }

    fn config(&self, integration_doctor: &str) -> ProjectConfig {
        let mut config = ProjectConfig::default();
        config.project = "demo".to_string();
        config.repo_path = self.repo.path().to_path_buf();
        config.doctor = integration_doctor.to_string();
        config.agent.bin = self.agent_bin.display().to_string();
        config.max_retries = 0;
        config
    }

    async fn run(&self, config: ProjectConfig, llm: Arc<dyn LlmClient>) -> (RunStatus, String) {
        self.run_with_stop(config, llm, StopSignal::new()).await
    }

    async fn run_with_stop(
        &self,
        config: ProjectConfig,
        llm: Arc<dyn LlmClient>,
        stop: StopSignal,
    ) -> (RunStatus, String) {
        let options = RunOptions {
            home: Some(self.home.path().to_path_buf()),
            run_id: None,
            resume: false,
            crash_after_start: false,
        };
        let mut engine = RunEngine::new(config, options, llm, stop).unwrap();
        let run_id = engine.run_id();
        let status = engine.run().await.unwrap();
        (status, run_id)
    }

    fn state(&self, run_id: &str) -> serde_json::Value {
        let path = self
            .home
            .path()
            .join("projects/demo/runs")
            .join(run_id)
            .join("state.json");
        serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
    }

    fn head(&self) -> String {
        let output = Command::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(self.repo.path())
            .output()
            .unwrap();
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    fn workspace_dir(&self, run_id: &str, task_dir: &str) -> PathBuf {
        self.home
            .path()
            .join("projects/demo/runs")
            .join(run_id)
            .join("workspaces")
            .join(task_dir)
    }

    fn agent_invocations(&self) -> usize {
        std::fs::read_to_string(&self.counter_path)
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }
}

fn task_status(state: &serde_json::Value, id: &str) -> TaskStatus {
    serde_json::from_value(state["tasks"][id]["status"].clone()).unwrap()
}

// S1: one task, everything passes, workspace cleaned up on success.
#[tokio::test]
async fn single_task_success_cleans_up_and_advances_mainline() {
    let fixture = Fixture::new();
    fixture.add_task("001", "cleanup-demo", "exit 0", serde_json::json!({}));
    let head_before = fixture.head();

    let (status, run_id) = fixture.run(fixture.config("exit 0"), Arc::new(NoLlm)).await;
    assert_eq!(status, RunStatus::Complete);

    let state = fixture.state(&run_id);
    assert_eq!(state["status"], "complete");
    assert_eq!(task_status(&state, "001"), TaskStatus::Complete);
    assert_eq!(state["batches"][0]["status"], "complete");
    assert_eq!(state["batches"][0]["integration_doctor_passed"], true);
    assert!(state["batches"][0]["merge_commit"].is_string());

    // Mainline advanced and contains the agent's file.
    assert_ne!(fixture.head(), head_before);
    assert!(fixture.repo.path().join("001-cleanup-demo.txt").exists());

    // Workspace removed after the successful merge.
    assert!(!fixture.workspace_dir(&run_id, "001-cleanup-demo").exists());

    // Task directory archived under this run.
    assert!(fixture
        .repo
        .path()
        .join("tasks/archive")
        .join(&run_id)
        .join("001-cleanup-demo/manifest.json")
        .exists());

    // Ledger vouches for the task.
    let ledger: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(fixture.home.path().join("projects/demo/ledger.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(ledger[0]["task_id"], "001");
    assert_eq!(ledger[0]["integration_doctor_passed"], true);
}

// S2: per-task doctor passes but the integration doctor fails after merge.
#[tokio::test]
async fn integration_doctor_failure_parks_the_task_and_fails_the_run() {
    let fixture = Fixture::new();
    fixture.add_task("001", "cleanup-demo", "exit 0", serde_json::json!({}));

    let (status, run_id) = fixture.run(fixture.config("exit 1"), Arc::new(NoLlm)).await;
    assert_eq!(status, RunStatus::Failed);

    let state = fixture.state(&run_id);
    assert_eq!(state["status"], "failed");
    assert_eq!(task_status(&state, "001"), TaskStatus::NeedsHumanReview);
    assert_eq!(state["batches"][0]["integration_doctor_passed"], false);
    assert_eq!(state["tasks"]["001"]["human_review"]["validator"], "integration_doctor");

    // Nothing was written to the ledger.
    assert!(!fixture.home.path().join("projects/demo/ledger.json").exists());
}

// S3: blocking test validator with a failing verdict pauses the run.
#[tokio::test]
async fn test_validator_block_pauses_without_merging() {
    let fixture = Fixture::new();
    fixture.add_task("001", "cleanup-demo", "exit 0", serde_json::json!({}));
    let head_before = fixture.head();

    let mut config = fixture.config("exit 0");
    config.validators.test.mode = mycelium_core::types::EnforcementMode::Block;
    let llm = Arc::new(FixedLlm(serde_json::json!({
        "pass": false,
        "summary": "no coverage for the new file"
    })));

    let (status, run_id) = fixture.run(config, llm).await;
    assert_eq!(status, RunStatus::Paused);

    let state = fixture.state(&run_id);
    assert_eq!(state["status"], "paused");
    assert_eq!(task_status(&state, "001"), TaskStatus::NeedsHumanReview);
    assert_eq!(state["tasks"]["001"]["human_review"]["validator"], "test");

    // Mainline untouched.
    assert_eq!(fixture.head(), head_before);
    assert!(state["batches"][0]["merge_commit"].is_null());
}

// S4: budget block stops the run before any merge.
#[tokio::test]
async fn budget_block_fails_the_run_before_merge() {
    let fixture = Fixture::new();
    fixture.add_task("001", "cleanup-demo", "exit 0", serde_json::json!({}));
    let head_before = fixture.head();

    let mut config = fixture.config("exit 0");
    config.budgets.mode = mycelium_core::types::EnforcementMode::Block;
    config.budgets.max_tokens_per_task = Some(1);

    let (status, run_id) = fixture.run(config, Arc::new(NoLlm)).await;
    assert_eq!(status, RunStatus::Failed);

    let state = fixture.state(&run_id);
    assert_eq!(state["status"], "failed");
    assert!(state["batches"][0]["merge_commit"].is_null());
    assert_eq!(fixture.head(), head_before);
}

// S5a: style validator in warn mode records the failure but the run completes.
#[tokio::test]
async fn style_validator_warn_completes_and_merges() {
    let fixture = Fixture::new();
    fixture.add_task("001", "cleanup-demo", "exit 0", serde_json::json!({}));
    let head_before = fixture.head();

    let mut config = fixture.config("exit 0");
    config.validators.style.mode = mycelium_core::types::EnforcementMode::Warn;
    let llm = Arc::new(FixedLlm(serde_json::json!({
        "pass": false,
        "summary": "style drift"
    })));

    let (status, run_id) = fixture.run(config, llm).await;
    assert_eq!(status, RunStatus::Complete);

    let state = fixture.state(&run_id);
    assert_eq!(task_status(&state, "001"), TaskStatus::Complete);
    assert_ne!(fixture.head(), head_before);

    // The failing verdict is still on record.
    assert_eq!(state["tasks"]["001"]["validator_results"][0]["validator"], "style");
    assert_eq!(state["tasks"]["001"]["validator_results"][0]["status"], "fail");
}

// S5b: the same verdict in block mode pauses the run instead.
#[tokio::test]
async fn style_validator_block_pauses_and_leaves_mainline() {
    let fixture = Fixture::new();
    fixture.add_task("001", "cleanup-demo", "exit 0", serde_json::json!({}));
    let head_before = fixture.head();

    let mut config = fixture.config("exit 0");
    config.validators.style.mode = mycelium_core::types::EnforcementMode::Block;
    let llm = Arc::new(FixedLlm(serde_json::json!({
        "pass": false,
        "summary": "style drift"
    })));

    let (status, run_id) = fixture.run(config, llm).await;
    assert_eq!(status, RunStatus::Paused);

    let state = fixture.state(&run_id);
    assert_eq!(task_status(&state, "001"), TaskStatus::NeedsHumanReview);
    assert_eq!(fixture.head(), head_before);
}

// S6: lock-compatible tasks share a batch and both land on mainline.
#[tokio::test]
async fn parallel_non_conflicting_tasks_merge_together() {
    let fixture = Fixture::new();
    fixture.add_task(
        "001",
        "api-change",
        "exit 0",
        serde_json::json!({"locks": {"writes": ["api"]}}),
    );
    fixture.add_task(
        "002",
        "docs-change",
        "exit 0",
        serde_json::json!({"locks": {"writes": ["docs"]}}),
    );

    let (status, run_id) = fixture.run(fixture.config("exit 0"), Arc::new(NoLlm)).await;
    assert_eq!(status, RunStatus::Complete);

    let state = fixture.state(&run_id);
    assert_eq!(state["batches"].as_array().unwrap().len(), 1);
    assert_eq!(state["batches"][0]["task_ids"][0], "001");
    assert_eq!(state["batches"][0]["task_ids"][1], "002");
    assert_eq!(task_status(&state, "001"), TaskStatus::Complete);
    assert_eq!(task_status(&state, "002"), TaskStatus::Complete);

    // Mainline contains both branch tips.
    assert!(fixture.repo.path().join("001-api-change.txt").exists());
    assert!(fixture.repo.path().join("002-docs-change.txt").exists());
}

// Conflicting locks serialise into separate batches.
#[tokio::test]
async fn conflicting_tasks_run_in_sequential_batches() {
    let fixture = Fixture::new();
    fixture.add_task(
        "001",
        "api-change",
        "exit 0",
        serde_json::json!({"locks": {"writes": ["api"]}}),
    );
    fixture.add_task(
        "002",
        "api-followup",
        "exit 0",
        serde_json::json!({"locks": {"writes": ["api"]}}),
    );

    let (status, run_id) = fixture.run(fixture.config("exit 0"), Arc::new(NoLlm)).await;
    assert_eq!(status, RunStatus::Complete);

    let state = fixture.state(&run_id);
    let batches = state["batches"].as_array().unwrap();
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0]["task_ids"][0], "001");
    assert_eq!(batches[1]["task_ids"][0], "002");
}

// A ledger entry with a matching fingerprint pre-skips the task entirely.
#[tokio::test]
async fn ledger_fingerprint_match_skips_replanned_task() {
    let fixture = Fixture::new();
    fixture.add_task("001", "cleanup-demo", "exit 0", serde_json::json!({}));

    let (status, run_id) = fixture.run(fixture.config("exit 0"), Arc::new(NoLlm)).await;
    assert_eq!(status, RunStatus::Complete);
    let invocations_after_first = fixture.agent_invocations();
    assert!(invocations_after_first >= 1);

    // Re-plan the identical task from its archived copy.
    let archived = fixture
        .repo
        .path()
        .join("tasks/archive")
        .join(&run_id)
        .join("001-cleanup-demo");
    let backlog = fixture.repo.path().join("tasks/backlog/001-cleanup-demo");
    std::fs::create_dir_all(backlog.parent().unwrap()).unwrap();
    std::fs::create_dir_all(&backlog).unwrap();
    for file in ["manifest.json", "spec.md"] {
        std::fs::copy(archived.join(file), backlog.join(file)).unwrap();
    }

    let (status, run_id_2) = fixture.run(fixture.config("exit 0"), Arc::new(NoLlm)).await;
    assert_eq!(status, RunStatus::Complete);

    let state = fixture.state(&run_id_2);
    assert_eq!(task_status(&state, "001"), TaskStatus::Skipped);
    // No batch was scheduled and the agent never ran again.
    assert_eq!(state["batches"].as_array().unwrap().len(), 0);
    assert_eq!(fixture.agent_invocations(), invocations_after_first);
}

// A changed spec invalidates the fingerprint and the task re-runs.
#[tokio::test]
async fn changed_spec_defeats_the_ledger_skip() {
    let fixture = Fixture::new();
    fixture.add_task("001", "cleanup-demo", "exit 0", serde_json::json!({}));

    let (status, run_id) = fixture.run(fixture.config("exit 0"), Arc::new(NoLlm)).await;
    assert_eq!(status, RunStatus::Complete);
    let invocations_after_first = fixture.agent_invocations();

    let archived = fixture
        .repo
        .path()
        .join("tasks/archive")
        .join(&run_id)
        .join("001-cleanup-demo");
    let backlog = fixture.repo.path().join("tasks/backlog/001-cleanup-demo");
    std::fs::create_dir_all(&backlog).unwrap();
    std::fs::copy(archived.join("manifest.json"), backlog.join("manifest.json")).unwrap();
    std::fs::write(backlog.join("spec.md"), "# Task 001\n\nDo a different thing.\n").unwrap();

    let (status, run_id_2) = fixture.run(fixture.config("exit 0"), Arc::new(NoLlm)).await;
    assert_eq!(status, RunStatus::Complete);

    let state = fixture.state(&run_id_2);
    assert_eq!(task_status(&state, "001"), TaskStatus::Complete);
    assert!(fixture.agent_invocations() > invocations_after_first);
}

// Stop signal before the first batch: run pauses, nothing is scheduled.
#[tokio::test]
async fn stop_signal_before_batch_pauses_the_run() {
    let fixture = Fixture::new();
    fixture.add_task("001", "cleanup-demo", "exit 0", serde_json::json!({}));

    let stop = StopSignal::new();
    stop.request_stop("SIGINT");
    let (status, run_id) = fixture
        .run_with_stop(fixture.config("exit 0"), Arc::new(NoLlm), stop)
        .await;
    assert_eq!(status, RunStatus::Paused);

    let state = fixture.state(&run_id);
    assert_eq!(state["status"], "paused");
    assert_eq!(state["stop"]["signal"], "SIGINT");
    assert_eq!(task_status(&state, "001"), TaskStatus::Pending);
    assert_eq!(state["batches"].as_array().unwrap().len(), 0);
    assert_eq!(fixture.agent_invocations(), 0);
}

// Canary: a doctor that honours the canary flag records expected_fail.
#[tokio::test]
async fn canary_expected_fail_is_recorded() {
    let fixture = Fixture::new();
    fixture.add_task("001", "cleanup-demo", "exit 0", serde_json::json!({}));

    let mut config =
        fixture.config("if [ \"$ORCH_CANARY\" = \"1\" ]; then exit 1; fi; exit 0");
    config.doctor_canary.enabled = true;

    let (status, run_id) = fixture.run(config, Arc::new(NoLlm)).await;
    assert_eq!(status, RunStatus::Complete);

    let state = fixture.state(&run_id);
    let canary: CanaryOutcome =
        serde_json::from_value(state["batches"][0]["integration_doctor_canary"].clone()).unwrap();
    assert_eq!(canary, CanaryOutcome::ExpectedFail);
}

// Canary: a doctor that ignores the flag records unexpected_pass but the
// batch still completes.
#[tokio::test]
async fn canary_unexpected_pass_does_not_fail_the_batch() {
    let fixture = Fixture::new();
    fixture.add_task("001", "cleanup-demo", "exit 0", serde_json::json!({}));

    let mut config = fixture.config("exit 0");
    config.doctor_canary.enabled = true;

    let (status, run_id) = fixture.run(config, Arc::new(NoLlm)).await;
    assert_eq!(status, RunStatus::Complete);

    let state = fixture.state(&run_id);
    let canary: CanaryOutcome =
        serde_json::from_value(state["batches"][0]["integration_doctor_canary"].clone()).unwrap();
    assert_eq!(canary, CanaryOutcome::UnexpectedPass);
    assert_eq!(task_status(&state, "001"), TaskStatus::Complete);
}

// Dependencies execute in order across batches.
#[tokio::test]
async fn dependent_task_waits_for_its_dependency() {
    let fixture = Fixture::new();
    fixture.add_task("001", "base-change", "exit 0", serde_json::json!({}));
    fixture.add_task(
        "002",
        "follow-up",
        "exit 0",
        serde_json::json!({"dependencies": ["001"]}),
    );

    let (status, run_id) = fixture.run(fixture.config("exit 0"), Arc::new(NoLlm)).await;
    assert_eq!(status, RunStatus::Complete);

    let state = fixture.state(&run_id);
    let batches = state["batches"].as_array().unwrap();
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0]["task_ids"][0], "001");
    assert_eq!(batches[1]["task_ids"][0], "002");
    assert_eq!(task_status(&state, "002"), TaskStatus::Complete);
}

// A failing worker marks its task failed; an independent task still merges.
#[tokio::test]
async fn one_failed_task_does_not_block_the_other() {
    let fixture = Fixture::new();
    fixture.add_task(
        "001",
        "doomed-task",
        "exit 1",
        serde_json::json!({"locks": {"writes": ["api"]}}),
    );
    fixture.add_task(
        "002",
        "healthy-task",
        "exit 0",
        serde_json::json!({"locks": {"writes": ["docs"]}}),
    );

    let (status, run_id) = fixture.run(fixture.config("exit 0"), Arc::new(NoLlm)).await;
    assert_eq!(status, RunStatus::Failed);

    let state = fixture.state(&run_id);
    assert_eq!(task_status(&state, "001"), TaskStatus::Failed);
    assert_eq!(task_status(&state, "002"), TaskStatus::Complete);
    assert!(fixture.repo.path().join("002-healthy-task.txt").exists());
    assert_eq!(state["batches"][0]["status"], "failed");
}
