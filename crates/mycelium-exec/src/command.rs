//! Shell command execution with per-command timeouts.
//!
//! Doctor, lint and bootstrap commands all run through here: `sh -c` in a
//! working directory, environment inherited, output captured. A timeout
//! kills and reaps the child and is reported as a normal failed outcome
//! (`timed_out = true`, exit code -1), never as an engine error.

use chrono::Utc;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CommandError>;

/// Outcome of one shell command invocation.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub command: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub timed_out: bool,
}

impl CommandOutcome {
    pub fn passed(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }

    /// Combined output for failure context, stderr appended after stdout.
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n\n--- STDERR ---\n{}", self.stdout, self.stderr)
        }
    }
}

/// Run a shell command with an optional timeout (0 = unbounded) and extra
/// environment variables.
pub async fn run_shell(
    command: &str,
    cwd: &Path,
    timeout_sec: u32,
    envs: &[(String, String)],
) -> Result<CommandOutcome> {
    debug!(command = %command, cwd = %cwd.display(), "executing shell command");

    let start = Utc::now();

    let mut process = Command::new("sh");
    process
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, value) in envs {
        process.env(key, value);
    }

    let mut child = process.spawn()?;

    // Take the handles before waiting so output survives a kill.
    let mut stdout_handle = child.stdout.take();
    let mut stderr_handle = child.stderr.take();

    let (exit_code, timed_out) = if timeout_sec > 0 {
        let timeout_duration = Duration::from_secs(u64::from(timeout_sec));
        tokio::select! {
            result = child.wait() => {
                (result?.code().unwrap_or(-1), false)
            }
            () = tokio::time::sleep(timeout_duration) => {
                if let Err(e) = child.kill().await {
                    warn!(command = %command, error = %e, "failed to kill timed-out process");
                }
                // Reap to avoid a zombie.
                let _ = child.wait().await;
                warn!(command = %command, timeout_sec, "command timed out");
                (-1, true)
            }
        }
    } else {
        (child.wait().await?.code().unwrap_or(-1), false)
    };

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    if let Some(ref mut handle) = stdout_handle {
        let _ = handle.read_to_end(&mut stdout).await;
    }
    if let Some(ref mut handle) = stderr_handle {
        let _ = handle.read_to_end(&mut stderr).await;
    }

    let end = Utc::now();
    let duration_ms = (end - start).num_milliseconds().max(0) as u64;

    Ok(CommandOutcome {
        command: command.to_string(),
        exit_code,
        stdout: String::from_utf8_lossy(&stdout).to_string(),
        stderr: String::from_utf8_lossy(&stderr).to_string(),
        duration_ms,
        timed_out,
    })
}

/// Counters accumulated over a run and folded into the summary artifact.
#[derive(Debug, Default)]
pub struct RunMetrics {
    pub doctor_runs: AtomicU64,
    pub doctor_ms_total: AtomicU64,
    pub compliance_violations: AtomicU64,
}

impl RunMetrics {
    pub fn record_compliance_violations(&self, count: u64) {
        self.compliance_violations.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "doctor_runs": self.doctor_runs.load(Ordering::Relaxed),
            "doctor_ms_total": self.doctor_ms_total.load(Ordering::Relaxed),
            "compliance_violations": self.compliance_violations.load(Ordering::Relaxed),
        })
    }
}

/// Scoped timer around a doctor invocation.
///
/// Flushes the measured duration into the metrics on drop, so the counters
/// are updated on every exit path, panics included.
#[derive(Debug)]
pub struct DoctorTimer<'a> {
    metrics: &'a RunMetrics,
    started: std::time::Instant,
}

impl<'a> DoctorTimer<'a> {
    pub fn start(metrics: &'a RunMetrics) -> Self {
        Self {
            metrics,
            started: std::time::Instant::now(),
        }
    }
}

impl Drop for DoctorTimer<'_> {
    fn drop(&mut self) {
        self.metrics.doctor_runs.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .doctor_ms_total
            .fetch_add(self.started.elapsed().as_millis() as u64, Ordering::Relaxed);
    }
}

/// Truncate command output to a bounded length for retry prompts and
/// review summaries, keeping the tail (failures usually print last).
pub fn truncate_output(output: &str, max_bytes: usize) -> String {
    if output.len() <= max_bytes {
        return output.to_string();
    }
    let tail_start = output.len() - max_bytes;
    // Snap to a character boundary.
    let mut start = tail_start;
    while !output.is_char_boundary(start) {
        start += 1;
    }
    format!("[... truncated ...]\n{}", &output[start..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn zero_exit_passes() {
        let dir = TempDir::new().unwrap();
        let outcome = run_shell("exit 0", dir.path(), 10, &[]).await.unwrap();
        assert!(outcome.passed());
        assert_eq!(outcome.exit_code, 0);
        assert!(!outcome.timed_out);
    }

    #[tokio::test]
    async fn nonzero_exit_fails() {
        let dir = TempDir::new().unwrap();
        let outcome = run_shell("exit 3", dir.path(), 10, &[]).await.unwrap();
        assert!(!outcome.passed());
        assert_eq!(outcome.exit_code, 3);
    }

    #[tokio::test]
    async fn output_is_captured() {
        let dir = TempDir::new().unwrap();
        let outcome = run_shell("echo out; echo err 1>&2", dir.path(), 10, &[])
            .await
            .unwrap();
        assert_eq!(outcome.stdout.trim(), "out");
        assert_eq!(outcome.stderr.trim(), "err");
        assert!(outcome.combined_output().contains("--- STDERR ---"));
    }

    #[tokio::test]
    async fn env_vars_are_passed_through() {
        let dir = TempDir::new().unwrap();
        let outcome = run_shell(
            "test \"$ORCH_CANARY\" = \"1\"",
            dir.path(),
            10,
            &[("ORCH_CANARY".to_string(), "1".to_string())],
        )
        .await
        .unwrap();
        assert!(outcome.passed());
    }

    #[tokio::test]
    async fn timeout_is_a_failed_outcome_not_an_error() {
        let dir = TempDir::new().unwrap();
        let outcome = run_shell("sleep 5", dir.path(), 1, &[]).await.unwrap();
        assert!(outcome.timed_out);
        assert!(!outcome.passed());
        assert_eq!(outcome.exit_code, -1);
    }

    #[tokio::test]
    async fn runs_in_the_given_cwd() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("marker"), "x").unwrap();
        let outcome = run_shell("test -f marker", dir.path(), 10, &[]).await.unwrap();
        assert!(outcome.passed());
    }

    #[test]
    fn doctor_timer_flushes_on_drop() {
        let metrics = RunMetrics::default();
        {
            let _timer = DoctorTimer::start(&metrics);
        }
        assert_eq!(metrics.doctor_runs.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn doctor_timer_flushes_on_panic() {
        let metrics = RunMetrics::default();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _timer = DoctorTimer::start(&metrics);
            panic!("boom");
        }));
        assert!(result.is_err());
        assert_eq!(metrics.doctor_runs.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn truncate_output_keeps_tail() {
        let long = "a".repeat(100) + "TAIL";
        let truncated = truncate_output(&long, 10);
        assert!(truncated.contains("TAIL"));
        assert!(truncated.starts_with("[... truncated ...]"));

        let short = "short";
        assert_eq!(truncate_output(short, 100), "short");
    }
}
