//! Path layout under the Mycelium home.
//!
//! Every durable artifact of a run lives under
//! `<home>/projects/<project>/runs/<run_id>/`. Paths are derived, never
//! stored, so two processes always agree on where things are.

use std::path::{Path, PathBuf};

/// Resolve the Mycelium home directory.
///
/// `MYCELIUM_HOME` wins; otherwise `~/.mycelium`.
pub fn mycelium_home() -> PathBuf {
    std::env::var_os("MYCELIUM_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".mycelium")
        })
}

/// Per-project and per-run path derivations, anchored at a home directory.
///
/// Constructed once per process; tests construct it over a temp dir.
#[derive(Debug, Clone)]
pub struct RunPaths {
    home: PathBuf,
    project: String,
    run_id: String,
}

impl RunPaths {
    pub fn new(home: impl Into<PathBuf>, project: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            home: home.into(),
            project: project.into(),
            run_id: run_id.into(),
        }
    }

    pub fn project_dir(&self) -> PathBuf {
        self.home.join("projects").join(&self.project)
    }

    /// Ledger file shared by all runs of the project.
    pub fn ledger_path(&self) -> PathBuf {
        self.project_dir().join("ledger.json")
    }

    pub fn run_dir(&self) -> PathBuf {
        self.project_dir().join("runs").join(&self.run_id)
    }

    pub fn state_path(&self) -> PathBuf {
        self.run_dir().join("state.json")
    }

    pub fn summary_path(&self) -> PathBuf {
        self.run_dir().join("summary.json")
    }

    pub fn orchestrator_log_path(&self) -> PathBuf {
        self.run_dir().join("orchestrator.jsonl")
    }

    /// Log directory for one task, keyed by its `<id>-<slug>` directory name.
    pub fn task_logs_dir(&self, task_dir_name: &str) -> PathBuf {
        self.run_dir().join("tasks").join(task_dir_name)
    }

    pub fn task_events_path(&self, task_dir_name: &str) -> PathBuf {
        self.task_logs_dir(task_dir_name).join("events.jsonl")
    }

    pub fn task_doctor_log_path(&self, task_dir_name: &str, attempt: u32) -> PathBuf {
        self.task_logs_dir(task_dir_name)
            .join(format!("doctor-{attempt}.log"))
    }

    /// Worker-local checkpoint/thread state, merged back by the task engine.
    pub fn worker_state_path(&self, task_dir_name: &str) -> PathBuf {
        self.task_logs_dir(task_dir_name).join("worker-state.json")
    }

    pub fn validators_dir(&self, validator: &str) -> PathBuf {
        self.run_dir().join("validators").join(validator)
    }

    /// Report path for one validator invocation on one task.
    pub fn validator_report_path(
        &self,
        validator: &str,
        task_id: &str,
        slug: &str,
        ts_compact: &str,
    ) -> PathBuf {
        self.validators_dir(validator)
            .join(format!("{task_id}-{slug}-{ts_compact}.json"))
    }

    pub fn reports_dir(&self, task_id: &str) -> PathBuf {
        self.run_dir().join("reports").join(task_id)
    }

    /// Per-task workspace directory, exclusive to the task by construction.
    pub fn workspace_dir(&self, task_dir_name: &str) -> PathBuf {
        self.run_dir().join("workspaces").join(task_dir_name)
    }
}

/// Compact timestamp used in validator report filenames.
pub fn ts_compact(ts: chrono::DateTime<chrono::Utc>) -> String {
    ts.format("%Y%m%dT%H%M%S%3fZ").to_string()
}

/// Copy a directory tree recursively, creating destination directories as
/// needed. Used to mirror the tasks subtree into a workspace.
pub fn copy_tree(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
