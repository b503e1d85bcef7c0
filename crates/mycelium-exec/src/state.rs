//! Durable run-state store.
//!
//! One JSON document per (project, run_id). Every boundary crossing in the
//! engines is persisted through `save` before the process may safely die:
//! writes go to a sibling temp file, fsync, then atomic rename, so a crash
//! leaves either the old document or the new one, never a torn mix.

use chrono::{DateTime, Utc};
use mycelium_core::events::StaleRecoveryPayload;
use mycelium_core::types::{RunState, RunStatus, TaskStatus};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("run state not found at {0}")]
    NotFound(String),
    #[error("run state at {path} is corrupt: {source}")]
    CorruptDocument {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("run state schema violation: {0}")]
    SchemaMismatch(#[from] mycelium_core::types::SchemaViolation),
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, StateError>;

/// Store for one run's state document.
///
/// Concurrent writers are not supported; the engines serialise all
/// mutations on the run's state mutex and call `save` between transitions.
#[derive(Debug, Clone)]
pub struct RunStateStore {
    path: PathBuf,
}

impl RunStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Load and validate the document.
    ///
    /// With `allow_stale_recovery`, a document whose `updated_at` is older
    /// than `stale_after_ms` has every in-flight task demoted back to
    /// `pending` (the workspace and branch are preserved, so the re-run is
    /// idempotent) and the run marked `paused`. The demotion is saved before
    /// returning; the caller emits the recovery event.
    pub fn load(
        &self,
        allow_stale_recovery: bool,
        stale_after_ms: u64,
        now: DateTime<Utc>,
    ) -> Result<(RunState, Option<StaleRecoveryPayload>)> {
        let mut state = self.read_document()?;

        let age_ms = (now - state.updated_at).num_milliseconds();
        let is_stale = age_ms >= 0 && (age_ms as u64) >= stale_after_ms;
        if !allow_stale_recovery || !is_stale {
            return Ok((state, None));
        }

        let reason = format!("state untouched for {age_ms}ms (threshold {stale_after_ms}ms)");
        let reset_ids = reset_in_flight_tasks(&mut state, &reason);
        if reset_ids.is_empty() {
            return Ok((state, None));
        }

        state.status = RunStatus::Paused;
        info!(
            reset_count = reset_ids.len(),
            reason = %reason,
            "stale recovery demoted in-flight tasks to pending"
        );
        self.save(&mut state, now)?;

        let payload = StaleRecoveryPayload {
            reset_count: reset_ids.len(),
            task_ids: reset_ids,
            reason,
        };
        Ok((state, Some(payload)))
    }

    /// Force-reset in-flight tasks after a known crash, regardless of age.
    pub fn recover(&self, reason: &str, now: DateTime<Utc>) -> Result<(RunState, Vec<String>)> {
        let mut state = self.read_document()?;
        let reset_ids = reset_in_flight_tasks(&mut state, reason);
        if !reset_ids.is_empty() {
            state.status = RunStatus::Paused;
        }
        self.save(&mut state, now)?;
        Ok((state, reset_ids))
    }

    /// Persist the document atomically. Updates `state.updated_at` in place.
    ///
    /// A schema violation here is a bug in the caller, surfaced loudly
    /// rather than written to disk.
    pub fn save(&self, state: &mut RunState, now: DateTime<Utc>) -> Result<()> {
        state.updated_at = now;
        state.validate()?;

        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent).map_err(|source| StateError::Io {
            path: parent.display().to_string(),
            source,
        })?;

        let tmp_path = self
            .path
            .with_file_name(format!("state.json.{}.tmp", Uuid::now_v7()));

        let mut body = serde_json::to_string_pretty(state).map_err(|source| {
            StateError::CorruptDocument {
                path: self.path.display().to_string(),
                source,
            }
        })?;
        body.push('\n');

        let write = |path: &Path| -> std::io::Result<()> {
            let mut file = std::fs::File::create(path)?;
            file.write_all(body.as_bytes())?;
            file.sync_all()?;
            Ok(())
        };
        write(&tmp_path).map_err(|source| StateError::Io {
            path: tmp_path.display().to_string(),
            source,
        })?;

        std::fs::rename(&tmp_path, &self.path).map_err(|source| {
            // Leave no temp litter behind on failure.
            let _ = std::fs::remove_file(&tmp_path);
            StateError::Io {
                path: self.path.display().to_string(),
                source,
            }
        })?;

        Ok(())
    }

    fn read_document(&self) -> Result<RunState> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StateError::NotFound(self.path.display().to_string()));
            }
            Err(source) => {
                return Err(StateError::Io {
                    path: self.path.display().to_string(),
                    source,
                });
            }
        };

        let state: RunState =
            serde_json::from_str(&content).map_err(|source| StateError::CorruptDocument {
                path: self.path.display().to_string(),
                source,
            })?;
        state.validate()?;
        Ok(state)
    }
}

/// Run state shared between the engines.
///
/// All mutations are serialised on the mutex and persisted before the lock
/// is released, so any operation that could crash afterwards finds the
/// transition on disk. The lock is never held across an await point.
#[derive(Debug)]
pub struct SharedState {
    store: RunStateStore,
    state: std::sync::Mutex<RunState>,
}

impl SharedState {
    pub fn new(store: RunStateStore, state: RunState) -> Self {
        Self {
            store,
            state: std::sync::Mutex::new(state),
        }
    }

    pub fn store(&self) -> &RunStateStore {
        &self.store
    }

    /// Read under the lock.
    pub fn read<R>(&self, f: impl FnOnce(&RunState) -> R) -> R {
        let state = self.state.lock().expect("state mutex poisoned");
        f(&state)
    }

    /// Mutate under the lock and save atomically before returning.
    pub fn mutate<R>(&self, f: impl FnOnce(&mut RunState) -> R) -> Result<R> {
        let mut state = self.state.lock().expect("state mutex poisoned");
        let result = f(&mut state);
        self.store.save(&mut state, Utc::now())?;
        Ok(result)
    }
}

/// Demote every in-flight task to `pending`, recording the reset reason.
/// Returns the affected task ids in key order.
fn reset_in_flight_tasks(state: &mut RunState, reason: &str) -> Vec<String> {
    let mut reset_ids = Vec::new();
    for (task_id, task) in &mut state.tasks {
        if task.status.is_in_flight() {
            task.status = TaskStatus::Pending;
            task.last_error = Some(format!("reset to pending: {reason}"));
            reset_ids.push(task_id.clone());
        }
    }
    if !reset_ids.is_empty() {
        warn!(task_ids = ?reset_ids, reason = %reason, "reset in-flight tasks");
    }
    reset_ids
}
