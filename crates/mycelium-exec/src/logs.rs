//! Append-only JSONL log streams.
//!
//! One event per line, flushed per line so a crash loses at most the line
//! being written. Readers tolerate a torn tail line.

use chrono::Utc;
use mycelium_core::events::{OrchestratorEvent, TaskEvent};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("failed to open log {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to append to log: {0}")]
    Write(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LogError>;

/// Append-only writer for one JSONL stream.
///
/// Interior mutability so engines can share one handle; appends are
/// serialised on a mutex since lines must not interleave.
#[derive(Debug)]
pub struct JsonlWriter {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlWriter {
    /// Open (creating parents) for append.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| LogError::Open {
                path: path.display().to_string(),
                source,
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| LogError::Open {
                path: path.display().to_string(),
                source,
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one pre-built JSON value as a line and flush.
    pub fn append(&self, value: &serde_json::Value) -> Result<()> {
        let line = serde_json::to_string(value).unwrap_or_else(|_| "null".to_string());
        let mut file = self.file.lock().expect("log mutex poisoned");
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;
        Ok(())
    }
}

/// Orchestrator event stream for a run.
#[derive(Debug)]
pub struct OrchestratorLog {
    writer: JsonlWriter,
}

impl OrchestratorLog {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            writer: JsonlWriter::open(path)?,
        })
    }

    /// Append an event. Logging failures are reported but never abort the
    /// engines; durable state lives in the state document, not the log.
    pub fn emit(&self, event: &OrchestratorEvent) {
        let envelope = event.to_envelope(Utc::now());
        if let Err(e) = self.writer.append(&envelope) {
            warn!(event = event.event_type(), error = %e, "failed to append orchestrator event");
        }
    }
}

/// Per-task event stream written by the worker runner.
#[derive(Debug)]
pub struct TaskLog {
    writer: JsonlWriter,
    task_id: String,
}

impl TaskLog {
    pub fn open(path: &Path, task_id: impl Into<String>) -> Result<Self> {
        Ok(Self {
            writer: JsonlWriter::open(path)?,
            task_id: task_id.into(),
        })
    }

    pub fn emit(&self, event: &TaskEvent, attempt: u32) {
        let envelope = event.to_envelope(Utc::now(), &self.task_id, attempt);
        if let Err(e) = self.writer.append(&envelope) {
            warn!(
                task_id = %self.task_id,
                event = event.event_type(),
                error = %e,
                "failed to append task event"
            );
        }
    }
}

/// Read every complete JSON line from a JSONL file, skipping a torn tail.
///
/// A crash mid-append leaves at most one partial final line; it parses as
/// invalid JSON and is dropped rather than failing the whole read.
pub fn read_jsonl(path: &Path) -> Result<Vec<serde_json::Value>> {
    let file = File::open(path).map_err(|source| LogError::Open {
        path: path.display().to_string(),
        source,
    })?;
    let reader = BufReader::new(file);
    let mut values = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(value) => values.push(value),
            Err(_) => {
                // Torn tail from an interrupted append; ignore.
                warn!(path = %path.display(), "skipping unparseable jsonl line");
            }
        }
    }
    Ok(values)
}
