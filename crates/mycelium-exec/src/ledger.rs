//! Task ledger: content-addressed record of completed tasks.
//!
//! A single JSON array file per project. Entries are keyed by task id;
//! `upsert` replaces any prior entry for the same id and rewrites the file
//! atomically. Once an entry with `integration_doctor_passed=true` exists,
//! it is authoritative for its fingerprint and lets future runs pre-skip
//! the task.

use mycelium_core::types::LedgerEntry;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("ledger at {path} is corrupt: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, LedgerError>;

#[derive(Debug, Clone)]
pub struct TaskLedger {
    path: PathBuf,
}

impl TaskLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read all entries. A missing file is an empty ledger.
    pub fn load(&self) -> Result<Vec<LedgerEntry>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(LedgerError::Io {
                    path: self.path.display().to_string(),
                    source,
                });
            }
        };
        serde_json::from_str(&content).map_err(|source| LedgerError::Corrupt {
            path: self.path.display().to_string(),
            source,
        })
    }

    /// Look up the entry for a task id.
    pub fn lookup(&self, task_id: &str) -> Result<Option<LedgerEntry>> {
        Ok(self.load()?.into_iter().find(|e| e.task_id == task_id))
    }

    /// Insert or replace the entry for `entry.task_id`.
    ///
    /// The full array is rewritten through a temp file and atomic rename;
    /// repeating the same upsert yields a byte-identical file.
    pub fn upsert(&self, entry: LedgerEntry) -> Result<()> {
        let mut entries = self.load()?;
        entries.retain(|e| e.task_id != entry.task_id);
        entries.push(entry);
        entries.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        self.write_atomic(&entries)
    }

    fn write_atomic(&self, entries: &[LedgerEntry]) -> Result<()> {
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent).map_err(|source| LedgerError::Io {
            path: parent.display().to_string(),
            source,
        })?;

        let mut body = serde_json::to_string_pretty(entries).map_err(|source| {
            LedgerError::Corrupt {
                path: self.path.display().to_string(),
                source,
            }
        })?;
        body.push('\n');

        let tmp_path = self
            .path
            .with_file_name(format!("ledger.json.{}.tmp", Uuid::now_v7()));
        {
            let mut file = std::fs::File::create(&tmp_path).map_err(|source| LedgerError::Io {
                path: tmp_path.display().to_string(),
                source,
            })?;
            file.write_all(body.as_bytes())
                .and_then(|()| file.sync_all())
                .map_err(|source| LedgerError::Io {
                    path: tmp_path.display().to_string(),
                    source,
                })?;
        }
        std::fs::rename(&tmp_path, &self.path).map_err(|source| {
            let _ = std::fs::remove_file(&tmp_path);
            LedgerError::Io {
                path: self.path.display().to_string(),
                source,
            }
        })?;
        Ok(())
    }
}
