//! Task manifests and the on-disk tasks directory.
//!
//! A planned task lives in `<tasks_dir>/<stage>/<id>-<slug>/` as a
//! `manifest.json` plus a human-readable `spec.md`. Manifests are immutable
//! after planning; everything mutable lives in the run state.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::types::TaskId;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const SPEC_FILE: &str = "spec.md";

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid manifest at {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("manifest {id}: {reason}")]
    Invalid { id: String, reason: String },
    #[error("duplicate task id {id} (in {first} and {second})")]
    DuplicateId {
        id: String,
        first: String,
        second: String,
    },
}

pub type Result<T> = std::result::Result<T, ManifestError>;

/// Test-driven-development enforcement for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TddMode {
    #[default]
    Off,
    Strict,
}

impl TddMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Strict => "strict",
        }
    }
}

/// Declared resource locks. Resource names refer to config-declared
/// resources or derived component resources; they are scheduling hints,
/// not runtime mutexes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSet {
    pub reads: BTreeSet<String>,
    pub writes: BTreeSet<String>,
}

/// Declared file scopes as path globs, repo-relative.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileSet {
    pub reads: BTreeSet<String>,
    pub writes: BTreeSet<String>,
}

/// Verification commands declared by the planner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifySpec {
    /// Shell command that must exit zero for the task to pass.
    pub doctor: String,
    /// Fast check for strict-TDD iteration; required iff `tdd_mode=strict`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fast: Option<String>,
}

/// Immutable description of a planned task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskManifest {
    pub id: TaskId,
    /// kebab-case short name, used in branch and directory names.
    pub name: String,
    pub description: String,
    pub estimated_minutes: u32,
    /// Other task ids this task depends on, in planner order.
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    #[serde(default)]
    pub locks: LockSet,
    #[serde(default)]
    pub files: FileSet,
    #[serde(default)]
    pub affected_tests: BTreeSet<String>,
    #[serde(default)]
    pub test_paths: BTreeSet<String>,
    #[serde(default)]
    pub tdd_mode: TddMode,
    pub verify: VerifySpec,
}

impl TaskManifest {
    /// Validate planner invariants. Called on every load; a violation is a
    /// planning bug surfaced before any execution starts.
    pub fn validate(&self) -> Result<()> {
        let fail = |reason: String| {
            Err(ManifestError::Invalid {
                id: self.id.clone(),
                reason,
            })
        };

        if self.id.trim().is_empty() {
            return fail("id is empty".to_string());
        }
        if self.name.is_empty() || !is_kebab_case(&self.name) {
            return fail(format!("name {:?} is not kebab-case", self.name));
        }
        if self.estimated_minutes == 0 {
            return fail("estimated_minutes must be positive".to_string());
        }
        if self.dependencies.iter().any(|d| d == &self.id) {
            return fail("task depends on itself".to_string());
        }
        if self.verify.doctor.trim().is_empty() {
            return fail("verify.doctor is empty".to_string());
        }
        if self.tdd_mode == TddMode::Strict {
            if self.test_paths.is_empty() {
                return fail("tdd_mode=strict requires non-empty test_paths".to_string());
            }
            if self.affected_tests.is_empty() {
                return fail("tdd_mode=strict requires non-empty affected_tests".to_string());
            }
            match &self.verify.fast {
                Some(cmd) if !cmd.trim().is_empty() => {}
                _ => return fail("tdd_mode=strict requires verify.fast".to_string()),
            }
        }
        Ok(())
    }

    /// Filesystem-safe slug derived from the task name.
    pub fn slug(&self) -> String {
        slugify(&self.name)
    }

    /// Canonical directory name: `<id>-<slug>`.
    pub fn dir_name(&self) -> String {
        format!("{}-{}", self.id, self.slug())
    }
}

/// Filesystem stage a task directory currently lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStage {
    Backlog,
    Active,
    Archive,
    Legacy,
}

impl TaskStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backlog => "backlog",
            Self::Active => "active",
            Self::Archive => "archive",
            Self::Legacy => "legacy",
        }
    }
}

/// Runtime wrapper: a manifest plus where it currently sits on disk.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub manifest: TaskManifest,
    pub stage: TaskStage,
    /// Directory name under the stage, `<id>-<slug>`.
    pub dir_name: String,
    pub slug: String,
}

impl TaskSpec {
    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    /// Directory of this task relative to the tasks root.
    pub fn relative_dir(&self) -> PathBuf {
        PathBuf::from(self.stage.as_str()).join(&self.dir_name)
    }

    pub fn manifest_path(&self, tasks_dir: &Path) -> PathBuf {
        tasks_dir.join(self.relative_dir()).join(MANIFEST_FILE)
    }

    pub fn spec_path(&self, tasks_dir: &Path) -> PathBuf {
        tasks_dir.join(self.relative_dir()).join(SPEC_FILE)
    }
}

/// Create a slug from a task name (lowercase, alphanumeric, hyphens).
pub fn slugify(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

fn is_kebab_case(name: &str) -> bool {
    !name.starts_with('-')
        && !name.ends_with('-')
        && !name.contains("--")
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Trim, drop empties, deduplicate and sort a resource set.
///
/// Conflict checks operate on the normalized form so that planner-side
/// whitespace or duplicates cannot mask a real overlap.
pub fn normalize_resources<'a, I>(resources: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = &'a String>,
{
    resources
        .into_iter()
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .collect()
}

/// Two tasks conflict iff write/write, write/read, or read/write overlap on
/// their normalized resource sets. Read/read is allowed.
pub fn locks_conflict(a: &LockSet, b: &LockSet) -> bool {
    let a_reads = normalize_resources(&a.reads);
    let a_writes = normalize_resources(&a.writes);
    let b_reads = normalize_resources(&b.reads);
    let b_writes = normalize_resources(&b.writes);

    a_writes.intersection(&b_writes).next().is_some()
        || a_writes.intersection(&b_reads).next().is_some()
        || a_reads.intersection(&b_writes).next().is_some()
}

/// Load a single manifest from a task directory.
pub fn load_manifest(task_dir: &Path) -> Result<TaskManifest> {
    let path = task_dir.join(MANIFEST_FILE);
    let content = std::fs::read_to_string(&path).map_err(|source| ManifestError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let manifest: TaskManifest =
        serde_json::from_str(&content).map_err(|source| ManifestError::Parse {
            path: path.display().to_string(),
            source,
        })?;
    manifest.validate()?;
    Ok(manifest)
}

/// Load every task spec under the scheduling stages of a tasks directory.
///
/// Scans `backlog`, `active` and `legacy` (archived tasks are finished work
/// and never rescheduled). Entries are returned sorted by task id; a task id
/// appearing in two stages is a planning error.
pub fn load_task_specs(tasks_dir: &Path) -> Result<Vec<TaskSpec>> {
    let mut specs: Vec<TaskSpec> = Vec::new();
    let mut seen: std::collections::BTreeMap<String, String> = std::collections::BTreeMap::new();

    for stage in [TaskStage::Backlog, TaskStage::Active, TaskStage::Legacy] {
        let stage_dir = tasks_dir.join(stage.as_str());
        if !stage_dir.is_dir() {
            continue;
        }
        let entries = std::fs::read_dir(&stage_dir).map_err(|source| ManifestError::Io {
            path: stage_dir.display().to_string(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| ManifestError::Io {
                path: stage_dir.display().to_string(),
                source,
            })?;
            let path = entry.path();
            if !path.is_dir() || !path.join(MANIFEST_FILE).is_file() {
                continue;
            }
            let manifest = load_manifest(&path)?;
            let dir_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();
            let location = format!("{}/{}", stage.as_str(), dir_name);
            if let Some(first) = seen.insert(manifest.id.clone(), location.clone()) {
                return Err(ManifestError::DuplicateId {
                    id: manifest.id,
                    first,
                    second: location,
                });
            }
            let slug = manifest.slug();
            specs.push(TaskSpec {
                manifest,
                stage,
                dir_name,
                slug,
            });
        }
    }

    specs.sort_by(|a, b| a.manifest.id.cmp(&b.manifest.id));
    Ok(specs)
}
