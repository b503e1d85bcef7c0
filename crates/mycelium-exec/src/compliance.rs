//! Write-scope compliance checking.
//!
//! After a worker finishes, the files it changed relative to mainline are
//! resolved to resources and checked against the scope the task declared.
//! A file violates if its resource is not locked for write, or the file is
//! not covered by a declared write glob. `block` parks the task for human
//! review; `warn` only logs.

use glob::Pattern;
use mycelium_core::config::ResourceConfig;
use mycelium_core::manifest::TaskManifest;
use mycelium_core::types::EnforcementMode;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

use crate::git;

#[derive(Debug, Error)]
pub enum ComplianceError {
    #[error("git error: {0}")]
    Git(#[from] git::GitError),
    #[error("failed to write compliance report {path}: {source}")]
    Report {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, ComplianceError>;

pub const REASON_RESOURCE_NOT_LOCKED: &str = "resource_not_locked_for_write";
pub const REASON_FILE_NOT_DECLARED: &str = "file_not_declared_for_write";

/// Ownership interface exposed by the control-plane code-analysis model.
/// When the control plane is disabled, resolution falls back to the static
/// resource globs from config.
pub trait OwnershipModel: Send + Sync {
    /// Resource that owns a repo-relative path, if the model knows one.
    fn resolve_owner(&self, path: &str) -> Option<String>;
    /// Components touching a path; component owners get rescope guidance.
    fn resolve_components(&self, path: &str) -> Vec<String>;
}

/// Compliance status for one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceStatus {
    Pass,
    Warn,
    Block,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    pub path: String,
    /// Resources the file resolved to.
    pub resources: Vec<String>,
    /// Tagged reasons; see the `REASON_*` constants.
    pub reasons: Vec<String>,
    /// Suggested remediations when a component owner is involved.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub guidance: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceOutcome {
    pub status: ComplianceStatus,
    pub changed_files: Vec<String>,
    pub violations: Vec<Violation>,
}

/// Configuration slice the checker needs.
#[derive(Clone)]
pub struct ComplianceInputs<'a> {
    pub workspace_path: &'a Path,
    pub main_branch: &'a str,
    pub manifest: &'a TaskManifest,
    /// Config-declared resources only.
    pub static_resources: &'a [ResourceConfig],
    pub fallback_resource: &'a str,
    pub ownership: Option<&'a dyn OwnershipModel>,
    pub mode: EnforcementMode,
    pub report_path: Option<&'a Path>,
}

impl std::fmt::Debug for ComplianceInputs<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComplianceInputs")
            .field("workspace_path", &self.workspace_path)
            .field("main_branch", &self.main_branch)
            .field("manifest", &self.manifest)
            .field("static_resources", &self.static_resources)
            .field("fallback_resource", &self.fallback_resource)
            .field("ownership", &self.ownership.map(|_| "<dyn OwnershipModel>"))
            .field("mode", &self.mode)
            .field("report_path", &self.report_path)
            .finish()
    }
}

/// Run the compliance check for one finished task.
pub fn check(inputs: &ComplianceInputs<'_>) -> Result<ComplianceOutcome> {
    let changed_files = git::list_changed_files(inputs.workspace_path, inputs.main_branch)?;

    let write_locks: std::collections::BTreeSet<&str> = inputs
        .manifest
        .locks
        .writes
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect();
    let write_globs: Vec<Pattern> = inputs
        .manifest
        .files
        .writes
        .iter()
        .filter_map(|g| Pattern::new(g).ok())
        .collect();

    let mut violations = Vec::new();
    for path in &changed_files {
        let (resources, from_components) = resolve_resources(inputs, path);

        let mut reasons = Vec::new();
        if resources.iter().any(|r| !write_locks.contains(r.as_str())) {
            reasons.push(REASON_RESOURCE_NOT_LOCKED.to_string());
        }
        if !write_globs.iter().any(|g| g.matches(path)) {
            reasons.push(REASON_FILE_NOT_DECLARED.to_string());
        }

        if !reasons.is_empty() {
            let guidance = if from_components {
                vec!["expand_scope".to_string(), "split_task".to_string()]
            } else {
                Vec::new()
            };
            violations.push(Violation {
                path: path.clone(),
                resources,
                reasons,
                guidance,
            });
        }
    }

    let status = if violations.is_empty() {
        ComplianceStatus::Pass
    } else {
        match inputs.mode {
            EnforcementMode::Block => ComplianceStatus::Block,
            EnforcementMode::Warn => ComplianceStatus::Warn,
            EnforcementMode::Off => ComplianceStatus::Pass,
        }
    };

    let outcome = ComplianceOutcome {
        status,
        changed_files,
        violations,
    };

    match status {
        ComplianceStatus::Pass => {}
        ComplianceStatus::Warn => warn!(
            task_id = %inputs.manifest.id,
            violations = outcome.violations.len(),
            "compliance violations (warn mode)"
        ),
        ComplianceStatus::Block => warn!(
            task_id = %inputs.manifest.id,
            violations = outcome.violations.len(),
            "compliance violations block the task"
        ),
    }

    if let Some(report_path) = inputs.report_path {
        write_report(report_path, &outcome)?;
        info!(report = %report_path.display(), "compliance report written");
    }

    Ok(outcome)
}

/// Resolve the resources owning a path: control-plane model first, then
/// static resource globs, then the fallback resource. The bool reports
/// whether the resolution came from component ownership.
fn resolve_resources(inputs: &ComplianceInputs<'_>, path: &str) -> (Vec<String>, bool) {
    if let Some(model) = inputs.ownership {
        if let Some(owner) = model.resolve_owner(path) {
            return (vec![owner], false);
        }
        let components = model.resolve_components(path);
        if !components.is_empty() {
            return (components, true);
        }
    }

    let mut matched: Vec<String> = inputs
        .static_resources
        .iter()
        .filter(|resource| {
            resource
                .paths
                .iter()
                .filter_map(|g| Pattern::new(g).ok())
                .any(|g| g.matches(path))
        })
        .map(|resource| resource.name.clone())
        .collect();

    if matched.is_empty() {
        matched.push(inputs.fallback_resource.to_string());
    }
    (matched, false)
}

fn write_report(path: &Path, outcome: &ComplianceOutcome) -> Result<()> {
    let report = |source| ComplianceError::Report {
        path: path.display().to_string(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(report)?;
    }
    let body = serde_json::to_string_pretty(outcome).unwrap_or_else(|_| "{}".to_string());
    std::fs::write(path, body).map_err(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mycelium_core::manifest::{FileSet, LockSet, TddMode, VerifySpec};
    use std::process::Command;
    use tempfile::TempDir;

    fn setup_repo_with_workspace() -> (TempDir, TempDir, std::path::PathBuf) {
        let repo = TempDir::new().unwrap();
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
        std::fs::create_dir_all(repo.path().join("src/api")).unwrap();
        std::fs::write(repo.path().join("src/api/mod.rs"), "// api").unwrap();
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

        let ws_root = TempDir::new().unwrap();
        let workspace = ws_root.path().join("ws");
        git::prepare_workspace(repo.path(), "main", "mycelium/001-t", &workspace).unwrap();
        (repo, ws_root, workspace)
    }

    fn manifest_with_scope(lock_writes: &[&str], file_writes: &[&str]) -> TaskManifest {
        let mut locks = LockSet::default();
        for lock in lock_writes {
            locks.writes.insert((*lock).to_string());
        }
        let mut files = FileSet::default();
        for glob in file_writes {
            files.writes.insert((*glob).to_string());
        }
        TaskManifest {
            id: "001".to_string(),
            name: "test-task".to_string(),
            description: String::new(),
            estimated_minutes: 5,
            dependencies: Vec::new(),
            locks,
            files,
            affected_tests: Default::default(),
            test_paths: Default::default(),
            tdd_mode: TddMode::Off,
            verify: VerifySpec {
                doctor: "exit 0".to_string(),
                fast: None,
            },
        }
    }

    fn api_resource() -> Vec<ResourceConfig> {
        vec![ResourceConfig {
            name: "api".to_string(),
            paths: vec!["src/api/**".to_string()],
        }]
    }

    struct FixedOwner(&'static str);
    impl OwnershipModel for FixedOwner {
        fn resolve_owner(&self, _path: &str) -> Option<String> {
            Some(self.0.to_string())
        }
        fn resolve_components(&self, _path: &str) -> Vec<String> {
            Vec::new()
        }
    }

    struct ComponentsOnly;
    impl OwnershipModel for ComponentsOnly {
        fn resolve_owner(&self, _path: &str) -> Option<String> {
            None
        }
        fn resolve_components(&self, _path: &str) -> Vec<String> {
            vec!["component:billing".to_string()]
        }
    }

    #[test]
    fn in_scope_change_passes() {
        let (_repo, _ws_root, workspace) = setup_repo_with_workspace();
        std::fs::write(workspace.join("src/api/mod.rs"), "// changed").unwrap();

        let manifest = manifest_with_scope(&["api"], &["src/api/**"]);
        let resources = api_resource();
        let outcome = check(&ComplianceInputs {
            workspace_path: &workspace,
            main_branch: "main",
            manifest: &manifest,
            static_resources: &resources,
            fallback_resource: "unassigned",
            ownership: None,
            mode: EnforcementMode::Block,
            report_path: None,
        })
        .unwrap();

        assert_eq!(outcome.status, ComplianceStatus::Pass);
        assert_eq!(outcome.changed_files, vec!["src/api/mod.rs"]);
        assert!(outcome.violations.is_empty());
    }

    #[test]
    fn unlocked_resource_is_a_violation() {
        let (_repo, _ws_root, workspace) = setup_repo_with_workspace();
        std::fs::write(workspace.join("src/api/mod.rs"), "// changed").unwrap();

        // File glob covers the path, but the api resource is not locked.
        let manifest = manifest_with_scope(&["docs"], &["src/api/**"]);
        let resources = api_resource();
        let outcome = check(&ComplianceInputs {
            workspace_path: &workspace,
            main_branch: "main",
            manifest: &manifest,
            static_resources: &resources,
            fallback_resource: "unassigned",
            ownership: None,
            mode: EnforcementMode::Block,
            report_path: None,
        })
        .unwrap();

        assert_eq!(outcome.status, ComplianceStatus::Block);
        assert_eq!(outcome.violations.len(), 1);
        assert_eq!(
            outcome.violations[0].reasons,
            vec![REASON_RESOURCE_NOT_LOCKED]
        );
        assert_eq!(outcome.violations[0].resources, vec!["api"]);
    }

    #[test]
    fn undeclared_file_is_a_violation() {
        let (_repo, _ws_root, workspace) = setup_repo_with_workspace();
        std::fs::write(workspace.join("src/api/mod.rs"), "// changed").unwrap();

        // Resource locked, but no write glob covers the file.
        let manifest = manifest_with_scope(&["api"], &["docs/**"]);
        let resources = api_resource();
        let outcome = check(&ComplianceInputs {
            workspace_path: &workspace,
            main_branch: "main",
            manifest: &manifest,
            static_resources: &resources,
            fallback_resource: "unassigned",
            ownership: None,
            mode: EnforcementMode::Block,
            report_path: None,
        })
        .unwrap();

        assert_eq!(outcome.violations.len(), 1);
        assert_eq!(outcome.violations[0].reasons, vec![REASON_FILE_NOT_DECLARED]);
    }

    #[test]
    fn both_reasons_can_apply() {
        let (_repo, _ws_root, workspace) = setup_repo_with_workspace();
        std::fs::write(workspace.join("rogue.txt"), "x").unwrap();

        let manifest = manifest_with_scope(&["api"], &["src/api/**"]);
        let resources = api_resource();
        let outcome = check(&ComplianceInputs {
            workspace_path: &workspace,
            main_branch: "main",
            manifest: &manifest,
            static_resources: &resources,
            fallback_resource: "unassigned",
            ownership: None,
            mode: EnforcementMode::Block,
            report_path: None,
        })
        .unwrap();

        // rogue.txt falls to the unassigned fallback, which is not locked.
        assert_eq!(outcome.violations.len(), 1);
        assert_eq!(
            outcome.violations[0].reasons,
            vec![REASON_RESOURCE_NOT_LOCKED, REASON_FILE_NOT_DECLARED]
        );
        assert_eq!(outcome.violations[0].resources, vec!["unassigned"]);
    }

    #[test]
    fn warn_mode_downgrades_block() {
        let (_repo, _ws_root, workspace) = setup_repo_with_workspace();
        std::fs::write(workspace.join("rogue.txt"), "x").unwrap();

        let manifest = manifest_with_scope(&[], &[]);
        let outcome = check(&ComplianceInputs {
            workspace_path: &workspace,
            main_branch: "main",
            manifest: &manifest,
            static_resources: &[],
            fallback_resource: "unassigned",
            ownership: None,
            mode: EnforcementMode::Warn,
            report_path: None,
        })
        .unwrap();
        assert_eq!(outcome.status, ComplianceStatus::Warn);
    }

    #[test]
    fn owner_model_takes_precedence_over_globs() {
        let (_repo, _ws_root, workspace) = setup_repo_with_workspace();
        std::fs::write(workspace.join("src/api/mod.rs"), "// changed").unwrap();

        let manifest = manifest_with_scope(&["storage"], &["src/api/**"]);
        let resources = api_resource();
        let owner = FixedOwner("storage");
        let outcome = check(&ComplianceInputs {
            workspace_path: &workspace,
            main_branch: "main",
            manifest: &manifest,
            static_resources: &resources,
            fallback_resource: "unassigned",
            ownership: Some(&owner),
            mode: EnforcementMode::Block,
            report_path: None,
        })
        .unwrap();

        // The model says "storage", which is locked: pass despite the api glob.
        assert_eq!(outcome.status, ComplianceStatus::Pass);
    }

    #[test]
    fn component_owners_get_rescope_guidance() {
        let (_repo, _ws_root, workspace) = setup_repo_with_workspace();
        std::fs::write(workspace.join("src/api/mod.rs"), "// changed").unwrap();

        let manifest = manifest_with_scope(&["api"], &["src/api/**"]);
        let outcome = check(&ComplianceInputs {
            workspace_path: &workspace,
            main_branch: "main",
            manifest: &manifest,
            static_resources: &[],
            fallback_resource: "unassigned",
            ownership: Some(&ComponentsOnly),
            mode: EnforcementMode::Block,
            report_path: None,
        })
        .unwrap();

        assert_eq!(outcome.violations.len(), 1);
        assert_eq!(
            outcome.violations[0].guidance,
            vec!["expand_scope", "split_task"]
        );
    }

    #[test]
    fn report_is_written_when_requested() {
        let (_repo, _ws_root, workspace) = setup_repo_with_workspace();
        std::fs::write(workspace.join("rogue.txt"), "x").unwrap();

        let report_dir = TempDir::new().unwrap();
        let report_path = report_dir.path().join("reports/001/compliance.json");
        let manifest = manifest_with_scope(&[], &[]);
        check(&ComplianceInputs {
            workspace_path: &workspace,
            main_branch: "main",
            manifest: &manifest,
            static_resources: &[],
            fallback_resource: "unassigned",
            ownership: None,
            mode: EnforcementMode::Block,
            report_path: Some(&report_path),
        })
        .unwrap();

        let report: ComplianceOutcome =
            serde_json::from_str(&std::fs::read_to_string(&report_path).unwrap()).unwrap();
        assert_eq!(report.status, ComplianceStatus::Block);
        assert_eq!(report.violations.len(), 1);
    }
}
