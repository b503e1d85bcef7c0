//! Project configuration for the executor.
//!
//! Loaded from `mycelium.yaml` at process start and validated eagerly:
//! every range and enum error is surfaced with its field path before any
//! batch work begins. Unknown validator names are a load error, not a
//! runtime surprise.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::types::EnforcementMode;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config at {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid config value at {field}: expected {expected}, got {got}")]
    InvalidValue {
        field: String,
        expected: String,
        got: String,
    },
    #[error("missing required config field {field}")]
    MissingField { field: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Agent CLI settings for worker turns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    /// Agent binary to invoke for coding turns.
    pub bin: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
    /// Directory passed to the agent for its own configuration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_dir: Option<PathBuf>,
    /// Timeout per coding turn in seconds (0 = no timeout).
    pub turn_timeout_sec: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bin: "claude".to_string(),
            model: "opus".to_string(),
            reasoning_effort: None,
            config_dir: None,
            turn_timeout_sec: 1200,
        }
    }
}

/// Container execution settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DockerConfig {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub stop_timeout_sec: u32,
}

/// A named abstract region of the repository used for lock scheduling and
/// compliance resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceConfig {
    pub name: String,
    /// Path globs (repo-relative) this resource covers.
    #[serde(default)]
    pub paths: Vec<String>,
}

/// When to tear down per-task artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupPolicy {
    #[default]
    OnSuccess,
    Never,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CleanupConfig {
    pub workspaces: CleanupPolicy,
    pub containers: CleanupPolicy,
}

/// Token/cost ceilings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BudgetConfig {
    pub mode: EnforcementMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens_per_task: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_cost_per_task: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens_per_run: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_cost_per_run: Option<f64>,
}

/// Settings shared by the test and style validators.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ValidatorConfig {
    pub mode: EnforcementMode,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ArchitectureValidatorConfig {
    pub mode: EnforcementMode,
    /// Documentation files the validator reads; if none exist the validator
    /// is skipped unless `fail_if_docs_missing` is set.
    pub docs_paths: Vec<String>,
    pub fail_if_docs_missing: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DoctorValidatorConfig {
    pub mode: EnforcementMode,
    /// Run the doctor validator every N finished tasks (0 = never on cadence).
    pub cadence: u32,
}

/// Fixed record of known validators. Unknown keys fail the load.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ValidatorsConfig {
    pub test: ValidatorConfig,
    pub style: ValidatorConfig,
    pub architecture: ArchitectureValidatorConfig,
    pub doctor: DoctorValidatorConfig,
}

/// Severity of an unexpected canary pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanarySeverity {
    Warn,
    #[default]
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DoctorCanaryConfig {
    pub enabled: bool,
    pub env_var: String,
    pub severity: CanarySeverity,
}

impl Default for DoctorCanaryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            env_var: "ORCH_CANARY".to_string(),
            severity: CanarySeverity::Error,
        }
    }
}

/// Policy/checkset engine settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChecksConfig {
    pub mode: EnforcementMode,
    /// Globs identifying externally-visible surface files (public APIs,
    /// schemas, wire formats). Touching one raises the checks tier.
    pub surface_patterns: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControlPlaneConfig {
    pub enabled: bool,
}

/// Compliance checker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ComplianceConfig {
    pub mode: EnforcementMode,
    /// Resource assigned to files no resolver claims.
    pub fallback_resource: String,
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        Self {
            mode: EnforcementMode::Off,
            fallback_resource: "unassigned".to_string(),
        }
    }
}

/// Validated project configuration. Field semantics are referenced
/// throughout the engines; this struct is the single source of defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProjectConfig {
    /// Project name; namespaces all state under the Mycelium home.
    pub project: String,
    /// Path to the target repository.
    pub repo_path: PathBuf,
    /// Tasks directory inside the target repo.
    pub tasks_dir: PathBuf,
    /// Mainline branch; auto-detected from the repo when empty.
    pub main_branch: Option<String>,
    pub task_branch_prefix: String,

    pub max_parallel: u32,
    pub max_retries: u32,
    /// Age after which a `running` task found on load is considered
    /// abandoned by a dead process.
    pub stale_after_ms: u64,

    /// Project-wide doctor command; the per-task effective command may be
    /// narrowed by the policy engine.
    pub doctor: String,
    pub doctor_timeout_sec: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lint: Option<String>,
    pub lint_timeout_sec: u32,

    pub bootstrap_cmds: Vec<String>,
    pub checkpoint_commits: bool,
    pub default_test_paths: Vec<String>,

    pub agent: AgentConfig,
    pub docker: DockerConfig,
    pub resources: Vec<ResourceConfig>,
    pub cleanup: CleanupConfig,
    pub budgets: BudgetConfig,
    pub validators: ValidatorsConfig,
    pub doctor_canary: DoctorCanaryConfig,
    pub checks: ChecksConfig,
    pub compliance: ComplianceConfig,
    pub control_plane: ControlPlaneConfig,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            project: String::new(),
            repo_path: PathBuf::from("."),
            tasks_dir: PathBuf::from("tasks"),
            main_branch: None,
            task_branch_prefix: "mycelium".to_string(),
            max_parallel: 2,
            max_retries: 2,
            stale_after_ms: 900_000,
            doctor: String::new(),
            doctor_timeout_sec: 600,
            lint: None,
            lint_timeout_sec: 300,
            bootstrap_cmds: Vec::new(),
            checkpoint_commits: true,
            default_test_paths: Vec::new(),
            agent: AgentConfig::default(),
            docker: DockerConfig::default(),
            resources: Vec::new(),
            cleanup: CleanupConfig::default(),
            budgets: BudgetConfig::default(),
            validators: ValidatorsConfig::default(),
            doctor_canary: DoctorCanaryConfig::default(),
            checks: ChecksConfig::default(),
            compliance: ComplianceConfig::default(),
            control_plane: ControlPlaneConfig::default(),
        }
    }
}

impl ProjectConfig {
    /// Load and validate a config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut config: Self =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        config.resolve_paths(path.parent().unwrap_or_else(|| Path::new(".")));
        config.validate()?;
        Ok(config)
    }

    /// Resolve relative paths against the directory holding the config file.
    pub fn resolve_paths(&mut self, base: &Path) {
        if self.repo_path.is_relative() {
            self.repo_path = base.join(&self.repo_path);
        }
        if let Some(ref dir) = self.agent.config_dir {
            if dir.is_relative() {
                self.agent.config_dir = Some(base.join(dir));
            }
        }
    }

    /// Validate ranges and required fields. Fails fast at process start.
    pub fn validate(&self) -> Result<()> {
        if self.project.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "project".to_string(),
            });
        }
        if self.doctor.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "doctor".to_string(),
            });
        }
        if self.max_parallel == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_parallel".to_string(),
                expected: "integer >= 1".to_string(),
                got: self.max_parallel.to_string(),
            });
        }
        if self.doctor_canary.env_var.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "doctor_canary.env_var".to_string(),
                expected: "non-empty variable name".to_string(),
                got: String::new(),
            });
        }
        let mut seen = std::collections::BTreeSet::new();
        for resource in &self.resources {
            if resource.name.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "resources[].name".to_string(),
                    expected: "non-empty name".to_string(),
                    got: String::new(),
                });
            }
            if !seen.insert(resource.name.as_str()) {
                return Err(ConfigError::InvalidValue {
                    field: "resources[].name".to_string(),
                    expected: "unique names".to_string(),
                    got: resource.name.clone(),
                });
            }
        }
        if self.docker.enabled && self.docker.image.is_none() {
            return Err(ConfigError::MissingField {
                field: "docker.image".to_string(),
            });
        }
        Ok(())
    }

    /// Names of all statically declared resources.
    pub fn resource_names(&self) -> Vec<String> {
        self.resources.iter().map(|r| r.name.clone()).collect()
    }
}
