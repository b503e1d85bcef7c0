//! Per-task policy and checkset decisions.
//!
//! Before an attempt runs, the engine decides which checks tier the task
//! gets and therefore which doctor command the worker will execute. The
//! decision weighs the manifest's declared scope, surface patterns from
//! config, and the task's TDD mode. With `checks.mode=off` the decision is
//! a pass-through to the manifest's own doctor command.

use glob::Pattern;
use mycelium_core::config::{ChecksConfig, ProjectConfig};
use mycelium_core::manifest::{TaskManifest, TddMode};
use mycelium_core::types::EnforcementMode;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("failed to write checkset report {path}: {source}")]
    Report {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, PolicyError>;

/// How much verification a task gets before merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksTier {
    /// Narrow fast checks; only for strict-TDD tasks off the surface.
    Fast,
    /// The task's own doctor command.
    Standard,
    /// Project-wide doctor; used when surface files are in scope.
    Full,
}

impl ChecksTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Standard => "standard",
            Self::Full => "full",
        }
    }
}

/// Which declared write globs overlap configured surface patterns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SurfaceDetection {
    pub touches_surface: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matched_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecksDecision {
    pub mode: EnforcementMode,
    pub selected_command: String,
    pub rationale: String,
}

/// The persisted per-task decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub task_id: String,
    pub tier: ChecksTier,
    pub checks: ChecksDecision,
    pub surface_detection: SurfaceDetection,
}

impl PolicyDecision {
    /// The doctor command the worker runner will execute.
    pub fn effective_doctor(&self) -> &str {
        &self.checks.selected_command
    }
}

/// Derive the policy decision for one task.
pub fn decide(config: &ProjectConfig, manifest: &TaskManifest) -> PolicyDecision {
    let checks = &config.checks;

    if checks.mode == EnforcementMode::Off {
        return PolicyDecision {
            task_id: manifest.id.clone(),
            tier: ChecksTier::Standard,
            checks: ChecksDecision {
                mode: EnforcementMode::Off,
                selected_command: manifest.verify.doctor.clone(),
                rationale: "checks disabled; manifest doctor".to_string(),
            },
            surface_detection: SurfaceDetection::default(),
        };
    }

    let surface_detection = detect_surface(checks, manifest);

    let (tier, selected_command, rationale) = if surface_detection.touches_surface {
        (
            ChecksTier::Full,
            config.doctor.clone(),
            format!(
                "write scope overlaps surface patterns ({}); project doctor required",
                surface_detection.matched_patterns.join(", ")
            ),
        )
    } else if manifest.tdd_mode == TddMode::Strict {
        match &manifest.verify.fast {
            Some(fast) => (
                ChecksTier::Fast,
                fast.clone(),
                "strict TDD with fast verify; narrow checks".to_string(),
            ),
            None => (
                ChecksTier::Standard,
                manifest.verify.doctor.clone(),
                "strict TDD without fast verify; manifest doctor".to_string(),
            ),
        }
    } else {
        (
            ChecksTier::Standard,
            manifest.verify.doctor.clone(),
            "manifest doctor".to_string(),
        )
    };

    debug!(
        task_id = %manifest.id,
        tier = tier.as_str(),
        command = %selected_command,
        "policy decision"
    );

    PolicyDecision {
        task_id: manifest.id.clone(),
        tier,
        checks: ChecksDecision {
            mode: checks.mode,
            selected_command,
            rationale,
        },
        surface_detection,
    }
}

/// A declared write path touches the surface when it matches a surface
/// pattern, or a surface pattern matches it (globs on both sides, so the
/// comparison is tried in both directions).
fn detect_surface(checks: &ChecksConfig, manifest: &TaskManifest) -> SurfaceDetection {
    let mut matched_patterns = Vec::new();
    for pattern_str in &checks.surface_patterns {
        let Ok(pattern) = Pattern::new(pattern_str) else {
            continue;
        };
        let hit = manifest.files.writes.iter().any(|write_glob| {
            pattern.matches(write_glob)
                || Pattern::new(write_glob).is_ok_and(|w| w.matches(pattern_str))
        });
        if hit {
            matched_patterns.push(pattern_str.clone());
        }
    }
    SurfaceDetection {
        touches_surface: !matched_patterns.is_empty(),
        matched_patterns,
    }
}

/// Persist the decision as the task's checkset report.
pub fn write_report(path: &Path, decision: &PolicyDecision) -> Result<()> {
    let report = |source| PolicyError::Report {
        path: path.display().to_string(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(report)?;
    }
    let body = serde_json::to_string_pretty(decision).unwrap_or_else(|_| "{}".to_string());
    std::fs::write(path, body).map_err(report)
}
