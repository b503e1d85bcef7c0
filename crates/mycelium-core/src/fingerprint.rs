//! Task fingerprinting for the ledger.
//!
//! A fingerprint identifies the *content* of a planned task: the manifest
//! plus the spec text. Identical inputs must hash identically across
//! processes and machines, so both inputs are normalized first.
//!
//! Normalization laws:
//! - Manifest: parsed as JSON and re-serialized compactly with all object
//!   keys sorted recursively. Map ordering and formatting cannot leak in.
//! - Spec: split into lines, each line stripped of trailing whitespace,
//!   trailing blank lines dropped, joined with `\n`. Whitespace-only edits
//!   cannot change the fingerprint; any content edit does.
//! - Hash: SHA-256 over the two normalized byte strings, each prefixed by
//!   its length to keep the concatenation unambiguous.

use sha2::{Digest, Sha256};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FingerprintError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("manifest at {path} is not valid JSON: {source}")]
    InvalidManifest {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, FingerprintError>;

/// Compute the stable fingerprint for a task from its on-disk manifest and
/// spec. Returns a lowercase hex SHA-256 digest.
pub fn compute_fingerprint(manifest_path: &Path, spec_path: &Path) -> Result<String> {
    let manifest_raw =
        std::fs::read_to_string(manifest_path).map_err(|source| FingerprintError::Io {
            path: manifest_path.display().to_string(),
            source,
        })?;
    let spec_raw = std::fs::read_to_string(spec_path).map_err(|source| FingerprintError::Io {
        path: spec_path.display().to_string(),
        source,
    })?;

    let manifest_value: serde_json::Value =
        serde_json::from_str(&manifest_raw).map_err(|source| FingerprintError::InvalidManifest {
            path: manifest_path.display().to_string(),
            source,
        })?;

    Ok(fingerprint_contents(&manifest_value, &spec_raw))
}

/// Fingerprint already-loaded contents. Exposed for callers that hold the
/// manifest in memory.
pub fn fingerprint_contents(manifest: &serde_json::Value, spec: &str) -> String {
    let canonical_manifest = canonical_json(manifest);
    let normalized_spec = normalize_spec(spec);

    let mut hasher = Sha256::new();
    hasher.update((canonical_manifest.len() as u64).to_be_bytes());
    hasher.update(canonical_manifest.as_bytes());
    hasher.update((normalized_spec.len() as u64).to_be_bytes());
    hasher.update(normalized_spec.as_bytes());
    hex_digest(&hasher.finalize())
}

/// Serialize a JSON value compactly with recursively sorted object keys.
fn canonical_json(value: &serde_json::Value) -> String {
    fn sort(value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::Object(map) => {
                let sorted: std::collections::BTreeMap<&String, serde_json::Value> =
                    map.iter().map(|(k, v)| (k, sort(v))).collect();
                serde_json::to_value(sorted).unwrap_or(serde_json::Value::Null)
            }
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(sort).collect())
            }
            other => other.clone(),
        }
    }
    serde_json::to_string(&sort(value)).unwrap_or_default()
}

/// Strip trailing whitespace per line and trailing blank lines.
fn normalize_spec(spec: &str) -> String {
    let mut lines: Vec<&str> = spec.lines().map(str::trim_end).collect();
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines.join("\n")
}

fn hex_digest(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}
