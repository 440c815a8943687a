use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::modules::util::write_json_pretty;

/// File the in-container driver leaves next to the artifacts.
pub const FETCH_RECORD_FILE: &str = "fetch-record.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRecord {
    pub name: String,
    pub url: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub name: String,
    pub dest: String,
    pub sha256: String,
    /// Octal permission bits, e.g. "0755".
    pub mode: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub target: String,
    pub kind: String,
    pub source_url: String,
    pub revision: Option<String>,
    pub generated_at: DateTime<Utc>,
    pub inputs: Vec<FetchRecord>,
    pub artifacts: Vec<ArtifactRecord>,
}

pub fn format_mode(mode: u32) -> String {
    format!("{:04o}", mode & 0o7777)
}

pub fn write_fetch_records(path: &Path, records: &[FetchRecord]) -> Result<()> {
    write_json_pretty(path, &serde_json::to_value(records)?)
}

/// A missing record file is not an error; older drivers did not write one.
pub fn read_fetch_records(path: &Path) -> Result<Vec<FetchRecord>> {
    if !path.is_file() {
        return Ok(Vec::new());
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| Error::fs(format!("failed to read {}: {e}", path.display())))?;
    serde_json::from_str(&raw)
        .map_err(|e| Error::config(format!("invalid fetch record {}: {e}", path.display())))
}

pub fn write_manifest(path: &Path, manifest: &RunManifest) -> Result<()> {
    write_json_pretty(path, &serde_json::to_value(manifest)?)
}

pub fn read_manifest(path: &Path) -> Result<RunManifest> {
    let raw = fs::read_to_string(path)
        .map_err(|e| Error::fs(format!("failed to read manifest {}: {e}", path.display())))?;
    serde_json::from_str(&raw)
        .map_err(|e| Error::config(format!("invalid manifest {}: {e}", path.display())))
}

/// Artifacts whose digest or mode differs between two runs, or that exist in
/// only one of them.
pub fn diff_artifacts(previous: &RunManifest, current: &RunManifest) -> Vec<String> {
    let prev: BTreeMap<&str, &ArtifactRecord> = previous
        .artifacts
        .iter()
        .map(|a| (a.name.as_str(), a))
        .collect();
    let cur: BTreeMap<&str, &ArtifactRecord> = current
        .artifacts
        .iter()
        .map(|a| (a.name.as_str(), a))
        .collect();

    let mut out = Vec::new();
    for (name, a) in &cur {
        match prev.get(name) {
            None => out.push(format!("{name}: not present in previous run")),
            Some(p) if p.sha256 != a.sha256 => {
                out.push(format!("{name}: sha256 {} != {}", a.sha256, p.sha256))
            }
            Some(p) if p.mode != a.mode => {
                out.push(format!("{name}: mode {} != {}", a.mode, p.mode))
            }
            Some(_) => {}
        }
    }
    for name in prev.keys() {
        if !cur.contains_key(name) {
            out.push(format!("{name}: missing from this run"));
        }
    }
    out
}

pub fn verify_against(previous: &Path, current: &RunManifest) -> Result<()> {
    let prev = read_manifest(previous)?;
    let diffs = diff_artifacts(&prev, current);
    if diffs.is_empty() {
        return Ok(());
    }
    Err(Error::integrity(format!(
        "artifacts differ from {}:\n  {}",
        previous.display(),
        diffs.join("\n  ")
    )))
}
