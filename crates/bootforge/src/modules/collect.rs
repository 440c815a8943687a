use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::Deserialize;

use bootforge_macros::{Module, Task};

use crate::config::ConfigDoc;
use crate::executor::ExecCtx;
use crate::manifest::{FETCH_RECORD_FILE, write_fetch_records};
use crate::modules::container::ContainerConfig;
use crate::modules::source::source_dir;
use crate::modules::util::{copy_file_preserve_mode, ensure_dir};
use crate::workspace::{basename, validate_rel_path};
use crate::{Error, Result};

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CollectConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub artifacts: Vec<ArtifactConfig>,
    /// Package-relative run manifest; defaults to manifests/<target>.json.
    pub manifest: Option<String>,
}

impl Default for CollectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            artifacts: Vec::new(),
            manifest: None,
        }
    }
}

/// Where an artifact's `path` is rooted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactOrigin {
    /// The unpacked source tree.
    #[default]
    Source,
    /// The driver output directory, where `[tool].run` writes `{out}` files.
    Output,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArtifactConfig {
    /// Relative to the tree named by `from`.
    pub path: String,
    #[serde(default)]
    pub from: ArtifactOrigin,
    /// File name in the output directory; defaults to the basename of `path`.
    pub name: Option<String>,
    /// Package-relative final destination.
    pub dest: String,
}

impl ArtifactConfig {
    pub fn out_name(&self) -> Result<String> {
        match self.name.as_deref().map(str::trim) {
            Some(n) if !n.is_empty() => Ok(n.to_string()),
            _ => basename(&self.path),
        }
    }
}

impl CollectConfig {
    pub fn load(doc: &ConfigDoc) -> Result<Self> {
        let cfg: Self = doc.require_path("collect")?;
        if cfg.artifacts.is_empty() {
            return Err(Error::config("[collect] declares no artifacts"));
        }
        let mut names = BTreeSet::new();
        for a in &cfg.artifacts {
            validate_rel_path(&a.path)?;
            validate_rel_path(&a.dest)?;
            let name = a.out_name()?;
            if name.contains('/') || name == FETCH_RECORD_FILE {
                return Err(Error::config(format!("invalid artifact name '{name}'")));
            }
            if !names.insert(name.clone()) {
                return Err(Error::config(format!("duplicate artifact name '{name}'")));
            }
        }
        if let Some(m) = cfg.manifest.as_deref() {
            validate_rel_path(m)?;
        }
        Ok(cfg)
    }
}

/// Where the driver deposits artifacts: `--output` or the container mount.
pub fn driver_output_dir(doc: &ConfigDoc, ctx: &ExecCtx) -> Result<PathBuf> {
    if let Some(dir) = ctx.opts.output_dir.as_ref() {
        return Ok(dir.clone());
    }
    let container: ContainerConfig = doc.deserialize_path("container")?.unwrap_or_default();
    Ok(PathBuf::from(container.output_mount))
}

#[Task(
    id = "collect.artifacts",
    phase = "collect",
    provides = ["collect:done"],
    after = ["build:done", "tool:done?", "bootscript:done?"],
    default_label = "Collect artifacts",
    core = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ArtifactsTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for ArtifactsTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl ArtifactsTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let cfg = CollectConfig::load(doc)?;
        let src = source_dir(doc, ctx)?;
        let out = driver_output_dir(doc, ctx)?;
        ensure_dir(&out)?;

        for a in &cfg.artifacts {
            let root = match a.from {
                ArtifactOrigin::Source => &src,
                ArtifactOrigin::Output => &out,
            };
            let from = root.join(validate_rel_path(&a.path)?);
            if !from.is_file() {
                return Err(Error::fs(format!(
                    "expected artifact {} not found at {} (did the upstream output layout change?)",
                    a.path,
                    from.display()
                )));
            }
            let to = out.join(a.out_name()?);
            if from != to {
                copy_file_preserve_mode(&from, &to)?;
            }
            ctx.log(&format!("collected {} -> {}", a.path, to.display()));
        }

        write_fetch_records(&out.join(FETCH_RECORD_FILE), &ctx.fetch_records())
    }
}

#[Module(
    id = "collect",
    config = CollectConfig,
    tasks = [ArtifactsTask]
)]
pub struct CollectModule;
