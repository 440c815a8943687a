use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Deserialize;
use tracing::warn;

use bootforge_macros::{Module, Task};

use crate::config::ConfigDoc;
use crate::executor::ExecCtx;
use crate::manifest::{
    ArtifactRecord, FETCH_RECORD_FILE, RunManifest, format_mode, read_fetch_records,
    verify_against, write_manifest,
};
use crate::modules::bootscript::BootscriptConfig;
use crate::modules::collect::CollectConfig;
use crate::modules::configure::ConfigureConfig;
use crate::modules::core::TargetConfig;
use crate::modules::patches::PatchesConfig;
use crate::modules::source::SourceConfig;
use crate::modules::util::{copy_file_preserve_mode, file_mode, sha256_file_hex, write_text};
use crate::template::{TemplateVars, render};
use crate::workspace::{PackagePaths, basename};
use crate::{Error, Result};

/// File name of the driver binary inside the image build context.
pub const DRIVER_BINARY: &str = "bootforge";
/// File name of the resolved build spec inside the image build context.
pub const STAGED_SPEC: &str = "build.toml";

fn default_true() -> bool {
    true
}

fn default_template() -> String {
    "Dockerfile.tmpl".into()
}

fn default_driver_target() -> String {
    "x86_64-unknown-linux-musl".into()
}

fn default_output_mount() -> String {
    "/tmp/buildresult".into()
}

fn default_image_prefix() -> String {
    "bootforge-rebuild-".into()
}

fn default_input_dir() -> String {
    "/usr/src/bootforge".into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_template")]
    pub template: String,
    /// Extra package-relative files to stage next to the driver.
    pub inputs: Vec<String>,
    #[serde(default = "default_driver_target")]
    pub driver_target: String,
    #[serde(default = "default_output_mount")]
    pub output_mount: String,
    #[serde(default = "default_image_prefix")]
    pub image_prefix: String,
    #[serde(default = "default_input_dir")]
    pub input_dir: String,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            template: default_template(),
            inputs: Vec::new(),
            driver_target: default_driver_target(),
            output_mount: default_output_mount(),
            image_prefix: default_image_prefix(),
            input_dir: default_input_dir(),
        }
    }
}

impl ContainerConfig {
    pub fn load(doc: &ConfigDoc) -> Result<Self> {
        let cfg: Self = doc.deserialize_path("container")?.unwrap_or_default();
        if !cfg.output_mount.starts_with('/') || !cfg.input_dir.starts_with('/') {
            return Err(Error::config(
                "[container].output_mount and input_dir must be absolute container paths",
            ));
        }
        Ok(cfg)
    }

    pub fn image_tag(&self, target: &TargetConfig) -> String {
        format!("{}{}", self.image_prefix, target.name)
    }
}

/// Every package file the driver needs at runtime, in declaration order.
pub fn staged_inputs(doc: &ConfigDoc) -> Result<Vec<String>> {
    let mut out: Vec<String> = Vec::new();
    let mut push = |raw: &str| {
        let raw = raw.trim();
        if !raw.is_empty() && !out.iter().any(|s| s == raw) {
            out.push(raw.to_string());
        }
    };

    let container: ContainerConfig = doc.deserialize_path("container")?.unwrap_or_default();
    container.inputs.iter().for_each(|s| push(s));
    if let Some(c) = doc.deserialize_path::<ConfigureConfig>("configure")?
        && let Some(f) = c.fragment.as_deref()
    {
        push(f);
    }
    if let Some(b) = doc.deserialize_path::<BootscriptConfig>("bootscript")? {
        push(&b.source);
    }
    if let Some(p) = doc.deserialize_path::<PatchesConfig>("patches")? {
        p.series.iter().for_each(|s| push(s));
    }
    Ok(out)
}

#[cfg(unix)]
fn host_ids() -> (u32, u32) {
    let uid = unsafe { libc::getuid() };
    let gid = unsafe { libc::getgid() };
    (uid, gid)
}

#[cfg(not(unix))]
fn host_ids() -> (u32, u32) {
    (0, 0)
}

/// Render the image definition for `files` (staged basenames).
pub fn render_image_definition(
    template: &str,
    container: &ContainerConfig,
    uid: u32,
    gid: u32,
    files: Vec<String>,
) -> Result<String> {
    let mut vars = TemplateVars::default();
    vars.set("uid", uid.to_string())
        .set("gid", gid.to_string())
        .set("binary", DRIVER_BINARY)
        .set("spec", STAGED_SPEC)
        .set("output", container.output_mount.as_str())
        .set("input_dir", container.input_dir.as_str())
        .set_list("files", files);
    render(template, &vars)
}

#[Task(
    id = "container.stage",
    phase = "stage",
    provides = ["container:context"],
    after = ["core.init"],
    default_label = "Stage build inputs",
    core = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StageTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for StageTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl StageTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let target = TargetConfig::load(doc)?;
        let staging = ctx.staging_or_init(&target.name)?;

        for rel in staged_inputs(doc)? {
            let from = ctx.opts.pkg.resolve(&rel)?;
            let to = staging.context().join(basename(&rel)?);
            copy_file_preserve_mode(&from, &to)?;
            ctx.log(&format!("staged {rel}"));
        }
        write_text(&staging.context().join(STAGED_SPEC), &doc.to_toml_string()?)
    }
}

#[Task(
    id = "container.driver",
    phase = "stage",
    provides = ["container:driver"],
    after = ["container.stage"],
    default_label = "Build in-container driver",
    core = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DriverTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for DriverTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

fn workspace_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("..").join("..")
}

impl DriverTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let target = TargetConfig::load(doc)?;
        let container = ContainerConfig::load(doc)?;
        let staging = ctx.staging_or_init(&target.name)?;

        let binary = match ctx.opts.driver_binary.clone() {
            Some(prebuilt) => {
                ctx.log(&format!("using prebuilt driver {}", prebuilt.display()));
                prebuilt
            }
            None => {
                let root = workspace_root();
                let target_dir = root.join("target");
                let cargo = std::env::var_os("CARGO").unwrap_or_else(|| "cargo".into());
                let mut cmd = Command::new(cargo);
                cmd.args(["build", "--release", "--bin", DRIVER_BINARY])
                    .arg("--target")
                    .arg(&container.driver_target)
                    .arg("--target-dir")
                    .arg(&target_dir)
                    .env("RUSTFLAGS", "-C target-feature=+crt-static")
                    .current_dir(&root);
                ctx.run_cmd(cmd).map_err(|e| {
                    e.context(format!(
                        "building the driver for {} (is the rust target installed?)",
                        container.driver_target
                    ))
                })?;
                target_dir
                    .join(&container.driver_target)
                    .join("release")
                    .join(DRIVER_BINARY)
            }
        };
        copy_file_preserve_mode(&binary, &staging.context().join(DRIVER_BINARY))
    }
}

#[Task(
    id = "container.image",
    phase = "image",
    provides = ["container:image"],
    after = ["container.driver"],
    default_label = "Build container image",
    core = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ImageTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for ImageTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl ImageTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let target = TargetConfig::load(doc)?;
        let container = ContainerConfig::load(doc)?;
        let staging = ctx.staging_or_init(&target.name)?;

        let template_path = ctx.opts.pkg.resolve(&container.template)?;
        let template = fs::read_to_string(&template_path).map_err(|e| {
            Error::template(format!(
                "failed to read image template {}: {e}",
                template_path.display()
            ))
        })?;
        let files = staged_inputs(doc)?
            .iter()
            .map(|rel| basename(rel))
            .collect::<Result<Vec<_>>>()?;
        let (uid, gid) = host_ids();
        let rendered = render_image_definition(&template, &container, uid, gid, files)
            .map_err(|e| e.context(template_path.display()))?;
        write_text(&staging.context().join("Dockerfile"), &rendered)?;

        let engine = ctx.container_engine()?;
        let tag = container.image_tag(&target);
        ctx.log(&format!("building image {tag}"));
        ctx.run_cmd(engine.build_command(&tag, staging.context()))
    }
}

#[Task(
    id = "container.run",
    phase = "run",
    provides = ["container:ran"],
    after = ["container.image"],
    default_label = "Run build container",
    core = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for RunTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl RunTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let target = TargetConfig::load(doc)?;
        let container = ContainerConfig::load(doc)?;
        let staging = ctx.staging_or_init(&target.name)?;
        let engine = ctx.container_engine()?;
        let tag = container.image_tag(&target);
        ctx.run_cmd(engine.run_command(&tag, staging.result(), &container.output_mount))
    }
}

#[Task(
    id = "container.export",
    phase = "export",
    provides = ["container:exported"],
    after = ["container.run"],
    default_label = "Export artifacts",
    core = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExportTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for ExportTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl ExportTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let target = TargetConfig::load(doc)?;
        let staging = ctx.staging_or_init(&target.name)?;
        let pkg = &ctx.opts.pkg;

        let artifacts = export_artifacts(doc, pkg, staging.result())?;
        for a in &artifacts {
            ctx.log(&format!("{} -> {} ({}, sha256 {})", a.name, a.dest, a.mode, a.sha256));
        }
        let manifest = build_manifest(doc, staging.result(), artifacts)?;

        if let Some(prev) = ctx.opts.verify_against.as_deref() {
            verify_against(prev, &manifest)?;
            ctx.log(&format!("artifacts match {}", prev.display()));
        }
        let path = manifest_path(doc, pkg)?;
        write_manifest(&path, &manifest)?;
        ctx.log(&format!("wrote manifest {}", path.display()));
        Ok(())
    }
}

pub fn manifest_path(doc: &ConfigDoc, pkg: &PackagePaths) -> Result<PathBuf> {
    let target = TargetConfig::load(doc)?;
    let collect = CollectConfig::load(doc)?;
    match collect.manifest.as_deref() {
        Some(rel) => pkg.resolve(rel),
        None => pkg.resolve(&format!("manifests/{}.json", target.name)),
    }
}

/// Copy every declared artifact from `result_dir` to its package destination.
/// Nothing is partial: a missing artifact fails the export.
pub fn export_artifacts(
    doc: &ConfigDoc,
    pkg: &PackagePaths,
    result_dir: &Path,
) -> Result<Vec<ArtifactRecord>> {
    let collect = CollectConfig::load(doc)?;

    let mut expected = BTreeSet::new();
    let mut pending = Vec::new();
    for a in &collect.artifacts {
        let name = a.out_name()?;
        let from = result_dir.join(&name);
        if !from.is_file() {
            return Err(Error::fs(format!(
                "expected artifact {name} missing from {}",
                result_dir.display()
            )));
        }
        expected.insert(name.clone());
        pending.push((name, from, a.dest.clone()));
    }

    for entry in walkdir::WalkDir::new(result_dir)
        .min_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(result_dir).unwrap_or(entry.path());
        let rel = rel.to_string_lossy();
        if rel != FETCH_RECORD_FILE && !expected.contains(&*rel) {
            warn!(file = %rel, "undeclared file in build output; ignoring");
        }
    }

    let mut out = Vec::with_capacity(pending.len());
    for (name, from, dest_rel) in pending {
        let dest = pkg.resolve(&dest_rel)?;
        if let Some(parent) = dest.parent() {
            crate::modules::util::ensure_dir(parent)?;
        }
        copy_file_preserve_mode(&from, &dest)?;
        let meta = fs::metadata(&dest)
            .map_err(|e| Error::fs(format!("failed to stat {}: {e}", dest.display())))?;
        out.push(ArtifactRecord {
            name,
            dest: dest_rel,
            sha256: sha256_file_hex(&dest)?,
            mode: format_mode(file_mode(&dest)?),
            bytes: meta.len(),
        });
    }
    Ok(out)
}

pub fn build_manifest(
    doc: &ConfigDoc,
    result_dir: &Path,
    artifacts: Vec<ArtifactRecord>,
) -> Result<RunManifest> {
    let target = TargetConfig::load(doc)?;
    let source = SourceConfig::load(doc)?;
    Ok(RunManifest {
        target: target.name.clone(),
        kind: target.kind.as_str().to_string(),
        source_url: source.resolved_url()?,
        revision: source.revision.clone(),
        generated_at: chrono::Utc::now(),
        inputs: read_fetch_records(&result_dir.join(FETCH_RECORD_FILE))?,
        artifacts,
    })
}

#[Module(
    id = "container",
    config = ContainerConfig,
    tasks = [StageTask, DriverTask, ImageTask, RunTask, ExportTask]
)]
pub struct ContainerModule;
