use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Deserialize;

use bootforge_macros::{Module, Task};

use crate::archive::SourceArchive;
use crate::config::ConfigDoc;
use crate::executor::ExecCtx;
use crate::fetch::http_client;
use crate::modules::build::{BuildConfig, run_make};
use crate::modules::collect::driver_output_dir;
use crate::modules::core::TargetConfig;
use crate::modules::source::{fetch_pinned, source_dir, unpack};
use crate::{Error, Result};

fn default_true() -> bool {
    true
}

/// A signing/packaging helper with its own source archive, built natively
/// and run against the finished build tree.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub url: String,
    pub sha256: Option<String>,
    pub zip_prefix: Option<String>,
    /// Build goals; empty runs the default goal.
    pub build: Vec<String>,
    /// argv with `{tool}`, `{src}` and `{out}` placeholders. Files written to
    /// `{out}` are delivered by artifacts declared with `from = "output"`.
    pub run: Vec<String>,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: String::new(),
            sha256: None,
            zip_prefix: None,
            build: Vec::new(),
            run: Vec::new(),
        }
    }
}

impl ToolConfig {
    pub fn load(doc: &ConfigDoc) -> Result<Self> {
        let cfg: Self = doc.deserialize_path("tool")?.unwrap_or_default();
        if cfg.url.trim().is_empty() {
            return Err(Error::config("[tool].url must be set"));
        }
        Ok(cfg)
    }

    pub fn archive(&self) -> Result<SourceArchive> {
        SourceArchive::from_url(self.url.trim(), self.zip_prefix.as_deref())
    }
}

fn tool_work_dir(ctx: &ExecCtx) -> PathBuf {
    ctx.work_dir().join("tool")
}

pub fn expand_argv(argv: &[String], tool: &Path, src: &Path, out: &Path) -> Vec<String> {
    argv.iter()
        .map(|a| {
            a.replace("{tool}", &tool.display().to_string())
                .replace("{src}", &src.display().to_string())
                .replace("{out}", &out.display().to_string())
        })
        .collect()
}

#[Task(
    id = "tool.fetch",
    phase = "tool",
    provides = ["tool:fetched"],
    after = ["build.make"],
    default_label = "Fetch ancillary tool"
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for FetchTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl FetchTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let target = TargetConfig::load(doc)?;
        let tool = ToolConfig::load(doc)?;
        let archive = tool.archive()?;
        let dir = tool_work_dir(ctx);
        crate::modules::util::ensure_dir(&dir)?;

        let client = http_client()?;
        fetch_pinned(
            ctx,
            &client,
            &archive.file_name,
            &archive.url,
            &dir.join(&archive.file_name),
            tool.sha256.as_deref(),
            target.require_pins,
        )?;
        unpack(ctx, &archive, &dir)?;
        Ok(())
    }
}

#[Task(
    id = "tool.build",
    phase = "tool",
    provides = ["tool:built"],
    after = ["tool.fetch"],
    default_label = "Build ancillary tool"
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BuildTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for BuildTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl BuildTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let tool = ToolConfig::load(doc)?;
        let build = BuildConfig::load(doc)?;
        let dir = tool_work_dir(ctx).join(tool.archive()?.unpack_dir);

        // Host-native build: no cross-compiler environment.
        let mut args = tool.build.clone();
        args.push(format!("-j{}", build.effective_jobs()));
        run_make(ctx, build.tool.trim(), &dir, &args, &Default::default())
    }
}

#[Task(
    id = "tool.sign",
    phase = "tool",
    provides = ["tool:done"],
    after = ["tool.build"],
    default_label = "Run ancillary tool"
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SignTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for SignTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl SignTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let tool = ToolConfig::load(doc)?;
        if tool.run.is_empty() {
            ctx.log("no [tool].run command declared");
            return Ok(());
        }
        let tool_dir = tool_work_dir(ctx).join(tool.archive()?.unpack_dir);
        let src = source_dir(doc, ctx)?;
        let out = driver_output_dir(doc, ctx)?;
        crate::modules::util::ensure_dir(&out)?;

        let argv = expand_argv(&tool.run, &tool_dir, &src, &out);
        let Some((program, args)) = argv.split_first() else {
            return Ok(());
        };
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&src);
        ctx.run_cmd(cmd)
    }
}

#[Module(
    id = "tool",
    config = ToolConfig,
    tasks = [FetchTask, BuildTask, SignTask]
)]
pub struct ToolModule;
