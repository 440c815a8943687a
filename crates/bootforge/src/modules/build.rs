use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;

use serde::Deserialize;

use bootforge_macros::{Module, Task};

use crate::config::ConfigDoc;
use crate::executor::{ExecCtx, apply_command_env};
use crate::modules::core::TargetConfig;
use crate::modules::source::source_dir;
use crate::{Error, Result};

fn default_true() -> bool {
    true
}

fn default_tool() -> String {
    "make".into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Native build goals, e.g. ["zImage", "dtbs"].
    pub targets: Vec<String>,
    /// 0 means one job per available processor.
    pub jobs: usize,
    #[serde(default = "default_tool")]
    pub tool: String,
    pub env: BTreeMap<String, String>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            targets: Vec::new(),
            jobs: 0,
            tool: default_tool(),
            env: BTreeMap::new(),
        }
    }
}

impl BuildConfig {
    pub fn load(doc: &ConfigDoc) -> Result<Self> {
        let cfg: Self = doc.deserialize_path("build")?.unwrap_or_default();
        if cfg.tool.trim().is_empty() {
            return Err(Error::config("[build].tool must not be empty"));
        }
        Ok(cfg)
    }

    pub fn effective_jobs(&self) -> usize {
        if self.jobs == 0 {
            num_cpus::get().max(1)
        } else {
            self.jobs
        }
    }
}

/// Environment every native build step runs with: per-kind fixed strings,
/// then ARCH/CROSS_COMPILE from [target], then [build.env] overrides.
pub fn reproducible_env(target: &TargetConfig, build: &BuildConfig) -> BTreeMap<String, String> {
    let mut env = target.kind.reproducible_env();
    env.insert("ARCH".into(), target.arch.clone());
    env.insert("CROSS_COMPILE".into(), target.cross_compile.clone());
    for (k, v) in &build.env {
        env.insert(k.clone(), v.clone());
    }
    env
}

pub fn run_make(
    ctx: &ExecCtx,
    tool: &str,
    dir: &Path,
    args: &[String],
    envs: &BTreeMap<String, String>,
) -> Result<()> {
    let mut cmd = Command::new(tool);
    cmd.args(args).current_dir(dir);
    apply_command_env(&mut cmd, envs);
    ctx.run_cmd(cmd)
}

#[Task(
    id = "build.make",
    phase = "build",
    provides = ["build:done"],
    after = ["source.unpack", "patches:done?", "configure:done?"],
    default_label = "Native build",
    core = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MakeTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for MakeTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl MakeTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let target = TargetConfig::load(doc)?;
        let build = BuildConfig::load(doc)?;
        let src = source_dir(doc, ctx)?;
        let envs = reproducible_env(&target, &build);
        for (k, v) in &envs {
            ctx.log(&format!("env {k}={v}"));
        }

        let mut args = build.targets.clone();
        args.push(format!("-j{}", build.effective_jobs()));
        run_make(ctx, build.tool.trim(), &src, &args, &envs)
    }
}

#[Module(
    id = "build",
    config = BuildConfig,
    tasks = [MakeTask]
)]
pub struct BuildModule;
