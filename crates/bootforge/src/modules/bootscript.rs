use std::path::Path;
use std::process::Command;

use serde::Deserialize;

use bootforge_macros::{Module, Task};

use crate::config::ConfigDoc;
use crate::executor::{ExecCtx, apply_command_env};
use crate::modules::build::{BuildConfig, reproducible_env};
use crate::modules::core::TargetConfig;
use crate::modules::source::source_dir;
use crate::{Error, Result};

fn default_true() -> bool {
    true
}

fn default_output() -> String {
    "boot.scr".into()
}

fn default_name() -> String {
    "Boot Script".into()
}

fn default_mkimage() -> String {
    "./tools/mkimage".into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BootscriptConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub source: String,
    #[serde(default = "default_output")]
    pub output: String,
    #[serde(default = "default_name")]
    pub name: String,
    /// Relative to the source tree; the bootloader build produces it.
    #[serde(default = "default_mkimage")]
    pub mkimage: String,
}

impl Default for BootscriptConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            source: String::new(),
            output: default_output(),
            name: default_name(),
            mkimage: default_mkimage(),
        }
    }
}

#[Task(
    id = "bootscript.mkimage",
    phase = "package",
    provides = ["bootscript:done"],
    after = ["build.make", "tool:done?"],
    default_label = "Compile boot script"
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MkimageTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for MkimageTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl MkimageTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let cfg: BootscriptConfig = doc.deserialize_path("bootscript")?.unwrap_or_default();
        if cfg.source.trim().is_empty() {
            return Err(Error::config("[bootscript].source must be set"));
        }
        let target = TargetConfig::load(doc)?;
        let build = BuildConfig::load(doc)?;
        let src = source_dir(doc, ctx)?;

        let script = ctx.input_path(&cfg.source)?;
        let script = script
            .canonicalize()
            .map_err(|e| Error::fs(format!("boot script {}: {e}", script.display())))?;

        // A relative tool path points into the source tree, not our cwd.
        let mkimage = Path::new(cfg.mkimage.trim());
        let mkimage = if mkimage.components().count() > 1 && mkimage.is_relative() {
            src.join(mkimage)
        } else {
            mkimage.to_path_buf()
        };

        let mut cmd = Command::new(&mkimage);
        cmd.args(["-A", target.arch.as_str()])
            .args(["-O", "linux", "-T", "script", "-C", "none", "-a", "0", "-e", "0"])
            .arg("-n")
            .arg(&cfg.name)
            .arg("-d")
            .arg(&script)
            .arg(&cfg.output)
            .current_dir(&src);
        // mkimage stamps the image header with SOURCE_DATE_EPOCH.
        apply_command_env(&mut cmd, &reproducible_env(&target, &build));
        ctx.run_cmd(cmd)
    }
}

#[Module(
    id = "bootscript",
    config = BootscriptConfig,
    tasks = [MkimageTask]
)]
pub struct BootscriptModule;
