use std::process::Command;

use serde::Deserialize;

use bootforge_macros::{Module, Task};

use crate::config::ConfigDoc;
use crate::executor::ExecCtx;
use crate::modules::source::source_dir;
use crate::{Error, Result};

fn default_true() -> bool {
    true
}

fn default_strip() -> u32 {
    1
}

fn default_tool() -> String {
    "patch".into()
}

/// Patches applied in declared order, each exactly once, against a freshly
/// unpacked tree. A failed patch leaves the earlier ones applied.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PatchesConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub series: Vec<String>,
    #[serde(default = "default_strip")]
    pub strip: u32,
    #[serde(default = "default_tool")]
    pub tool: String,
}

impl Default for PatchesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            series: Vec::new(),
            strip: default_strip(),
            tool: default_tool(),
        }
    }
}

#[Task(
    id = "patches.apply",
    phase = "patch",
    provides = ["patches:done"],
    after = ["source.unpack"],
    default_label = "Apply patches"
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApplyTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for ApplyTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl ApplyTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let cfg: PatchesConfig = doc.deserialize_path("patches")?.unwrap_or_default();
        if cfg.series.is_empty() {
            ctx.log("no patches declared");
            return Ok(());
        }
        if cfg.tool.trim().is_empty() {
            return Err(Error::config("[patches].tool must not be empty"));
        }

        let src = source_dir(doc, ctx)?;
        for (i, rel) in cfg.series.iter().enumerate() {
            let patch = ctx.input_path(rel)?;
            ctx.log(&format!(
                "applying patch {}/{}: {rel}",
                i + 1,
                cfg.series.len()
            ));
            let mut cmd = Command::new(cfg.tool.trim());
            cmd.arg(format!("-p{}", cfg.strip)).current_dir(&src);
            ctx.run_cmd_stdin(cmd, &patch)
                .map_err(|e| e.context(format!("patch {rel} did not apply")))?;
        }
        Ok(())
    }
}

#[Module(
    id = "patches",
    config = PatchesConfig,
    tasks = [ApplyTask]
)]
pub struct PatchesModule;
