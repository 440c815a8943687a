use serde::Deserialize;

use bootforge_macros::{Module, Task};

use crate::config::ConfigDoc;
use crate::executor::ExecCtx;
use crate::modules::build::{BuildConfig, reproducible_env, run_make};
use crate::modules::core::TargetConfig;
use crate::modules::source::source_dir;
use crate::{Error, Result};

fn default_true() -> bool {
    true
}

fn default_normalize() -> String {
    "olddefconfig".into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConfigureConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub defconfig: String,
    /// Package-relative Kconfig fragment overlaid onto the generated .config.
    pub fragment: Option<String>,
    #[serde(default = "default_normalize")]
    pub normalize: String,
}

impl Default for ConfigureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            defconfig: String::new(),
            fragment: None,
            normalize: default_normalize(),
        }
    }
}

#[Task(
    id = "configure.kconfig",
    phase = "configure",
    provides = ["configure:done"],
    after = ["source.unpack", "patches:done?"],
    default_label = "Generate configuration"
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KconfigTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for KconfigTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl KconfigTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let cfg: ConfigureConfig = doc.deserialize_path("configure")?.unwrap_or_default();
        if cfg.defconfig.trim().is_empty() {
            return Err(Error::config("[configure].defconfig must be set"));
        }
        let target = TargetConfig::load(doc)?;
        let build = BuildConfig::load(doc)?;
        let envs = reproducible_env(&target, &build);
        let src = source_dir(doc, ctx)?;
        let arch = format!("ARCH={}", target.arch);

        run_make(
            ctx,
            build.tool.trim(),
            &src,
            &[arch.clone(), cfg.defconfig.trim().to_string()],
            &envs,
        )?;

        if let Some(rel) = cfg.fragment.as_deref() {
            let fragment = ctx.input_path(rel)?;
            let n = crate::kconfig::overlay_file(&src.join(".config"), &fragment)?;
            ctx.log(&format!("overlaid {n} entries from {rel}"));
        }

        if !cfg.normalize.trim().is_empty() {
            run_make(
                ctx,
                build.tool.trim(),
                &src,
                &[arch, cfg.normalize.trim().to_string()],
                &envs,
            )?;
        }
        Ok(())
    }
}

#[Module(
    id = "configure",
    config = ConfigureConfig,
    tasks = [KconfigTask]
)]
pub struct ConfigureModule;
