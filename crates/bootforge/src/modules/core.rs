use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::modules::Module;
use crate::modules::collect::CollectConfig;
use crate::modules::container::{DRIVER_BINARY, STAGED_SPEC, staged_inputs};
use crate::modules::source::SourceConfig;
use crate::planner::{Plan, Task};

pub const KNOWN_TABLES: &[&str] = &[
    "target",
    "container",
    "source",
    "patches",
    "configure",
    "build",
    "bootscript",
    "tool",
    "collect",
];

pub const REQUIRED_TABLES: &[&str] = &["target", "container", "source", "build", "collect"];

fn default_true() -> bool {
    true
}

fn default_arch() -> String {
    "arm".into()
}

fn default_cross_compile() -> String {
    "arm-linux-gnueabihf-".into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Kernel,
    Uboot,
}

impl TargetKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TargetKind::Kernel => "kernel",
            TargetKind::Uboot => "uboot",
        }
    }

    /// Fixed strings the native build embeds into its output.
    pub fn reproducible_env(self) -> BTreeMap<String, String> {
        let pairs: &[(&str, &str)] = match self {
            TargetKind::Kernel => &[
                ("KBUILD_BUILD_USER", "gokrazy"),
                ("KBUILD_BUILD_HOST", "docker"),
                ("KBUILD_BUILD_TIMESTAMP", "Wed Mar  1 20:57:29 UTC 2017"),
            ],
            TargetKind::Uboot => &[("SOURCE_DATE_EPOCH", "1600000000")],
        };
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    pub name: String,
    pub kind: TargetKind,
    #[serde(default = "default_arch")]
    pub arch: String,
    #[serde(default = "default_cross_compile")]
    pub cross_compile: String,
    #[serde(default = "default_true")]
    pub require_pins: bool,
}

impl TargetConfig {
    pub fn load(doc: &ConfigDoc) -> Result<Self> {
        let cfg: Self = doc.require_path("target")?;
        crate::workspace::validate_target_name(&cfg.name)?;
        if cfg.arch.trim().is_empty() {
            return Err(Error::config("[target].arch must not be empty"));
        }
        Ok(cfg)
    }
}

pub struct CoreModule;

impl Module for CoreModule {
    fn id(&self) -> &'static str {
        "core"
    }

    fn detect(&self, _doc: &ConfigDoc) -> bool {
        true
    }

    fn plan(&self, doc: &ConfigDoc, plan: &mut Plan) -> Result<()> {
        validate(doc)?;
        plan.add(Task {
            id: "core.init".into(),
            label: "Init".into(),
            module: self.id().into(),
            phase: "init".into(),
            after: vec![],
            provides: vec!["core:initialized".into()],
        })?;
        Ok(())
    }
}

/// Plan-time checks shared by the host and driver pipelines.
pub fn validate(doc: &ConfigDoc) -> Result<()> {
    for key in doc.top_level_keys() {
        if !KNOWN_TABLES.contains(&key) {
            return Err(Error::config(format!(
                "table '{}' is not supported in a build spec; known tables: {}",
                key,
                KNOWN_TABLES.join(", ")
            )));
        }
    }
    for key in REQUIRED_TABLES {
        if !doc.has_table(key) {
            return Err(Error::config(format!(
                "build spec {} is missing required table [{}]",
                doc.path.display(),
                key
            )));
        }
    }

    TargetConfig::load(doc)?;
    SourceConfig::load(doc)?.archive()?;
    CollectConfig::load(doc)?;

    // Staged inputs share the image build context with these files.
    let reserved = [DRIVER_BINARY, STAGED_SPEC, "Dockerfile"];
    let mut seen = BTreeSet::new();
    for rel in staged_inputs(doc)? {
        crate::workspace::validate_rel_path(&rel)?;
        let name = crate::workspace::basename(&rel)?;
        if reserved.contains(&name.as_str()) {
            return Err(Error::config(format!(
                "build input '{rel}' clashes with the reserved file name '{name}'"
            )));
        }
        if !seen.insert(name.clone()) {
            return Err(Error::config(format!(
                "two build inputs share the file name '{name}'"
            )));
        }
    }
    Ok(())
}

pub fn core_init(doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
    let target = TargetConfig::load(doc)?;
    ctx.set_task("core.init");
    ctx.log(&format!("build spec = {}", doc.path.display()));
    ctx.log(&format!(
        "target = {} ({}, ARCH={}, CROSS_COMPILE={})",
        target.name,
        target.kind.as_str(),
        target.arch,
        target.cross_compile
    ));
    ctx.log(&format!("package dir = {}", ctx.opts.pkg.root.display()));
    if !target.require_pins {
        ctx.log("require_pins = false: unpinned inputs only produce warnings");
    }
    Ok(())
}
