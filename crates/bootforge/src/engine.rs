use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{Error, Result};

/// Lookup order. The rootless engine comes first.
pub const ENGINE_CANDIDATES: [&str; 2] = ["podman", "docker"];

pub const ENGINE_ENV: &str = "BOOTFORGE_CONTAINER_ENGINE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineFlavor {
    Podman,
    Docker,
}

#[derive(Debug, Clone)]
pub struct ContainerEngine {
    /// Name that was looked up on PATH.
    pub requested: String,
    /// Fully resolved executable (symlinks followed).
    pub path: PathBuf,
    pub flavor: EngineFlavor,
}

impl ContainerEngine {
    fn from_resolved(requested: &str, found: PathBuf) -> Result<Self> {
        let path = found
            .canonicalize()
            .map_err(|e| Error::discovery(format!("failed to resolve {}: {e}", found.display())))?;
        let flavor = flavor_of(&path);
        Ok(Self {
            requested: requested.to_string(),
            path,
            flavor,
        })
    }

    /// `<engine> build --rm=true --tag=<tag> .` run inside the context dir.
    pub fn build_command(&self, tag: &str, context: &Path) -> Command {
        let mut cmd = Command::new(&self.path);
        cmd.arg("build")
            .arg("--rm=true")
            .arg(format!("--tag={tag}"))
            .arg(".")
            .current_dir(context);
        cmd
    }

    pub fn run_command(&self, tag: &str, host_dir: &Path, mount: &str) -> Command {
        let mut cmd = Command::new(&self.path);
        cmd.arg("run");
        if self.flavor == EngineFlavor::Podman {
            // Map the invoking user into the container so results stay host-owned.
            cmd.arg("--userns=keep-id");
        }
        cmd.arg("--rm")
            .arg("--volume")
            .arg(format!("{}:{}:Z", host_dir.display(), mount))
            .arg(tag);
        cmd
    }
}

fn flavor_of(path: &Path) -> EngineFlavor {
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    if name.starts_with("podman") {
        EngineFlavor::Podman
    } else {
        EngineFlavor::Docker
    }
}

pub fn select_engine(override_name: Option<&str>) -> Result<ContainerEngine> {
    let cwd = std::env::current_dir()
        .map_err(|e| Error::fs(format!("cannot determine working directory: {e}")))?;
    select_engine_in(override_name, std::env::var_os("PATH"), &cwd)
}

/// Engine selection against an explicit search path.
pub fn select_engine_in(
    override_name: Option<&str>,
    paths: Option<OsString>,
    cwd: &Path,
) -> Result<ContainerEngine> {
    if let Some(name) = override_name.map(str::trim) {
        if name.is_empty() {
            return Err(Error::config("container engine override is empty"));
        }
        let found = which::which_in(name, paths.as_ref(), cwd).map_err(|e| {
            Error::discovery(format!("container engine '{name}' not found in $PATH: {e}"))
        })?;
        return ContainerEngine::from_resolved(name, found);
    }

    for candidate in ENGINE_CANDIDATES {
        if let Ok(found) = which::which_in(candidate, paths.as_ref(), cwd) {
            return ContainerEngine::from_resolved(candidate, found);
        }
    }
    Err(Error::discovery(format!(
        "none of [{}] found in $PATH",
        ENGINE_CANDIDATES.join(", ")
    )))
}
