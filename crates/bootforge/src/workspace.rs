use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

/// Environment variable that overrides the compiled-in package root.
pub const PKG_DIR_ENV: &str = "BOOTFORGE_PKG_DIR";

/// The package directory: image template, per-target build specs, config
/// fragments, boot scripts, patches, and the final artifact destinations.
#[derive(Debug, Clone)]
pub struct PackagePaths {
    pub root: PathBuf,
}

impl PackagePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolved without looking at the current working directory.
    pub fn discover(explicit: Option<&Path>) -> Result<Self> {
        let root = match explicit {
            Some(p) => p.to_path_buf(),
            None => default_pkg_dir(),
        };
        if !root.is_dir() {
            return Err(Error::fs(format!(
                "package directory {} does not exist",
                root.display()
            )));
        }
        Ok(Self { root })
    }

    pub fn targets_dir(&self) -> PathBuf {
        self.root.join("targets")
    }

    pub fn target_spec(&self, target: &str) -> Result<PathBuf> {
        validate_target_name(target)?;
        Ok(self.targets_dir().join(format!("{target}.toml")))
    }

    /// Resolve a package-relative path. Absolute paths and `..` are rejected.
    pub fn resolve(&self, rel: &str) -> Result<PathBuf> {
        let rel = validate_rel_path(rel)?;
        Ok(self.root.join(rel))
    }
}

pub fn default_pkg_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("..")
        .join("package")
}

pub fn validate_rel_path(raw: &str) -> Result<&Path> {
    let p = raw.trim();
    if p.is_empty() {
        return Err(Error::config("package path is empty"));
    }
    let path = Path::new(p);
    for c in path.components() {
        match c {
            Component::ParentDir => {
                return Err(Error::config(format!("path '{p}' contains '..'")));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(Error::config(format!(
                    "path '{p}' must be relative to the package directory"
                )));
            }
            Component::CurDir | Component::Normal(_) => {}
        }
    }
    Ok(path)
}

pub fn validate_target_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !ok {
        return Err(Error::config(format!(
            "invalid target name '{name}' (allowed: a-zA-Z0-9_-)"
        )));
    }
    Ok(())
}

/// Final path segment, used when inputs are staged flat by file name.
pub fn basename(raw: &str) -> Result<String> {
    Path::new(raw.trim())
        .file_name()
        .and_then(|s| s.to_str())
        .map(ToOwned::to_owned)
        .ok_or_else(|| Error::config(format!("path '{raw}' has no file name")))
}
