use std::path::Path;
use std::process::Command;

use crate::error::{Error, Result};

const TAR_SUFFIXES: &[&str] = &[
    ".tar.xz", ".tar.gz", ".tar.bz2", ".tar.zst", ".tar.lz", ".tgz", ".tbz2", ".txz", ".tar",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    /// Any tarball; `tar` detects the compression itself.
    Tar,
    Zip,
}

/// A source archive and the names derived from its URL. Both names are pure
/// functions of the URL so a rerun lands in the same directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceArchive {
    pub url: String,
    pub file_name: String,
    pub unpack_dir: String,
    pub format: ArchiveFormat,
}

impl SourceArchive {
    pub fn from_url(url: &str, zip_prefix: Option<&str>) -> Result<Self> {
        let file_name = file_name_from_url(url)?;
        let (format, unpack_dir) = unpack_dir_name(&file_name, zip_prefix)?;
        Ok(Self {
            url: url.to_string(),
            file_name,
            unpack_dir,
            format,
        })
    }

    /// Extraction command, run with the archive's directory as cwd.
    pub fn unpack_command(&self, work_dir: &Path) -> Command {
        let mut cmd = match self.format {
            ArchiveFormat::Tar => {
                let mut c = Command::new("tar");
                c.arg("xf").arg(&self.file_name);
                c
            }
            ArchiveFormat::Zip => {
                let mut c = Command::new("unzip");
                c.arg("-q").arg(&self.file_name);
                c
            }
        };
        cmd.current_dir(work_dir);
        cmd
    }
}

/// Last path segment of the URL, ignoring any query string or fragment.
pub fn file_name_from_url(url: &str) -> Result<String> {
    let trimmed = url.trim();
    let without_scheme = trimmed
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(trimmed);
    let path = without_scheme
        .split(['?', '#'])
        .next()
        .unwrap_or(without_scheme);
    let Some((_, last)) = path.rsplit_once('/') else {
        return Err(Error::config(format!("URL '{url}' has no path")));
    };
    if last.is_empty() || last == "." || last == ".." {
        return Err(Error::config(format!(
            "URL '{url}' does not end in a file name"
        )));
    }
    Ok(last.to_string())
}

pub fn unpack_dir_name(file_name: &str, zip_prefix: Option<&str>) -> Result<(ArchiveFormat, String)> {
    if let Some(stem) = file_name.strip_suffix(".zip") {
        if stem.is_empty() {
            return Err(Error::config(format!("archive name '{file_name}' has no stem")));
        }
        let prefix = zip_prefix.unwrap_or_default();
        return Ok((ArchiveFormat::Zip, format!("{prefix}{stem}")));
    }
    for suffix in TAR_SUFFIXES {
        if let Some(stem) = file_name.strip_suffix(suffix) {
            if stem.is_empty() {
                break;
            }
            return Ok((ArchiveFormat::Tar, stem.to_string()));
        }
    }
    Err(Error::config(format!(
        "archive '{file_name}' has no known suffix ({}, .zip)",
        TAR_SUFFIXES.join(", ")
    )))
}
