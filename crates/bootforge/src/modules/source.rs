use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use bootforge_macros::{Module, Task};

use crate::archive::SourceArchive;
use crate::config::ConfigDoc;
use crate::executor::ExecCtx;
use crate::fetch::{Downloaded, download, http_client, verify_pin};
use crate::manifest::FetchRecord;
use crate::modules::core::TargetConfig;
use crate::{Error, Result};

fn default_true() -> bool {
    true
}

fn default_firmware_dir() -> String {
    "/tmp/firmware".into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// May contain `{revision}`.
    pub url: String,
    pub revision: Option<String>,
    pub sha256: Option<String>,
    /// Directory prefix a zip archive unpacks into, e.g. "u-boot-".
    pub zip_prefix: Option<String>,
    pub firmware: Vec<FirmwareConfig>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: String::new(),
            revision: None,
            sha256: None,
            zip_prefix: None,
            firmware: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FirmwareConfig {
    /// Path of the blob below `dest_dir`, e.g. "rtl_nic/rtl8153a-3.fw".
    pub name: String,
    pub url: String,
    pub sha256: Option<String>,
    #[serde(default = "default_firmware_dir")]
    pub dest_dir: String,
}

impl SourceConfig {
    pub fn load(doc: &ConfigDoc) -> Result<Self> {
        let cfg: Self = doc.require_path("source")?;
        if cfg.url.trim().is_empty() {
            return Err(Error::config("[source].url must be set"));
        }
        for fw in &cfg.firmware {
            crate::workspace::validate_rel_path(&fw.name)?;
            if fw.url.trim().is_empty() {
                return Err(Error::config(format!(
                    "[[source.firmware]] '{}' has no url",
                    fw.name
                )));
            }
        }
        Ok(cfg)
    }

    pub fn resolved_url(&self) -> Result<String> {
        expand_revision(&self.url, self.revision.as_deref())
    }

    pub fn archive(&self) -> Result<SourceArchive> {
        SourceArchive::from_url(&self.resolved_url()?, self.zip_prefix.as_deref())
    }
}

pub fn expand_revision(url: &str, revision: Option<&str>) -> Result<String> {
    if !url.contains("{revision}") {
        return Ok(url.trim().to_string());
    }
    let Some(rev) = revision.map(str::trim).filter(|s| !s.is_empty()) else {
        return Err(Error::config(format!(
            "url '{url}' uses '{{revision}}' but no revision is set"
        )));
    };
    Ok(url.trim().replace("{revision}", rev))
}

/// Unpacked source tree, derived from the URL alone.
pub fn source_dir(doc: &ConfigDoc, ctx: &ExecCtx) -> Result<PathBuf> {
    let src = SourceConfig::load(doc)?;
    Ok(ctx.work_dir().join(src.archive()?.unpack_dir))
}

/// Download, check the pin, and remember the digest for the fetch record.
pub fn fetch_pinned(
    ctx: &ExecCtx,
    client: &reqwest::blocking::Client,
    name: &str,
    url: &str,
    dest: &Path,
    pin: Option<&str>,
    require_pins: bool,
) -> Result<Downloaded> {
    ctx.log(&format!("downloading {url} to {}", dest.display()));
    let got = download(client, url, dest)?;
    verify_pin(url, &got.sha256, pin, require_pins)?;
    ctx.log(&format!("{name}: sha256 {} ({} bytes)", got.sha256, got.bytes));
    ctx.record_fetch(FetchRecord {
        name: name.to_string(),
        url: url.to_string(),
        sha256: got.sha256.clone(),
        bytes: got.bytes,
    });
    Ok(got)
}

pub fn unpack(ctx: &ExecCtx, archive: &SourceArchive, work_dir: &Path) -> Result<PathBuf> {
    let file = work_dir.join(&archive.file_name);
    if !file.is_file() {
        return Err(Error::fs(format!(
            "archive {} not found; was it fetched?",
            file.display()
        )));
    }
    let dir = work_dir.join(&archive.unpack_dir);
    if dir.exists() {
        // Patches assume a pristine tree.
        ctx.log(&format!("removing stale tree {}", dir.display()));
        fs::remove_dir_all(&dir)
            .map_err(|e| Error::fs(format!("failed to remove {}: {e}", dir.display())))?;
    }
    ctx.log(&format!("unpacking {} into {}", archive.file_name, dir.display()));
    ctx.run_cmd(archive.unpack_command(work_dir))?;
    if !dir.is_dir() {
        return Err(Error::fs(format!(
            "extracting {} did not produce directory {}",
            archive.file_name,
            dir.display()
        )));
    }
    Ok(dir)
}

#[Task(
    id = "source.fetch",
    phase = "fetch",
    provides = ["source:fetched"],
    after = ["core.init"],
    default_label = "Fetch source archive",
    core = true
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
        let src = SourceConfig::load(doc)?;
        let archive = src.archive()?;
        let work_dir = ctx.work_dir().to_path_buf();
        crate::modules::util::ensure_dir(&work_dir)?;

        let client = http_client()?;
        fetch_pinned(
            ctx,
            &client,
            &archive.file_name,
            &archive.url,
            &work_dir.join(&archive.file_name),
            src.sha256.as_deref(),
            target.require_pins,
        )?;
        Ok(())
    }
}

#[Task(
    id = "source.firmware",
    phase = "fetch",
    provides = ["source:firmware"],
    after = ["source.fetch"],
    when = "source.firmware",
    default_label = "Fetch firmware blobs"
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FirmwareTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for FirmwareTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl FirmwareTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let target = TargetConfig::load(doc)?;
        let src = SourceConfig::load(doc)?;
        let client = http_client()?;
        for fw in &src.firmware {
            let url = expand_revision(&fw.url, src.revision.as_deref())?;
            let dest_dir = ctx.work_dir().join(&fw.dest_dir);
            let dest = dest_dir.join(crate::workspace::validate_rel_path(&fw.name)?);
            fetch_pinned(
                ctx,
                &client,
                &fw.name,
                &url,
                &dest,
                fw.sha256.as_deref(),
                target.require_pins,
            )?;
        }
        Ok(())
    }
}

#[Task(
    id = "source.unpack",
    phase = "unpack",
    provides = ["source:unpacked"],
    after = ["source.fetch", "source:firmware?"],
    default_label = "Unpack source archive",
    core = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UnpackTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for UnpackTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl UnpackTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let archive = SourceConfig::load(doc)?.archive()?;
        let work_dir = ctx.work_dir().to_path_buf();
        unpack(ctx, &archive, &work_dir)?;
        Ok(())
    }
}

#[Module(
    id = "source",
    config = SourceConfig,
    tasks = [FetchTask, FirmwareTask, UnpackTask]
)]
pub struct SourceModule;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revision_placeholder_is_expanded() {
        assert_eq!(
            expand_revision(
                "https://github.com/hardkernel/u-boot/archive/{revision}.zip",
                Some("abc")
            )
            .expect("url"),
            "https://github.com/hardkernel/u-boot/archive/abc.zip"
        );
        assert!(expand_revision("https://h/{revision}.zip", None).is_err());
        assert_eq!(
            expand_revision("https://h/a.tar.xz", None).expect("url"),
            "https://h/a.tar.xz"
        );
    }

    #[test]
    fn source_requires_a_url() {
        let doc = ConfigDoc::from_str("<mem>", "[source]\nsha256 = \"00\"\n").expect("doc");
        assert!(SourceConfig::load(&doc).is_err());
    }

    #[test]
    fn firmware_names_may_not_escape() {
        let doc = ConfigDoc::from_str(
            "<mem>",
            r#"
[source]
url = "https://h/linux-1.tar.xz"

[[source.firmware]]
name = "../etc/evil.fw"
url = "https://h/evil.fw"
"#,
        )
        .expect("doc");
        assert!(SourceConfig::load(&doc).is_err());
    }
}
