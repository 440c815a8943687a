use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{Error, Result};

pub fn http_client() -> Result<reqwest::blocking::Client> {
    // No orchestrator-imposed deadline; a stalled transfer stalls the run.
    reqwest::blocking::Client::builder()
        .timeout(None)
        .user_agent(concat!("bootforge/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| Error::transfer(format!("failed to build HTTP client: {e}")))
}

#[derive(Debug, Clone)]
pub struct Downloaded {
    pub path: PathBuf,
    pub sha256: String,
    pub bytes: u64,
}

struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    bytes: u64,
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Single blocking GET of `url` into `dest`, hashing the body as it streams.
/// Any non-success status is a transfer error naming the URL and the status.
pub fn download(client: &reqwest::blocking::Client, url: &str, dest: &Path) -> Result<Downloaded> {
    debug!(url, dest = %dest.display(), "downloading");
    let mut res = client.get(url).send()?;
    let status = res.status();
    if !status.is_success() {
        return Err(Error::transfer(format!(
            "unexpected HTTP status code for {url}: got {}, want 200",
            status.as_u16()
        )));
    }

    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|e| Error::fs(format!("failed to create dir {}: {e}", parent.display())))?;
    }
    let file = fs::File::create(dest)
        .map_err(|e| Error::fs(format!("failed to create {}: {e}", dest.display())))?;
    let mut writer = HashingWriter {
        inner: std::io::BufWriter::new(file),
        hasher: Sha256::new(),
        bytes: 0,
    };
    res.copy_to(&mut writer)
        .map_err(|e| Error::transfer(format!("transfer of {url} failed: {e}")))?;
    writer
        .flush()
        .map_err(|e| Error::fs(format!("failed to write {}: {e}", dest.display())))?;

    Ok(Downloaded {
        path: dest.to_path_buf(),
        sha256: hex::encode(writer.hasher.finalize()),
        bytes: writer.bytes,
    })
}

/// Check a computed digest against the declared pin.
pub fn verify_pin(url: &str, actual: &str, expected: Option<&str>, require_pins: bool) -> Result<()> {
    match expected.map(str::trim).filter(|s| !s.is_empty()) {
        Some(pin) => {
            if !pin.eq_ignore_ascii_case(actual) {
                return Err(Error::integrity(format!(
                    "sha256 mismatch for {url}: expected {pin}, got {actual}"
                )));
            }
            Ok(())
        }
        None if require_pins => Err(Error::integrity(format!(
            "no sha256 pinned for {url} (computed {actual}); pin it or set target.require_pins = false"
        ))),
        None => {
            warn!(url, sha256 = actual, "input is not pinned");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    const ABC: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    #[test]
    fn matching_pin_passes_case_insensitively() {
        verify_pin("u", ABC, Some(&ABC.to_uppercase()), true).expect("match");
    }

    #[test]
    fn mismatching_pin_is_integrity_error() {
        let err = verify_pin("https://x/a.tar.xz", ABC, Some("00"), false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Integrity);
        assert!(err.to_string().contains("https://x/a.tar.xz"));
    }

    #[test]
    fn missing_pin_depends_on_policy() {
        assert_eq!(
            verify_pin("u", ABC, None, true).unwrap_err().kind(),
            ErrorKind::Integrity
        );
        verify_pin("u", ABC, Some("  "), false).expect("unpinned allowed");
    }
}
