use std::fs;
use std::io::Read;
use std::path::Path;

use crate::error::{Error, Result};

pub fn ensure_dir(p: &Path) -> Result<()> {
    fs::create_dir_all(p)
        .map_err(|e| Error::fs(format!("failed to create dir {}: {e}", p.display())))
}

pub fn write_text(p: &Path, s: &str) -> Result<()> {
    if let Some(parent) = p.parent() {
        ensure_dir(parent)?;
    }
    fs::write(p, s).map_err(|e| Error::fs(format!("failed to write {}: {e}", p.display())))
}

pub fn write_json_pretty(p: &Path, v: &serde_json::Value) -> Result<()> {
    let mut s = serde_json::to_string_pretty(v)?;
    s.push('\n');
    write_text(p, &s)
}

/// Copy `src` to `dest` so that `dest` ends up with the permission bits of
/// `src`. Fails without touching `dest` when `src` cannot be opened.
pub fn copy_file_preserve_mode(src: &Path, dest: &Path) -> Result<()> {
    let mut input = fs::File::open(src)
        .map_err(|e| Error::fs(format!("failed to open {}: {e}", src.display())))?;
    let meta = input
        .metadata()
        .map_err(|e| Error::fs(format!("failed to stat {}: {e}", src.display())))?;
    if !meta.is_file() {
        return Err(Error::fs(format!("{} is not a regular file", src.display())));
    }

    // A leftover read-only destination cannot be truncated in place.
    match fs::symlink_metadata(dest) {
        Ok(_) => fs::remove_file(dest)
            .map_err(|e| Error::fs(format!("failed to replace {}: {e}", dest.display())))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(Error::fs(format!("failed to stat {}: {e}", dest.display())));
        }
    }

    let mut output = fs::File::create(dest)
        .map_err(|e| Error::fs(format!("failed to create {}: {e}", dest.display())))?;
    std::io::copy(&mut input, &mut output).map_err(|e| {
        Error::fs(format!(
            "failed to copy {} -> {}: {e}",
            src.display(),
            dest.display()
        ))
    })?;
    output
        .sync_all()
        .map_err(|e| Error::fs(format!("failed to flush {}: {e}", dest.display())))?;
    drop(output);

    fs::set_permissions(dest, meta.permissions())
        .map_err(|e| Error::fs(format!("failed to chmod {}: {e}", dest.display())))
}

#[cfg(unix)]
pub fn file_mode(path: &Path) -> Result<u32> {
    use std::os::unix::fs::PermissionsExt;
    let meta = fs::metadata(path)
        .map_err(|e| Error::fs(format!("failed to stat {}: {e}", path.display())))?;
    Ok(meta.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
pub fn file_mode(path: &Path) -> Result<u32> {
    let meta = fs::metadata(path)
        .map_err(|e| Error::fs(format!("failed to stat {}: {e}", path.display())))?;
    Ok(if meta.permissions().readonly() { 0o444 } else { 0o644 })
}

pub fn sha256_file_hex(path: &Path) -> Result<String> {
    use sha2::{Digest, Sha256};

    let mut file = fs::File::open(path)
        .map_err(|e| Error::fs(format!("failed to open {}: {e}", path.display())))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 1024 * 256];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| Error::fs(format!("failed to read {}: {e}", path.display())))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
