//! Kconfig `.config` editing for fragment overlays.

use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FragmentEntry {
    Set { key: String, value: String },
    Unset { key: String },
}

/// Parse a config fragment: `KEY=value` lines and `# KEY is not set` lines.
/// Other comments and blank lines are skipped.
pub fn parse_fragment(raw: &str) -> Result<Vec<FragmentEntry>> {
    let mut out = Vec::new();
    for (idx, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix('#') {
            if let Some(key) = rest.trim().strip_suffix(" is not set") {
                let key = key.trim();
                validate_key(key, idx + 1)?;
                out.push(FragmentEntry::Unset {
                    key: key.to_string(),
                });
            }
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(Error::config(format!(
                "config fragment line {}: expected KEY=value, got '{line}'",
                idx + 1
            )));
        };
        let key = key.trim();
        validate_key(key, idx + 1)?;
        out.push(FragmentEntry::Set {
            key: key.to_string(),
            value: value.trim().to_string(),
        });
    }
    Ok(out)
}

fn validate_key(key: &str, line: usize) -> Result<()> {
    let ok = key.starts_with("CONFIG_")
        && key
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_');
    if !ok {
        return Err(Error::config(format!(
            "config fragment line {line}: invalid symbol '{key}'"
        )));
    }
    Ok(())
}

pub fn set_kv(cfg: &mut String, key: &str, val: &str) {
    let prefix = format!("{key}=");
    let unset = format!("# {key} is not set");
    let mut out = Vec::new();
    let mut done = false;
    for line in cfg.lines() {
        if line.starts_with(&prefix) || line == unset {
            if !done {
                out.push(format!("{key}={val}"));
                done = true;
            }
            continue;
        }
        out.push(line.to_string());
    }
    if !done {
        out.push(format!("{key}={val}"));
    }
    *cfg = out.join("\n");
    cfg.push('\n');
}

pub fn unset_kv(cfg: &mut String, key: &str) {
    let prefix = format!("{key}=");
    let unset = format!("# {key} is not set");
    let mut out: Vec<String> = cfg
        .lines()
        .filter(|line| !(line.starts_with(&prefix) || *line == unset))
        .map(ToOwned::to_owned)
        .collect();
    out.push(unset);
    *cfg = out.join("\n");
    cfg.push('\n');
}

pub fn apply_fragment(cfg: &mut String, entries: &[FragmentEntry]) {
    for e in entries {
        match e {
            FragmentEntry::Set { key, value } => set_kv(cfg, key, value),
            FragmentEntry::Unset { key } => unset_kv(cfg, key),
        }
    }
}

/// Overlay `fragment` onto the `.config` in `dot_config`, in fragment order.
pub fn overlay_file(dot_config: &Path, fragment: &Path) -> Result<usize> {
    let raw = fs::read_to_string(fragment)
        .map_err(|e| Error::fs(format!("failed to read {}: {e}", fragment.display())))?;
    let entries = parse_fragment(&raw).map_err(|e| e.context(fragment.display()))?;
    let mut cfg = fs::read_to_string(dot_config)
        .map_err(|e| Error::fs(format!("failed to read {}: {e}", dot_config.display())))?;
    apply_fragment(&mut cfg, &entries);
    fs::write(dot_config, cfg)
        .map_err(|e| Error::fs(format!("failed to write {}: {e}", dot_config.display())))?;
    Ok(entries.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_replaces_and_appends() {
        let mut cfg = String::from(
            "CONFIG_A=y\n# CONFIG_B is not set\nCONFIG_C=\"old\"\nCONFIG_D=m\n",
        );
        let entries = parse_fragment(
            "# comment\n\nCONFIG_B=y\nCONFIG_C=\"new\"\n# CONFIG_D is not set\nCONFIG_E=64\n",
        )
        .expect("parse");
        apply_fragment(&mut cfg, &entries);
        assert_eq!(
            cfg,
            "CONFIG_A=y\nCONFIG_B=y\nCONFIG_C=\"new\"\n# CONFIG_D is not set\nCONFIG_E=64\n"
        );
    }

    #[test]
    fn overlay_is_deterministic() {
        let base = "CONFIG_X=y\n";
        let entries = parse_fragment("CONFIG_Y=y\n# CONFIG_X is not set\n").expect("parse");
        let mut a = base.to_string();
        let mut b = base.to_string();
        apply_fragment(&mut a, &entries);
        apply_fragment(&mut b, &entries);
        apply_fragment(&mut b, &entries);
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_garbage_lines() {
        assert!(parse_fragment("not a config line\n").is_err());
        assert!(parse_fragment("lowercase=y\n").is_err());
    }

    #[test]
    fn overlay_file_rewrites_dot_config() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dot = tmp.path().join(".config");
        let frag = tmp.path().join("config.txt");
        fs::write(&dot, "CONFIG_A=y\n").expect("write .config");
        fs::write(&frag, "CONFIG_A=n\nCONFIG_B=y\n").expect("write fragment");
        assert_eq!(overlay_file(&dot, &frag).expect("overlay"), 2);
        assert_eq!(
            fs::read_to_string(&dot).expect("read"),
            "CONFIG_A=n\nCONFIG_B=y\n"
        );
    }
}
