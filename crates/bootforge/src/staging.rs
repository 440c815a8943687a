use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Per-run scratch space. `context/` is the image build context (driver
/// binary, rendered image definition, staged inputs, resolved build spec) and
/// `result/` is bind-mounted into the container as the output directory.
///
/// The whole tree is removed when the value is dropped, unless it was created
/// with `keep = true`.
#[derive(Debug)]
pub struct StagingDir {
    dir: TempDir,
    context: PathBuf,
    result: PathBuf,
    kept: bool,
}

impl StagingDir {
    pub fn create(root: &Path, target: &str, keep: bool) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("bootforge-{target}-"))
            .keep(keep)
            .tempdir_in(root)
            .map_err(|e| {
                Error::fs(format!(
                    "failed to create staging dir under {}: {e}",
                    root.display()
                ))
            })?;
        let context = dir.path().join("context");
        let result = dir.path().join("result");
        for d in [&context, &result] {
            std::fs::create_dir(d)
                .map_err(|e| Error::fs(format!("failed to create dir {}: {e}", d.display())))?;
        }
        debug!(path = %dir.path().display(), keep, "created staging dir");
        Ok(Self {
            dir,
            context,
            result,
            kept: keep,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn context(&self) -> &Path {
        &self.context
    }

    pub fn result(&self) -> &Path {
        &self.result
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if self.kept {
            info!(path = %self.dir.path().display(), "keeping staging dir");
        }
    }
}
