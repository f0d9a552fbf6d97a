//! Scratch directory for one conversion.
//!
//! Intermediate files live in a temporary directory next to the output so the
//! final move is a same-filesystem rename. The directory is removed when the
//! workspace is dropped, whatever the outcome.

use std::path::{Path, PathBuf};

use anyhow::Context;
use tempfile::TempDir;

pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    /// Workspace beside `output`, or in the system temp dir when the output's
    /// directory is not writable.
    pub fn beside(output: &Path) -> anyhow::Result<Self> {
        let parent = match output.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let builder = {
            let mut b = tempfile::Builder::new();
            b.prefix(".dmt-");
            b
        };
        let dir = match parent.canonicalize().map(|p| builder.tempdir_in(p)) {
            Ok(Ok(dir)) => dir,
            Ok(Err(e)) | Err(e) => {
                tracing::debug!(dir = %parent.display(), "workspace falls back to temp dir: {e}");
                builder.tempdir().context("create workspace directory")?
            }
        };
        tracing::debug!(workspace = %dir.path().display(), "workspace created");
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn write(&self, name: &str, data: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self.file(name);
        std::fs::write(&path, data).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }

    pub fn read_text(&self, name: &str) -> anyhow::Result<String> {
        let path = self.file(name);
        std::fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }

    /// Move a staged file to `dest`, replacing it. Falls back to copying when
    /// the two paths are on different filesystems.
    pub fn persist(&self, staged: &Path, dest: &Path) -> anyhow::Result<()> {
        if std::fs::rename(staged, dest).is_ok() {
            return Ok(());
        }
        std::fs::copy(staged, dest)
            .with_context(|| format!("write output: {}", dest.display()))?;
        Ok(())
    }
}
