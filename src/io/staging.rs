//! Write-then-rename staging for output rasters.
//!
//! Outputs are written to a `.partial` file next to the destination and
//! renamed into place only once complete, so a reader never observes a
//! half-written raster under the final name. Dropping an uncommitted stage
//! removes its partial file.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// A partial file that becomes `dest` on [`StagedFile::commit`].
#[derive(Debug)]
pub struct StagedFile {
    temp: NamedTempFile,
    dest: PathBuf,
}

impl StagedFile {
    /// Create a partial file in the destination's directory (created if missing).
    pub fn new(dest: &Path) -> Result<Self> {
        let dir = match dest.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;

        let stem = dest
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("output");
        let temp = tempfile::Builder::new()
            .prefix(&format!(".{}.", stem))
            .suffix(".partial")
            .tempfile_in(&dir)
            .with_context(|| format!("Failed to create partial file in {}", dir.display()))?;

        Ok(Self {
            temp,
            dest: dest.to_path_buf(),
        })
    }

    /// Path to write the partial output to.
    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    /// Atomically rename the partial file onto the destination, replacing it.
    pub fn commit(self) -> Result<PathBuf> {
        let dest = self.dest;
        self.temp
            .persist(&dest)
            .map_err(|e| anyhow::anyhow!("Failed to move output into {}: {}", dest.display(), e.error))?;
        Ok(dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_replaces_destination() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("nested").join("out.tif");

        let staged = StagedFile::new(&dest).unwrap();
        std::fs::write(staged.path(), b"first").unwrap();
        assert!(!dest.exists());
        assert_eq!(staged.commit().unwrap(), dest);
        assert_eq!(std::fs::read(&dest).unwrap(), b"first");

        let staged = StagedFile::new(&dest).unwrap();
        std::fs::write(staged.path(), b"second").unwrap();
        staged.commit().unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"second");
    }

    #[test]
    fn test_drop_removes_partial() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.tif");

        let staged = StagedFile::new(&dest).unwrap();
        let partial = staged.path().to_path_buf();
        std::fs::write(&partial, b"half").unwrap();
        drop(staged);

        assert!(!partial.exists());
        assert!(!dest.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
