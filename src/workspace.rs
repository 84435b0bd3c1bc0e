//! Per-evaluation scratch directories.

use crate::error::Result;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Uniquely named directory owned by one evaluation. Dropping it deletes the
/// directory and everything the solver wrote there, on every exit path.
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    /// Create `febcal_<evaluation>_XXXXXX` under `root`, or the system temp
    /// directory when no root is configured.
    pub fn acquire(root: Option<&Path>, evaluation: usize) -> Result<Self> {
        let prefix = format!("febcal_{:05}_", evaluation);
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        let dir = match root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn join(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Delete the directory, reporting any failure.
    pub fn release(self) -> Result<()> {
        self.dir.close()?;
        Ok(())
    }

    /// Keep the directory on disk and return its path.
    pub fn persist(self) -> PathBuf {
        self.dir.into_path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_deletes_contents() {
        let root = TempDir::new().unwrap();
        let ws = Workspace::acquire(Some(root.path()), 3).unwrap();
        let path = ws.path().to_path_buf();
        std::fs::write(ws.join("out.txt"), "x").unwrap();
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("febcal_00003_"));

        ws.release().unwrap();
        assert!(!path.exists());
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_drop_deletes() {
        let root = TempDir::new().unwrap();
        let path = {
            let ws = Workspace::acquire(Some(root.path()), 1).unwrap();
            std::fs::create_dir(ws.join("nested")).unwrap();
            ws.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_workspaces_are_distinct() {
        let root = TempDir::new().unwrap();
        let a = Workspace::acquire(Some(root.path()), 1).unwrap();
        let b = Workspace::acquire(Some(root.path()), 1).unwrap();
        assert_ne!(a.path(), b.path());
    }

    #[test]
    fn test_persist_keeps_directory() {
        let root = TempDir::new().unwrap();
        let ws = Workspace::acquire(Some(root.path()), 2).unwrap();
        let kept = ws.persist();
        assert!(kept.is_dir());
    }
}
