//! Temporary project trees for integration tests.
//!
//! Gated behind the `project-util` Cargo feature, built on [`tempfile`], giving
//! integration tests a throwaway directory tree instead of hand-rolling one per test.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};
use tempfile::TempDir;

use crate::error::Result;
use crate::manager::Manager;

/// A scratch directory tree with `in/`, `out/`, and `state/` subdirectories, torn down
/// on drop.
pub struct TempProject {
    root: TempDir,
}

impl TempProject {
    pub fn new() -> Result<Self> {
        let root = TempDir::new().map_err(|err| crate::error::EngineError::io(err, Path::new(".")))?;
        fs::create_dir_all(root.path().join("in"))
            .map_err(|err| crate::error::EngineError::io(err, root.path()))?;
        fs::create_dir_all(root.path().join("out"))
            .map_err(|err| crate::error::EngineError::io(err, root.path()))?;
        fs::create_dir_all(root.path().join("state"))
            .map_err(|err| crate::error::EngineError::io(err, root.path()))?;
        Ok(Self { root })
    }

    pub fn in_dir(&self) -> PathBuf {
        self.root.path().join("in")
    }

    pub fn out_dir(&self) -> PathBuf {
        self.root.path().join("out")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.path().join("state")
    }

    /// Writes `content` to `relative` under the input directory, creating parent
    /// directories as needed.
    pub fn write_input(&self, relative: &str, content: impl AsRef<[u8]>) -> Result<PathBuf> {
        let path = self.in_dir().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| crate::error::EngineError::io(err, parent))?;
        }
        fs::write(&path, content).map_err(|err| crate::error::EngineError::io(err, &path))?;
        Ok(path)
    }

    /// A fresh [`Manager`] with no diagnostic hooks, rooted at this project's state
    /// directory.
    pub fn manager(&self) -> Arc<Manager> {
        Arc::new(Manager::new(self.state_dir()))
    }
}
