//! Error types returned by this crate.

use std::path::{Path, PathBuf};

/// An I/O failure tagged with the path that was being operated on, instead of
/// surfacing a bare [`std::io::Error`] with no context.
#[derive(Debug, thiserror::Error)]
#[error("{path}: {source}")]
pub struct IoError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

impl IoError {
    pub fn new(source: std::io::Error, path: impl AsRef<Path>) -> Self {
        Self { path: path.as_ref().into(), source }
    }
}

/// All error kinds the engine can raise: `InvalidArgument`, `IllegalState`, `Io`,
/// `BuildFailed`, `Decode`.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A `nil`/empty argument was passed to a non-nullable parameter. Caller bug.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An operation was attempted on a context that is not open, or messages were
    /// added without first clearing them. Caller bug.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// Underlying filesystem failure during probe, read, write, rename, or delete.
    #[error(transparent)]
    Io(#[from] IoError),

    /// `commit` succeeded but persisted error-severity messages remain for inputs
    /// belonging to a queried path set.
    #[error("build failed with {error_count} error(s)")]
    BuildFailed { error_count: usize },

    /// The state file exists but could not be decoded; treated as absent by the
    /// caller of `BuildState::load`.
    #[error(transparent)]
    Decode(#[from] serde_json::Error),
}

impl EngineError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn illegal_state(msg: impl Into<String>) -> Self {
        Self::IllegalState(msg.into())
    }

    pub fn io(source: std::io::Error, path: impl AsRef<Path>) -> Self {
        Self::Io(IoError::new(source, path))
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
