//! Path normalization and small filesystem helpers shared across the engine.
//!
//! Canonicalization that is consistent across platforms, JSON read/write helpers, and
//! relative-path conversions that always use `/` regardless of host.

use crate::error::{EngineError, IoError, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

/// Canonicalize the path, platform-agnostic.
///
/// On windows this ensures the path only consists of `/` separators, matching the
/// separator convention [`to_posix_relative`] uses for path-set patterns.
pub fn canonicalize(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    let res = dunce::canonicalize(path);
    #[cfg(windows)]
    let res = res.map(|p| {
        use path_slash::PathBufExt;
        PathBuf::from(p.to_slash_lossy().as_ref())
    });
    res.map_err(|err| EngineError::io(err, path))
}

/// Best-effort canonicalization: falls back to the original path if probing fails
/// (e.g. the path does not exist yet, as can happen for an output file).
pub fn canonicalized(path: impl Into<PathBuf>) -> PathBuf {
    let path = path.into();
    canonicalize(&path).unwrap_or(path)
}

/// Returns `path` relative to `root`, with `/` separators regardless of host.
///
/// Falls back to `path` itself if it is not actually rooted under `root`.
pub fn to_posix_relative(path: &Path, root: &Path) -> PathBuf {
    use path_slash::PathExt;
    let rel = path.strip_prefix(root).unwrap_or(path);
    PathBuf::from(rel.to_slash_lossy().as_ref())
}

/// Creates the parent directory of `file` and all its ancestors if missing.
pub fn create_parent_dir_all(file: &Path) -> Result<()> {
    if let Some(parent) = file.parent() {
        fs::create_dir_all(parent).map_err(|err| EngineError::io(err, parent))?;
    }
    Ok(())
}

/// Reads and deserializes a JSON file via a memory map.
pub fn read_json_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = fs::File::open(path).map_err(|err| EngineError::io(err, path))?;
    // SAFETY: the file is only read from, for the duration of the mapping; the
    // caller is assumed not to concurrently truncate the file out from under us.
    let bytes = unsafe { memmap2::Mmap::map(&file).map_err(|err| EngineError::io(err, path))? };
    let mut deserializer = serde_json::Deserializer::from_slice(&bytes);
    serde_path_to_error::deserialize(&mut deserializer)
        .map_err(|err| EngineError::Decode(err.into_inner()))
}

/// Serializes `value` as JSON and writes it to `path` through a buffered writer.
pub fn write_json_file<T: Serialize>(value: &T, path: &Path, capacity: usize) -> Result<()> {
    let file = fs::File::create(path).map_err(|err| EngineError::io(err, path))?;
    let mut writer = std::io::BufWriter::with_capacity(capacity, file);
    serde_json::to_writer(&mut writer, value).map_err(EngineError::Decode)?;
    writer.flush().map_err(|e| EngineError::io(e, path))
}

/// Atomically replaces the content of `path` with `value`'s JSON encoding: writes to
/// a sibling temp file, then renames over the destination.
pub fn write_json_file_atomic<T: Serialize>(value: &T, path: &Path, capacity: usize) -> Result<()> {
    create_parent_dir_all(path)?;
    let tmp_path = tmp_sibling(path);
    write_json_file(value, &tmp_path, capacity)?;
    fs::rename(&tmp_path, path).map_err(|err| EngineError::io(err, path))
}

pub(crate) fn tmp_sibling(path: &Path) -> PathBuf {
    let file_name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    path.with_file_name(format!(".{file_name}.tmp"))
}

/// Deletes `path` if it exists; absence is not an error.
pub fn remove_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(EngineError::io(err, path)),
    }
}

/// The mtime of `path`, in seconds since the Unix epoch.
pub fn mtime_secs(path: &Path) -> Result<i64> {
    let meta = fs::metadata(path).map_err(|err| EngineError::io(err, path))?;
    mtime_of(&meta, path)
}

pub(crate) fn mtime_of(meta: &fs::Metadata, path: &Path) -> Result<i64> {
    let modified = meta.modified().map_err(|err| EngineError::io(err, path))?;
    Ok(modified
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_else(|e| -(e.duration().as_secs() as i64)))
}

/// Converts an [`std::io::Error`] into an [`IoError`] tagged with `path`.
pub fn tag_io(err: std::io::Error, path: impl AsRef<Path>) -> IoError {
    IoError::new(err, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_path_uses_posix_separators() {
        let root = Path::new("/project/in");
        let path = root.join("nested").join("a.txt");
        assert_eq!(to_posix_relative(&path, root), PathBuf::from("nested/a.txt"));
    }

    #[test]
    fn json_round_trips_through_atomic_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        write_json_file_atomic(&vec![1, 2, 3], &path, 1024).unwrap();
        let read: Vec<i32> = read_json_file(&path).unwrap();
        assert_eq!(read, vec![1, 2, 3]);
    }

    #[test]
    fn remove_file_if_exists_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        remove_file_if_exists(&path).unwrap();
        remove_file_if_exists(&path).unwrap();
    }
}
