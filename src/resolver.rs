//! Walks a [`PathSet`] against a [`BuildState`] to answer `get_inputs`-style and
//! `resolve_outputs`-style queries.
//!
//! Subtrees are pruned via [`PathSet::is_ancestor_of_potentially_selected`] so a
//! narrow include pattern doesn't force a full-tree walk.

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};
use walkdir::WalkDir;

use crate::error::Result;
use crate::path_set::PathSet;
use crate::path_utils;
use crate::state::BuildState;

/// Result of resolving a [`PathSet`] against a [`BuildState`] for a `get_inputs` call.
#[derive(Debug, Default)]
pub struct ResolvedInputs {
    /// Every entry currently matched by the path set, in walk order.
    pub selected: Vec<PathBuf>,
    /// The subset of `selected` that is new or changed (or forced, on a full build).
    pub dirty: BTreeSet<PathBuf>,
    /// Previously tracked inputs under the path set's base that are no longer present.
    pub deleted: Vec<PathBuf>,
}

/// Result of a `resolve_outputs` scan: every filesystem entry matched by a path set
/// rooted at an output directory, split by whether the build state still owns it.
#[derive(Debug, Default)]
pub struct OutputScan {
    /// Outputs on disk that at least one tracked input still owns.
    pub live: BTreeSet<PathBuf>,
    /// Outputs on disk with no owning input record — left over from a manually
    /// deleted state file, or written by something outside this engine.
    pub untracked: BTreeSet<PathBuf>,
}

/// Walks `set` and classifies every selected entry against `state`.
///
/// When `force_full` is set, every selected entry is reported dirty regardless of its
/// fingerprint — but the walk still runs, so deletions are still detected.
pub fn resolve_inputs(set: &PathSet, state: &BuildState, force_full: bool) -> Result<ResolvedInputs> {
    let mut selected = Vec::new();
    let mut dirty = BTreeSet::new();
    let mut seen = BTreeSet::new();

    for (absolute, _relative) in walk_selected(set)? {
        seen.insert(absolute.clone());
        let is_dirty = force_full || state.is_processing_required(&absolute);
        if is_dirty {
            dirty.insert(absolute.clone());
        }
        selected.push(absolute);
    }

    let deleted = state.get_deleted_input_paths(set.base(), &seen);

    Ok(ResolvedInputs { selected, dirty, deleted })
}

/// Walks the filesystem entries matched by `set` (an output-directory path set) and
/// classifies each against `state`'s output index.
pub fn resolve_outputs(set: &PathSet, state: &BuildState) -> Result<OutputScan> {
    let mut live = BTreeSet::new();
    let mut untracked = BTreeSet::new();

    for (absolute, _relative) in walk_selected(set)? {
        if state.is_tracked_output(&absolute) {
            live.insert(absolute);
        } else {
            untracked.insert(absolute);
        }
    }

    Ok(OutputScan { live, untracked })
}

/// Walks `set`'s base directory, yielding `(absolute, posix_relative)` pairs for every
/// entry `set` selects. Subtrees the path set's includes cannot possibly reach are
/// pruned without descending into them.
fn walk_selected(set: &PathSet) -> Result<Vec<(PathBuf, String)>> {
    let base = set.base();
    if !base.exists() {
        return Ok(Vec::new());
    }

    let mut out = Vec::new();
    let walker = WalkDir::new(base).into_iter().filter_entry(|entry| {
        if entry.path() == base {
            return true;
        }
        let relative = path_utils::to_posix_relative(entry.path(), base);
        let relative = relative.to_string_lossy();
        if entry.file_type().is_dir() {
            set.is_ancestor_of_potentially_selected(&relative)
        } else {
            true
        }
    });

    for entry in walker {
        let entry = entry.map_err(|err| {
            let path = err.path().map(Path::to_path_buf).unwrap_or_else(|| base.to_path_buf());
            crate::error::EngineError::io(err.into_io_error().unwrap_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::Other, "directory walk failed")
            }), path)
        })?;

        if entry.path() == base {
            continue;
        }

        let is_dir = entry.file_type().is_dir();
        if is_dir && !set.include_directories() {
            continue;
        }
        if !is_dir && !set.include_files() {
            continue;
        }

        let relative = path_utils::to_posix_relative(entry.path(), base);
        let relative_str = relative.to_string_lossy().into_owned();
        if set.is_selected(&relative_str) {
            out.push((entry.path().to_path_buf(), relative_str));
        }
    }

    Ok(out)
}
