//! The persisted build-state model: input records, fingerprints, messages, and the
//! derived output→input index.
//!
//! A `BTreeMap` keyed by file path, read/written as JSON through
//! [`crate::path_utils::read_json_file`] / [`crate::path_utils::write_json_file_atomic`],
//! with a cleanup pass over stale referenced-input fingerprints
//! ([`BuildState::cleanup_referenced_inputs`]).

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    fs,
    path::{Path, PathBuf},
};

use crate::error::{EngineError, Result};
use crate::path_utils;

/// Fingerprint of a filesystem entry, captured at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileState {
    pub size: u64,
    pub mtime: i64,
    pub is_directory: bool,
}

impl FileState {
    /// Probes the entry at `path`, returning its current fingerprint.
    pub fn probe(path: &Path) -> Result<Self> {
        let meta = fs::metadata(path).map_err(|err| EngineError::io(err, path))?;
        Ok(Self {
            size: if meta.is_dir() { 0 } else { meta.len() },
            mtime: path_utils::mtime_of(&meta, path)?,
            is_directory: meta.is_dir(),
        })
    }
}

/// Severity of a persisted diagnostic [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

impl Severity {
    pub fn is_error(&self) -> bool {
        matches!(self, Severity::Error)
    }
}

/// A diagnostic attached to an input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub line: i32,
    pub column: i32,
    pub text: String,
    pub severity: Severity,
    pub cause: Option<String>,
}

/// Persisted per-input tuple: fingerprint, outputs, referenced inputs, messages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRecord {
    pub outputs: BTreeSet<PathBuf>,
    pub referenced: BTreeSet<PathBuf>,
    pub fingerprint: Option<FileState>,
    pub referenced_fingerprints: BTreeMap<PathBuf, FileState>,
    pub messages: Vec<Message>,
}

/// The serializable core of a [`BuildState`]; `output_to_inputs` and `file_time` are
/// derived/runtime and intentionally excluded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Persisted {
    #[serde(default)]
    configuration: Option<Vec<u8>>,
    #[serde(default)]
    inputs: BTreeMap<PathBuf, InputRecord>,
    #[serde(default)]
    user_values: BTreeMap<String, serde_json::Value>,
}

/// The persisted build-state model.
///
/// One instance per `(output_dir, builder_id)` pair, cached by [`crate::Manager`]
/// and mutated only through the commit protocol in [`crate::BuildContext`].
#[derive(Debug)]
pub struct BuildState {
    state_path: PathBuf,
    persisted: Persisted,
    output_to_inputs: BTreeMap<PathBuf, BTreeSet<PathBuf>>,
    /// mtime of the state file at load time, used to detect concurrent modification.
    file_time: Option<i64>,
}

impl BuildState {
    /// Constructs an empty state for `state_path` (used for a forced full build, or
    /// when no state file exists yet).
    pub fn empty(state_path: PathBuf) -> Self {
        Self { state_path, persisted: Persisted::default(), output_to_inputs: BTreeMap::new(), file_time: None }
    }

    /// Loads state from `state_path` if it exists and is decodable; otherwise
    /// returns an empty state (the caller should log a warning in the decode-failure
    /// case — see [`crate::Manager::new_context`]).
    pub fn load_or_empty(state_path: PathBuf) -> (Self, Option<EngineError>) {
        if !state_path.exists() {
            return (Self::empty(state_path), None);
        }
        match Self::load(&state_path) {
            Ok(state) => (state, None),
            Err(err) => (Self::empty(state_path), Some(err)),
        }
    }

    fn load(state_path: &Path) -> Result<Self> {
        let persisted: Persisted = path_utils::read_json_file(state_path)?;
        let file_time = Some(path_utils::mtime_secs(state_path)?);
        let mut state = Self { state_path: state_path.to_path_buf(), persisted, output_to_inputs: BTreeMap::new(), file_time };
        state.rebuild_output_index();
        Ok(state)
    }

    fn rebuild_output_index(&mut self) {
        self.output_to_inputs.clear();
        for (input, record) in &self.persisted.inputs {
            for output in &record.outputs {
                self.output_to_inputs.entry(output.clone()).or_default().insert(input.clone());
            }
        }
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// `true` iff the state file on disk has been replaced since this instance was
    /// loaded (by mtime, or by existing now when it didn't exist at load time).
    pub fn is_stale(&self) -> bool {
        match (self.file_time, path_utils::mtime_secs(&self.state_path)) {
            (Some(loaded), Ok(current)) => loaded != current,
            (None, Ok(_)) => true,
            (Some(_), Err(_)) => true,
            (None, Err(_)) => false,
        }
    }

    /// Persists the state to disk, atomically. Proceeds even if [`Self::is_stale`]
    /// — callers are expected to log the event, not abort.
    pub fn save(&mut self) -> Result<()> {
        path_utils::write_json_file_atomic(&self.persisted, &self.state_path, 64 * 1024)?;
        self.file_time = Some(path_utils::mtime_secs(&self.state_path)?);
        Ok(())
    }

    // ---- queries ----

    pub fn is_configuration_changed(&self, digest: &[u8]) -> bool {
        self.persisted.configuration.as_deref() != Some(digest)
    }

    pub fn get_value(&self, key: &str) -> Option<&serde_json::Value> {
        self.persisted.user_values.get(key)
    }

    pub fn set_value(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.persisted.user_values.insert(key.into(), value);
    }

    /// `get_value`, deserializing the stored JSON into `T`.
    pub fn get_typed<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get_value(key) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    /// `set_value`, serializing `value` to JSON first.
    pub fn set_typed<T: Serialize>(&mut self, key: impl Into<String>, value: &T) -> Result<()> {
        let json = serde_json::to_value(value).map_err(EngineError::Decode)?;
        self.set_value(key, json);
        Ok(())
    }

    /// Replaces the user-value bag wholesale (used when committing a full build,
    /// which drops all previously preserved values).
    pub fn clear_values(&mut self) {
        self.persisted.user_values.clear();
    }

    pub fn input(&self, path: &Path) -> Option<&InputRecord> {
        self.persisted.inputs.get(path)
    }

    pub fn inputs(&self) -> impl Iterator<Item = (&PathBuf, &InputRecord)> {
        self.persisted.inputs.iter()
    }

    pub fn contains_input(&self, path: &Path) -> bool {
        self.persisted.inputs.contains_key(path)
    }

    /// Every tracked input path that lives under `base`.
    pub fn tracked_inputs_under<'a>(&'a self, base: &'a Path) -> impl Iterator<Item = &'a PathBuf> + 'a {
        self.persisted.inputs.keys().filter(move |p| p.starts_with(base))
    }

    /// `true` if `output` is currently owned by at least one tracked input.
    pub fn is_tracked_output(&self, output: &Path) -> bool {
        self.output_to_inputs.contains_key(output)
    }

    /// Every output path currently owned by at least one tracked input.
    pub fn tracked_outputs(&self) -> impl Iterator<Item = &PathBuf> {
        self.output_to_inputs.keys()
    }

    /// `true` if `file` (or, recursively, anything it references) is new or changed
    /// since it was last recorded. Cycles in the referenced-input graph are broken
    /// by tracking a per-query visited set.
    pub fn is_processing_required(&self, file: &Path) -> bool {
        let mut visited = HashSet::new();
        self.is_processing_required_inner(file, &mut visited)
    }

    fn is_processing_required_inner(&self, file: &Path, visited: &mut HashSet<PathBuf>) -> bool {
        if !visited.insert(file.to_path_buf()) {
            // Already on the stack for this query: don't re-derive through a cycle.
            return false;
        }

        let Some(record) = self.persisted.inputs.get(file) else {
            return true; // never seen before
        };

        let current = match FileState::probe(file) {
            Ok(state) => state,
            Err(_) => return true, // vanished since being tracked
        };
        if record.fingerprint != Some(current) {
            return true;
        }

        for referenced in &record.referenced {
            if self.persisted.inputs.contains_key(referenced) {
                if self.is_processing_required_inner(referenced, visited) {
                    return true;
                }
            } else if let Some(stored) = record.referenced_fingerprints.get(referenced) {
                match FileState::probe(referenced) {
                    Ok(current_ref) if &current_ref == stored => {}
                    _ => return true,
                }
            } else {
                // Referenced but not tracked anywhere: be conservative.
                return true;
            }
        }

        false
    }

    /// Tracked inputs under `base` that are absent from `selected_files`.
    pub fn get_deleted_input_paths(&self, base: &Path, selected_files: &HashSet<PathBuf>) -> Vec<PathBuf> {
        self.tracked_inputs_under(base).filter(|p| !selected_files.contains(*p)).cloned().collect()
    }

    // ---- mutations (only called from the commit protocol) ----

    pub fn set_configuration(&mut self, digest: Vec<u8>) {
        self.persisted.configuration = Some(digest);
    }

    /// Overwrites the referenced-input set for `input`, capturing fingerprints for
    /// any referenced path that is not itself a tracked input.
    pub fn set_referenced_inputs(&mut self, input: &Path, referenced: BTreeSet<PathBuf>) {
        let mut referenced_fingerprints = BTreeMap::new();
        for path in &referenced {
            if !self.persisted.inputs.contains_key(path) {
                if let Ok(state) = FileState::probe(path) {
                    referenced_fingerprints.insert(path.clone(), state);
                }
            }
        }
        let record = self.persisted.inputs.entry(input.to_path_buf()).or_default();
        record.referenced = referenced;
        record.referenced_fingerprints = referenced_fingerprints;
    }

    /// Replaces the outputs of `input`, re-probing and storing its own fingerprint.
    /// Returns the outputs that were dropped (the *obsolete* set).
    pub fn set_outputs(&mut self, input: &Path, outputs: BTreeSet<PathBuf>) -> BTreeSet<PathBuf> {
        let fingerprint = FileState::probe(input).ok();
        let record = self.persisted.inputs.entry(input.to_path_buf()).or_default();
        let previous = std::mem::replace(&mut record.outputs, outputs.clone());
        record.fingerprint = fingerprint;

        let obsolete: BTreeSet<PathBuf> = previous.difference(&outputs).cloned().collect();
        for output in &previous {
            if let Some(owners) = self.output_to_inputs.get_mut(output) {
                owners.remove(input);
                if owners.is_empty() {
                    self.output_to_inputs.remove(output);
                }
            }
        }
        for output in &outputs {
            self.output_to_inputs.entry(output.clone()).or_default().insert(input.to_path_buf());
        }
        obsolete
    }

    /// Removes `input`'s record entirely. Returns the outputs it used to own that no
    /// other input still owns (the *orphan* set).
    pub fn remove_input(&mut self, input: &Path) -> BTreeSet<PathBuf> {
        let Some(record) = self.persisted.inputs.remove(input) else {
            return BTreeSet::new();
        };
        let mut orphaned = BTreeSet::new();
        for output in &record.outputs {
            if let Some(owners) = self.output_to_inputs.get_mut(output) {
                owners.remove(input);
                if owners.is_empty() {
                    self.output_to_inputs.remove(output);
                    orphaned.insert(output.clone());
                }
            } else {
                orphaned.insert(output.clone());
            }
        }
        orphaned
    }

    /// Replaces the messages of every input present in `new_messages`. Returns the
    /// previously stored messages for those same inputs, for diagnostic replay.
    pub fn merge_messages(
        &mut self,
        new_messages: BTreeMap<PathBuf, Vec<Message>>,
    ) -> BTreeMap<PathBuf, Vec<Message>> {
        let mut old = BTreeMap::new();
        for (input, messages) in new_messages {
            let record = self.persisted.inputs.entry(input.clone()).or_default();
            let previous = std::mem::replace(&mut record.messages, messages);
            old.insert(input, previous);
        }
        old
    }

    /// Drops referenced-fingerprint entries for paths no longer referenced by any
    /// surviving input.
    pub fn cleanup_referenced_inputs(&mut self) {
        let mut still_referenced: BTreeSet<PathBuf> = BTreeSet::new();
        for record in self.persisted.inputs.values() {
            still_referenced.extend(record.referenced.iter().cloned());
        }
        for record in self.persisted.inputs.values_mut() {
            record.referenced_fingerprints.retain(|path, _| still_referenced.contains(path));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path, content: &[u8]) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    #[test]
    fn new_input_requires_processing() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        touch(&file, b"1");
        let state = BuildState::empty(dir.path().join("state.json"));
        assert!(state.is_processing_required(&file));
    }

    #[test]
    fn unchanged_input_does_not_require_processing() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        touch(&file, b"1");
        let mut state = BuildState::empty(dir.path().join("state.json"));
        state.set_outputs(&file, BTreeSet::new());
        assert!(!state.is_processing_required(&file));
    }

    #[test]
    fn changed_content_requires_processing() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        touch(&file, b"1");
        let mut state = BuildState::empty(dir.path().join("state.json"));
        state.set_outputs(&file, BTreeSet::new());
        touch(&file, b"11");
        assert!(state.is_processing_required(&file));
    }

    #[test]
    fn set_outputs_reports_obsolete_difference() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("a.txt");
        touch(&input, b"1");
        let a = dir.path().join("out/a.out");
        let b = dir.path().join("out/b.out");
        let mut state = BuildState::empty(dir.path().join("state.json"));
        let obsolete = state.set_outputs(&input, BTreeSet::from([a.clone(), b.clone()]));
        assert!(obsolete.is_empty());

        let obsolete = state.set_outputs(&input, BTreeSet::from([a]));
        assert_eq!(obsolete, BTreeSet::from([b]));
    }

    #[test]
    fn remove_input_orphans_exclusively_owned_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("a.txt");
        touch(&input, b"1");
        let output = dir.path().join("out/a.out");
        let mut state = BuildState::empty(dir.path().join("state.json"));
        state.set_outputs(&input, BTreeSet::from([output.clone()]));

        let orphaned = state.remove_input(&input);
        assert_eq!(orphaned, BTreeSet::from([output]));
        assert!(!state.contains_input(&input));
    }

    #[test]
    fn remove_input_does_not_orphan_shared_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        touch(&a, b"1");
        touch(&b, b"2");
        let output = dir.path().join("out/shared.out");
        let mut state = BuildState::empty(dir.path().join("state.json"));
        state.set_outputs(&a, BTreeSet::from([output.clone()]));
        state.set_outputs(&b, BTreeSet::from([output]));

        let orphaned = state.remove_input(&a);
        assert!(orphaned.is_empty());
    }

    #[test]
    fn cycle_in_referenced_inputs_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        touch(&a, b"1");
        touch(&b, b"2");
        let mut state = BuildState::empty(dir.path().join("state.json"));
        state.set_outputs(&a, BTreeSet::new());
        state.set_outputs(&b, BTreeSet::new());
        state.set_referenced_inputs(&a, BTreeSet::from([b.clone()]));
        state.set_referenced_inputs(&b, BTreeSet::from([a.clone()]));

        assert!(!state.is_processing_required(&a));
    }

    #[test]
    fn referenced_input_change_marks_referrer_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let header = dir.path().join("header.h");
        touch(&a, b"1");
        touch(&header, b"h1");
        let mut state = BuildState::empty(dir.path().join("state.json"));
        state.set_outputs(&a, BTreeSet::new());
        state.set_referenced_inputs(&a, BTreeSet::from([header.clone()]));
        assert!(!state.is_processing_required(&a));

        touch(&header, b"h2");
        assert!(state.is_processing_required(&a));
    }

    #[test]
    fn save_and_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("a.txt");
        touch(&input, b"1");
        let state_path = dir.path().join("state.json");
        let mut state = BuildState::empty(state_path.clone());
        state.set_configuration(vec![1, 2, 3]);
        state.set_outputs(&input, BTreeSet::from([dir.path().join("out/a.out")]));
        state.save().unwrap();

        let (loaded, decode_err) = BuildState::load_or_empty(state_path);
        assert!(decode_err.is_none());
        assert!(!loaded.is_configuration_changed(&[1, 2, 3]));
        assert!(loaded.contains_input(&input));
    }

    #[test]
    fn missing_state_file_loads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let (state, err) = BuildState::load_or_empty(dir.path().join("nope.json"));
        assert!(err.is_none());
        assert!(state.inputs().next().is_none());
    }

    #[test]
    fn corrupt_state_file_loads_as_empty_with_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let state_path = dir.path().join("state.json");
        fs::write(&state_path, b"not json").unwrap();
        let (state, err) = BuildState::load_or_empty(state_path);
        assert!(err.is_some());
        assert!(state.inputs().next().is_none());
    }
}
