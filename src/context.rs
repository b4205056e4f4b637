//! The per-build session handle: [`BuildContext`].
//!
//! Callers register outputs, referenced inputs, and messages against inputs while the
//! context is open, then a single `commit()` call reconciles everything against the
//! previous state in one pass: the ten-step protocol in [`BuildContext::commit`].

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use tracing::{instrument, trace, warn};

use crate::digest::Digester;
use crate::error::{EngineError, Result};
use crate::manager::{Manager, ManagerHooks};
use crate::output_stream::{IncrementalOutputStream, OutputTracking};
use crate::path_set::PathSet;
use crate::path_utils;
use crate::resolver::{self, OutputScan, ResolvedInputs};
use crate::state::{BuildState, Message};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    Committed,
    Closed,
}

#[derive(Debug, Default)]
struct PendingInput {
    outputs: BTreeSet<PathBuf>,
    referenced: BTreeSet<PathBuf>,
    messages: Vec<Message>,
    messages_cleared: bool,
}

/// A single build session against one `(output_dir, builder_id)` state.
///
/// Obtained from [`Manager::new_context`]. Must be either [`commit`](Self::commit)ed
/// or [`close`](Self::close)d; dropping an open context without either is equivalent
/// to closing it without committing (the in-memory updates are discarded and, if no
/// other context still references the cached state, its state file is removed since
/// it can no longer be trusted to reflect what's on disk).
pub struct BuildContext {
    state: Arc<Mutex<BuildState>>,
    manager: Arc<Manager>,
    hooks: Arc<dyn ManagerHooks>,
    output_dir: PathBuf,
    full_build: bool,
    phase: Phase,
    configuration: Option<Vec<u8>>,
    pending: BTreeMap<PathBuf, PendingInput>,
    /// Inputs the resolver reported as deleted across every `get_inputs` call this
    /// session, applied to state at commit (deepest path first).
    deleted_inputs: BTreeSet<PathBuf>,
    /// Every `PathSet` passed to `get_inputs` this session, used at commit to decide
    /// which inputs' messages are eligible for replay and error-counting.
    queried_sets: Vec<PathSet>,
    /// Shared with every `IncrementalOutputStream` this context hands out, so a
    /// stream's own close() can retract an output from `modified` to `unmodified`.
    output_tracking: Arc<Mutex<OutputTracking>>,
}

impl BuildContext {
    pub(crate) fn open(
        state: Arc<Mutex<BuildState>>,
        output_dir: PathBuf,
        full_build: bool,
        hooks: Arc<dyn ManagerHooks>,
        manager: Arc<Manager>,
    ) -> Self {
        Self {
            state,
            manager,
            hooks,
            output_dir,
            full_build,
            phase: Phase::Open,
            configuration: None,
            pending: BTreeMap::new(),
            deleted_inputs: BTreeSet::new(),
            queried_sets: Vec::new(),
            output_tracking: Arc::new(Mutex::new(OutputTracking::default())),
        }
    }

    /// Exposed for tests that need to confirm two contexts share the same cached
    /// state; not part of the public surface a caller would script against.
    #[doc(hidden)]
    pub fn state_handle(&self) -> &Arc<Mutex<BuildState>> {
        &self.state
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn is_full_build(&self) -> bool {
        self.full_build
    }

    fn require_open(&self) -> Result<()> {
        if self.phase != Phase::Open {
            return Err(EngineError::illegal_state("build context is not open"));
        }
        Ok(())
    }

    /// A fresh fingerprint accumulator for computing a configuration digest.
    pub fn new_digester(&self) -> Digester {
        Digester::new()
    }

    /// Records the digest of the effective configuration for this build. Compared
    /// against the previously stored digest at commit time; a change is visible to
    /// subsequent `get_inputs` calls only (this session's own resolution already ran
    /// against the prior configuration).
    pub fn set_configuration(&mut self, digest: Vec<u8>) -> Result<()> {
        self.require_open()?;
        self.configuration = Some(digest);
        Ok(())
    }

    /// `true` if `digest` differs from the configuration stored from the previous
    /// commit (or there was none).
    pub fn is_configuration_changed(&self, digest: &[u8]) -> Result<bool> {
        self.require_open()?;
        let state = self.state.lock().expect("build state poisoned");
        Ok(state.is_configuration_changed(digest))
    }

    /// Reads an entry from the persisted user-value bag.
    pub fn get_value(&self, key: &str) -> Result<Option<serde_json::Value>> {
        self.require_open()?;
        let state = self.state.lock().expect("build state poisoned");
        Ok(state.get_value(key).cloned())
    }

    /// Writes an entry into the persisted user-value bag. Takes effect immediately
    /// (not buffered until commit); on a full build the prior bag is dropped wholesale
    /// during commit regardless of what's written here.
    pub fn set_value(&mut self, key: impl Into<String>, value: serde_json::Value) -> Result<()> {
        self.require_open()?;
        self.state.lock().expect("build state poisoned").set_value(key, value);
        Ok(())
    }

    /// `get_value`, deserializing the stored JSON into `T`.
    pub fn get_typed<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.require_open()?;
        let state = self.state.lock().expect("build state poisoned");
        state.get_typed(key)
    }

    /// `set_value`, serializing `value` to JSON first.
    pub fn set_typed<T: serde::Serialize>(&mut self, key: impl Into<String>, value: &T) -> Result<()> {
        self.require_open()?;
        let mut state = self.state.lock().expect("build state poisoned");
        state.set_typed(key, value)
    }

    /// Resolves `set` against the current state: selected entries, the dirty subset,
    /// and previously tracked inputs under `set`'s base that have disappeared.
    ///
    /// Records `set` in the queried-sets tracker (consulted at commit for message
    /// replay and error counting) and seeds an empty pending record for every input
    /// reported dirty, so an input that produces no output is still written back to
    /// state at commit with a fresh fingerprint — otherwise it would be reported dirty
    /// forever.
    #[instrument(skip(self, set))]
    pub fn get_inputs(&mut self, set: &PathSet) -> Result<ResolvedInputs> {
        self.require_open()?;
        self.queried_sets.push(set.clone());

        let resolved = {
            let state = self.state.lock().expect("build state poisoned");
            resolver::resolve_inputs(set, &state, self.full_build)?
        };

        for deleted in &resolved.deleted {
            self.deleted_inputs.insert(deleted.clone());
        }
        for dirty in &resolved.dirty {
            self.pending.entry(dirty.clone()).or_default();
        }

        Ok(resolved)
    }

    /// Resolves `set` (rooted at an output directory) against the current state's
    /// output index: which on-disk entries are still owned, and which are not.
    pub fn resolve_outputs(&self, set: &PathSet) -> Result<OutputScan> {
        self.require_open()?;
        let state = self.state.lock().expect("build state poisoned");
        resolver::resolve_outputs(set, &state)
    }

    fn pending_for(&mut self, input: &Path) -> &mut PendingInput {
        self.pending.entry(input.to_path_buf()).or_default()
    }

    /// Opens a write-through-compare output stream for `output`, owned by `input`.
    /// `output` is registered as modified immediately; the stream's own close() may
    /// retract it to unmodified if nothing actually changed.
    pub fn new_output_stream(&mut self, input: &Path, output: &Path) -> Result<IncrementalOutputStream> {
        self.require_open()?;
        let output = path_utils::canonicalized(output);
        self.pending_for(input).outputs.insert(output.clone());
        self.output_tracking.lock().expect("output tracking poisoned").record(output.clone(), true);
        IncrementalOutputStream::open(output, Some(Arc::clone(&self.output_tracking)))
    }

    /// Registers `output` as owned by `input`, written by some means other than
    /// [`new_output_stream`](Self::new_output_stream). Always counts as modified —
    /// there is no stream to later retract it.
    pub fn add_output(&mut self, input: &Path, output: &Path) -> Result<()> {
        self.require_open()?;
        let output = path_utils::canonicalized(output);
        self.pending_for(input).outputs.insert(output.clone());
        self.output_tracking.lock().expect("output tracking poisoned").record(output, true);
        Ok(())
    }

    /// Records that `input`'s processing also depended on `referenced` (headers,
    /// imports, included templates, ...), folded into dirty propagation.
    pub fn add_referenced_inputs(
        &mut self,
        input: &Path,
        referenced: impl IntoIterator<Item = PathBuf>,
    ) -> Result<()> {
        self.require_open()?;
        let referenced = referenced.into_iter().map(path_utils::canonicalized);
        self.pending_for(input).referenced.extend(referenced);
        Ok(())
    }

    /// Clears any messages accumulated for `input` in this session. Must be called
    /// before the first [`add_message`](Self::add_message) for a given input in a
    /// given session — an unconditional-append API invites silently doubling up
    /// diagnostics across retried builds.
    pub fn clear_messages(&mut self, input: &Path) -> Result<()> {
        self.require_open()?;
        let pending = self.pending_for(input);
        pending.messages.clear();
        pending.messages_cleared = true;
        Ok(())
    }

    /// Appends a diagnostic for `input`. Returns [`EngineError::IllegalState`] if
    /// [`clear_messages`](Self::clear_messages) has not yet been called for `input`
    /// in this session.
    pub fn add_message(&mut self, input: &Path, message: Message) -> Result<()> {
        self.require_open()?;
        let pending = self.pending_for(input);
        if !pending.messages_cleared {
            return Err(EngineError::illegal_state(format!(
                "add_message called for {} before clear_messages",
                input.display()
            )));
        }
        pending.messages.push(message);
        Ok(())
    }

    /// `true` if `path` falls under the base of some `PathSet` queried this session
    /// and is selected by it — used to scope message replay and error counting to
    /// inputs the caller actually cares about.
    fn matches_any_queried(&self, path: &Path) -> bool {
        self.queried_sets.iter().any(|set| {
            path.starts_with(set.base())
                && set.is_selected(&path_utils::to_posix_relative(path, set.base()).to_string_lossy())
        })
    }

    /// Runs the commit protocol: folds every pending registration into the build
    /// state and persists it. After this call the context is [`Phase::Committed`] and
    /// no further mutation is accepted, even if this call itself returns an error.
    ///
    /// 1. Store the configuration digest, if one was set.
    /// 2. For each input touched this session: replace its output set (deleting
    ///    files that became obsolete), replace its referenced-input set.
    /// 3. For each input reported deleted this session (deepest path first): remove
    ///    its record, delete the outputs it orphaned.
    /// 4. Drop referenced-fingerprint entries no surviving input still references.
    /// 5. Replace stored messages for inputs touched this session.
    /// 6. Persist the state to disk, atomically.
    /// 7. If any output changed, notify the manager's hooks.
    /// 8. Replay messages for inputs not touched this session but still matching a
    ///    queried path set, then count error-severity messages across every input
    ///    (touched or replayed) matching a queried path set. A nonzero count fails
    ///    the call with [`EngineError::BuildFailed`] — after the state above has
    ///    already been persisted.
    #[instrument(skip(self))]
    pub fn commit(&mut self) -> Result<()> {
        self.require_open()?;
        let mut state = self.state.lock().expect("build state poisoned");

        if self.full_build {
            state.clear_values();
        }
        if let Some(digest) = self.configuration.take() {
            state.set_configuration(digest);
        }

        let pending = std::mem::take(&mut self.pending);
        let mut new_messages = BTreeMap::new();
        for (input, record) in &pending {
            new_messages.insert(input.clone(), record.messages.clone());
        }

        {
            let mut tracking = self.output_tracking.lock().expect("output tracking poisoned");

            for (input, record) in pending {
                let obsolete = state.set_outputs(&input, record.outputs);
                for output in &obsolete {
                    if let Err(err) = path_utils::remove_file_if_exists(output) {
                        warn!(output = %output.display(), error = %err, "failed to remove obsolete output");
                    }
                    tracking.record(output.clone(), true);
                }
                state.set_referenced_inputs(&input, record.referenced);
            }

            let mut deleted: Vec<PathBuf> = std::mem::take(&mut self.deleted_inputs).into_iter().collect();
            deleted.sort_by(|a, b| b.cmp(a));
            for input in deleted {
                let orphaned = state.remove_input(&input);
                for output in &orphaned {
                    if let Err(err) = path_utils::remove_file_if_exists(output) {
                        warn!(output = %output.display(), error = %err, "failed to remove orphaned output");
                    }
                    tracking.record(output.clone(), true);
                }
            }
        }

        state.cleanup_referenced_inputs();

        let old_messages = state.merge_messages(new_messages.clone());
        trace!(inputs = old_messages.len(), "replaced stored messages");

        state.save()?;

        let modified: Vec<PathBuf> = {
            let tracking = self.output_tracking.lock().expect("output tracking poisoned");
            tracking.modified.iter().cloned().collect()
        };
        if !modified.is_empty() {
            self.hooks.on_output_updated(&modified);
        }

        let touched: BTreeSet<PathBuf> = new_messages.keys().cloned().collect();
        let mut error_count = 0usize;
        for (input, messages) in &new_messages {
            if self.matches_any_queried(input) {
                for message in messages {
                    self.hooks.on_message(input, message);
                    if message.severity.is_error() {
                        error_count += 1;
                    }
                }
            }
        }

        let replay: Vec<(PathBuf, Vec<Message>)> = state
            .inputs()
            .filter(|(path, _)| !touched.contains(*path) && self.matches_any_queried(path))
            .map(|(path, record)| (path.clone(), record.messages.clone()))
            .collect();
        for (input, messages) in &replay {
            for message in messages {
                self.hooks.on_message(input, message);
                if message.severity.is_error() {
                    error_count += 1;
                }
            }
        }

        drop(state);
        self.phase = Phase::Committed;

        if error_count > 0 {
            return Err(EngineError::BuildFailed { error_count });
        }
        Ok(())
    }

    /// Closes the context. If it had not been committed, the cached state is
    /// destroyed (evicted from the manager's cache and its state file removed) since
    /// it now reflects an abandoned session rather than what's on disk.
    pub fn close(&mut self) -> Result<()> {
        if self.phase == Phase::Open {
            self.manager.destroy(&self.state)?;
        }
        self.phase = Phase::Closed;
        Ok(())
    }
}

impl Drop for BuildContext {
    fn drop(&mut self) {
        if self.phase == Phase::Open {
            let _ = self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Severity;

    fn open_context(dir: &std::path::Path) -> (Arc<Manager>, BuildContext) {
        let manager = Arc::new(Manager::new(dir.join("state")));
        let out_dir = dir.join("out");
        std::fs::create_dir_all(&out_dir).unwrap();
        let ctx = manager.new_context(&out_dir, "builder").unwrap();
        (manager, ctx)
    }

    #[test]
    fn add_message_without_clear_is_illegal_state() {
        let dir = tempfile::tempdir().unwrap();
        let (_manager, mut ctx) = open_context(dir.path());
        let input = dir.path().join("a.txt");
        let message =
            Message { line: 1, column: 1, text: "oops".into(), severity: Severity::Error, cause: None };
        let err = ctx.add_message(&input, message).unwrap_err();
        assert!(matches!(err, EngineError::IllegalState(_)));
    }

    #[test]
    fn clear_then_add_message_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let (_manager, mut ctx) = open_context(dir.path());
        let input = dir.path().join("a.txt");
        ctx.clear_messages(&input).unwrap();
        let message =
            Message { line: 1, column: 1, text: "oops".into(), severity: Severity::Warning, cause: None };
        ctx.add_message(&input, message).unwrap();
        ctx.commit().unwrap();
    }

    #[test]
    fn commit_persists_outputs_and_marks_committed() {
        let dir = tempfile::tempdir().unwrap();
        let (_manager, mut ctx) = open_context(dir.path());
        let input = dir.path().join("a.txt");
        std::fs::write(&input, b"1").unwrap();
        let output = dir.path().join("out/a.out");
        ctx.add_output(&input, &output).unwrap();
        ctx.commit().unwrap();

        let state = ctx.state_handle().lock().unwrap();
        assert!(state.contains_input(&input));
        assert!(state.is_tracked_output(&path_utils::canonicalized(output.as_path())));
    }

    #[test]
    fn mutating_after_commit_is_illegal_state() {
        let dir = tempfile::tempdir().unwrap();
        let (_manager, mut ctx) = open_context(dir.path());
        ctx.commit().unwrap();
        let err = ctx.set_configuration(vec![1]).unwrap_err();
        assert!(matches!(err, EngineError::IllegalState(_)));
    }

    #[test]
    fn close_without_commit_destroys_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, mut ctx) = open_context(dir.path());
        let input = dir.path().join("a.txt");
        std::fs::write(&input, b"1").unwrap();
        ctx.add_output(&input, &dir.path().join("out/a.out")).unwrap();
        ctx.close().unwrap();
        drop(ctx);

        let out_dir = dir.path().join("out");
        let ctx2 = manager.new_context(&out_dir, "builder").unwrap();
        assert!(!ctx2.state_handle().lock().unwrap().contains_input(&input));
    }

    #[test]
    fn drop_without_close_behaves_like_close_without_commit() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, mut ctx) = open_context(dir.path());
        let input = dir.path().join("a.txt");
        std::fs::write(&input, b"1").unwrap();
        ctx.add_output(&input, &dir.path().join("out/a.out")).unwrap();
        drop(ctx);

        let out_dir = dir.path().join("out");
        let ctx2 = manager.new_context(&out_dir, "builder").unwrap();
        assert!(!ctx2.state_handle().lock().unwrap().contains_input(&input));
    }

    #[test]
    fn deleted_input_orphans_its_exclusive_output_on_commit() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(Manager::new(dir.join("state")));
        let in_dir = dir.path().join("in");
        let out_dir = dir.path().join("out");
        std::fs::create_dir_all(&in_dir).unwrap();
        std::fs::create_dir_all(&out_dir).unwrap();
        let input = in_dir.join("a.txt");
        std::fs::write(&input, b"1").unwrap();
        let output = out_dir.join("a.out");

        let set = PathSet::new(in_dir.clone(), Vec::<String>::new(), Vec::<String>::new());
        {
            let mut ctx = manager.new_context(&out_dir, "builder").unwrap();
            ctx.get_inputs(&set).unwrap();
            ctx.add_output(&input, &output).unwrap();
            std::fs::write(&output, b"1").unwrap();
            ctx.commit().unwrap();
        }

        std::fs::remove_file(&input).unwrap();
        let mut ctx = manager.new_context(&out_dir, "builder").unwrap();
        let resolved = ctx.get_inputs(&set).unwrap();
        assert_eq!(resolved.deleted, vec![path_utils::canonicalized(input.as_path())]);
        ctx.commit().unwrap();

        assert!(!output.exists(), "orphaned output must be deleted on commit");
        let state = ctx.state_handle().lock().unwrap();
        assert!(!state.contains_input(&path_utils::canonicalized(input.as_path())));
    }

    #[test]
    fn commit_fails_with_build_failed_when_errors_persist() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(Manager::new(dir.join("state")));
        let in_dir = dir.path().join("in");
        let out_dir = dir.path().join("out");
        std::fs::create_dir_all(&in_dir).unwrap();
        std::fs::create_dir_all(&out_dir).unwrap();
        let input = in_dir.join("a.txt");
        std::fs::write(&input, b"1").unwrap();
        let set = PathSet::new(in_dir.clone(), Vec::<String>::new(), Vec::<String>::new());

        {
            let mut ctx = manager.new_context(&out_dir, "builder").unwrap();
            ctx.get_inputs(&set).unwrap();
            ctx.clear_messages(&input).unwrap();
            let message = Message {
                line: 1,
                column: 1,
                text: "bad thing".into(),
                severity: Severity::Error,
                cause: None,
            };
            ctx.add_message(&input, message).unwrap();
            let err = ctx.commit().unwrap_err();
            assert!(matches!(err, EngineError::BuildFailed { error_count: 1 }));
        }

        // Re-run with the input unchanged and no new messages: the stored error is
        // replayed and the build fails again.
        let mut ctx = manager.new_context(&out_dir, "builder").unwrap();
        ctx.get_inputs(&set).unwrap();
        let err = ctx.commit().unwrap_err();
        assert!(matches!(err, EngineError::BuildFailed { error_count: 1 }));

        // Clearing the message with no replacement lets the next commit succeed.
        let mut ctx = manager.new_context(&out_dir, "builder").unwrap();
        ctx.get_inputs(&set).unwrap();
        ctx.clear_messages(&input).unwrap();
        ctx.commit().unwrap();
    }
}
