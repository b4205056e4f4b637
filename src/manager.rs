//! Process-wide registry of [`BuildState`]s, keyed by `(output_dir, builder_id)`.
//!
//! A weak-reference cache: two [`BuildContext`]s opened concurrently for the same
//! output directory observe (and serialize writes to) the same in-memory
//! [`BuildState`], while a state with no live context is free to drop out of memory
//! between builds.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, Weak},
};
use tracing::{debug, error, instrument, warn};

use crate::context::BuildContext;
use crate::digest::{hex_digest, Digester};
use crate::error::Result;
use crate::path_utils;
use crate::state::BuildState;

/// Diagnostics and lifecycle callbacks the embedding build tool supplies.
///
/// Expressed as a trait of callable hooks, rather than requiring the caller to
/// implement a larger interface, so a closure-based adapter can be dropped in
/// directly (see [`NullHooks`] for the default no-op implementation).
pub trait ManagerHooks: Send + Sync {
    /// `true` if the next context opened against `output_dir` must treat every
    /// selected input as dirty, regardless of stored fingerprints.
    fn is_full_build(&self, output_dir: &Path) -> bool {
        let _ = output_dir;
        false
    }

    /// Called once per message attached to an input during a commit, whether newly
    /// recorded this build or replayed from a prior one. The default formats
    /// `<path>[<line>[:<col>]]: <text>` and logs it at the message's severity;
    /// override to forward diagnostics to the embedding tool's own reporting surface
    /// instead.
    fn on_message(&self, input: &Path, message: &crate::state::Message) {
        let detail = if !message.text.is_empty() {
            message.text.as_str()
        } else if let Some(cause) = message.cause.as_deref() {
            cause
        } else {
            "(unknown issue)"
        };
        let location = match (message.line, message.column) {
            (line, _) if line <= 0 => String::new(),
            (line, col) if col <= 0 => format!("[{line}]"),
            (line, col) => format!("[{line}:{col}]"),
        };
        let formatted = format!("{}{location}: {detail}", input.display());
        match message.severity {
            crate::state::Severity::Error => error!("{formatted}"),
            crate::state::Severity::Warning => warn!("{formatted}"),
        }
    }

    /// Called once per commit with every output that actually changed, if any.
    fn on_output_updated(&self, _outputs: &[PathBuf]) {}
}

/// A [`ManagerHooks`] that accepts the default diagnostic formatting for
/// [`on_message`](ManagerHooks::on_message) and no-ops everything else; the default
/// when the caller has no further lifecycle integration to offer.
#[derive(Debug, Default)]
pub struct NullHooks;

impl ManagerHooks for NullHooks {}

/// Factory and cache for [`BuildContext`]s.
///
/// Holds one process-wide entry per state file, as a [`Weak`] reference: while a
/// [`BuildContext`] (or another clone of the `Arc`) is alive the same state is reused;
/// once the last reference drops, the entry is free to be collected and the state is
/// reloaded from disk on the next `new_context` call.
pub struct Manager {
    state_dir: PathBuf,
    hooks: Arc<dyn ManagerHooks>,
    cache: Mutex<HashMap<PathBuf, Weak<Mutex<BuildState>>>>,
}

impl Manager {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self::with_hooks(state_dir, Arc::new(NullHooks))
    }

    pub fn with_hooks(state_dir: impl Into<PathBuf>, hooks: Arc<dyn ManagerHooks>) -> Self {
        Self { state_dir: state_dir.into(), hooks, cache: Mutex::new(HashMap::new()) }
    }

    fn state_file_path(&self, output_dir: &Path, builder_id: &str) -> PathBuf {
        let output_digest = hex_digest(&Digester::of_bytes(output_dir.to_string_lossy().as_bytes()));
        let builder_digest = hex_digest(&Digester::of_bytes(builder_id.as_bytes()));
        self.state_dir.join(format!("{output_digest}-{builder_digest}.ser"))
    }

    /// Opens a new [`BuildContext`] for `output_dir`, identified by `builder_id`.
    ///
    /// `output_dir` is canonicalized before use so the same directory reached through
    /// different symlinks or relative paths maps to the same cache entry.
    #[instrument(skip_all, fields(builder_id = %builder_id))]
    pub fn new_context(self: &Arc<Self>, output_dir: impl AsRef<Path>, builder_id: &str) -> Result<BuildContext> {
        let output_dir = path_utils::canonicalize(output_dir.as_ref())?;
        let state_path = self.state_file_path(&output_dir, builder_id);
        let full_build = self.hooks.is_full_build(&output_dir);

        let state = self.load_cached_or_fresh(&state_path, full_build)?;
        Ok(BuildContext::open(state, output_dir, full_build, Arc::clone(&self.hooks), Arc::clone(self)))
    }

    fn load_cached_or_fresh(&self, state_path: &Path, force_full: bool) -> Result<Arc<Mutex<BuildState>>> {
        let mut cache = self.cache.lock().expect("build state cache poisoned");
        if let Some(existing) = cache.get(state_path).and_then(Weak::upgrade) {
            debug!(path = %state_path.display(), "reusing cached build state");
            return Ok(existing);
        }

        let state = if force_full {
            BuildState::empty(state_path.to_path_buf())
        } else {
            let (state, decode_err) = BuildState::load_or_empty(state_path.to_path_buf());
            if let Some(err) = decode_err {
                warn!(path = %state_path.display(), error = %err, "discarding unreadable build state");
            }
            state
        };

        let state = Arc::new(Mutex::new(state));
        cache.insert(state_path.to_path_buf(), Arc::downgrade(&state));
        Ok(state)
    }

    /// Evicts `state`'s entry from the cache and deletes its state file.
    ///
    /// Called when a [`BuildContext`] is closed without having committed: its state
    /// must not be trusted for the next build.
    pub fn destroy(&self, state: &Mutex<BuildState>) -> Result<()> {
        let guard = state.lock().expect("build state poisoned");
        let state_path = guard.state_path().to_path_buf();
        drop(guard);

        self.cache.lock().expect("build state cache poisoned").remove(&state_path);
        path_utils::remove_file_if_exists(&state_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_new_context_reuses_cached_state_while_alive() {
        let dir = tempfile::tempdir().unwrap();
        let out_dir = dir.path().join("out");
        std::fs::create_dir_all(&out_dir).unwrap();
        let manager = Arc::new(Manager::new(dir.path().join("state")));

        let ctx1 = manager.new_context(&out_dir, "builder-a").unwrap();
        let state_ptr_1 = Arc::as_ptr(ctx1.state_handle());
        let ctx2 = manager.new_context(&out_dir, "builder-a").unwrap();
        let state_ptr_2 = Arc::as_ptr(ctx2.state_handle());

        assert_eq!(state_ptr_1, state_ptr_2);
    }

    #[test]
    fn different_builder_ids_get_distinct_state() {
        let dir = tempfile::tempdir().unwrap();
        let out_dir = dir.path().join("out");
        std::fs::create_dir_all(&out_dir).unwrap();
        let manager = Arc::new(Manager::new(dir.path().join("state")));

        let ctx1 = manager.new_context(&out_dir, "builder-a").unwrap();
        let ctx2 = manager.new_context(&out_dir, "builder-b").unwrap();
        assert_ne!(Arc::as_ptr(ctx1.state_handle()), Arc::as_ptr(ctx2.state_handle()));
    }
}
