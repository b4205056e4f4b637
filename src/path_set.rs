//! A selection of filesystem entries rooted at a base directory.
//!
//! Patterns use the `glob` crate's syntax (`*`, `**`, `?`, `[..]`). Relative paths are
//! always matched in posix form (`/` separators) so a `PathSet` built on one host
//! selects the same files when replayed on another.

use glob::Pattern;
use std::{
    hash::{Hash, Hasher},
    path::{Path, PathBuf},
};

/// A selection rooted at `base` with include/exclude glob predicates and
/// file/directory inclusion flags.
///
/// Equality and hashing are structural, over the literal pattern strings (not over
/// any compiled representation), so two `PathSet`s built from the same arguments
/// compare equal.
#[derive(Debug, Clone)]
pub struct PathSet {
    base: PathBuf,
    includes: Vec<String>,
    excludes: Vec<String>,
    include_files: bool,
    include_directories: bool,
    compiled_includes: Vec<Pattern>,
    compiled_excludes: Vec<Pattern>,
}

impl PathSet {
    /// Builds a new path set. An empty `includes` list means "match everything";
    /// an empty `excludes` list means "exclude nothing". Defaults for the two flags
    /// are `include_files = true`, `include_directories = false`, matching the
    /// spec's constructor defaults.
    pub fn new(
        base: impl Into<PathBuf>,
        includes: impl IntoIterator<Item = impl Into<String>>,
        excludes: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let includes: Vec<String> = includes.into_iter().map(Into::into).collect();
        let excludes: Vec<String> = excludes.into_iter().map(Into::into).collect();
        let compiled_includes = compile_patterns(&includes);
        let compiled_excludes = compile_patterns(&excludes);
        Self {
            base: base.into(),
            includes,
            excludes,
            include_files: true,
            include_directories: false,
            compiled_includes,
            compiled_excludes,
        }
    }

    pub fn with_include_files(mut self, include_files: bool) -> Self {
        self.include_files = include_files;
        self
    }

    pub fn with_include_directories(mut self, include_directories: bool) -> Self {
        self.include_directories = include_directories;
        self
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn include_files(&self) -> bool {
        self.include_files
    }

    pub fn include_directories(&self) -> bool {
        self.include_directories
    }

    pub fn includes(&self) -> &[String] {
        &self.includes
    }

    pub fn excludes(&self) -> &[String] {
        &self.excludes
    }

    /// `true` iff some include pattern matches (or the include list is empty) and no
    /// exclude pattern matches. `relative` must use `/` separators.
    pub fn is_selected(&self, relative: &str) -> bool {
        self.matches_includes(relative) && !self.matches_excludes(relative)
    }

    fn matches_includes(&self, relative: &str) -> bool {
        self.compiled_includes.is_empty()
            || self.compiled_includes.iter().any(|p| p.matches(relative))
    }

    fn matches_excludes(&self, relative: &str) -> bool {
        self.compiled_excludes.iter().any(|p| p.matches(relative))
    }

    /// Conservative affirmative: `true` if some include pattern *could* match a
    /// descendant of `relative`. Over-approximates (a `true` here just costs an
    /// unnecessary subtree walk; it never causes a selected file to be missed).
    ///
    /// Patterns are treated as matching a descendant if the pattern, restricted to
    /// the prefix made of as many of `relative`'s components as the pattern has
    /// fixed components for, is compatible — in practice this resolves to "the
    /// pattern contains a `**` component" or "the pattern has at least as many
    /// components as `relative` plus one, and the matching prefix doesn't fail".
    /// The empty include list (match-all) is always a "yes".
    pub fn is_ancestor_of_potentially_selected(&self, relative: &str) -> bool {
        if self.compiled_includes.is_empty() {
            return true;
        }
        self.includes.iter().any(|pattern| pattern_may_descend_into(pattern, relative))
    }
}

fn compile_patterns(patterns: &[String]) -> Vec<Pattern> {
    patterns.iter().map(|p| Pattern::new(p).unwrap_or_else(|_| Pattern::new("**").unwrap())).collect()
}

/// A pattern can still select something under `relative` if it contains a `**`
/// component (which can absorb any number of path segments), or if its own
/// component count exceeds the number of components already fixed by `relative`.
fn pattern_may_descend_into(pattern: &str, relative: &str) -> bool {
    if pattern.contains("**") {
        return true;
    }
    let pattern_components: Vec<&str> = pattern.split('/').collect();
    let relative_components: Vec<&str> = if relative.is_empty() {
        Vec::new()
    } else {
        relative.split('/').collect()
    };
    if pattern_components.len() <= relative_components.len() {
        return false;
    }
    pattern_components
        .iter()
        .zip(relative_components.iter())
        .all(|(p, r)| Pattern::new(p).map(|pat| pat.matches(r)).unwrap_or(true))
}

impl PartialEq for PathSet {
    fn eq(&self, other: &Self) -> bool {
        self.base == other.base
            && self.includes == other.includes
            && self.excludes == other.excludes
            && self.include_files == other.include_files
            && self.include_directories == other.include_directories
    }
}

impl Eq for PathSet {}

impl Hash for PathSet {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.base.hash(state);
        self.includes.hash(state);
        self.excludes.hash(state);
        self.include_files.hash(state);
        self.include_directories.hash(state);
    }
}
