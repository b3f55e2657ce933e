//! Bookkeeping of known paths and watched directories
//!
//! The registry maps each parent directory to the child names known to exist
//! and pass the include filter. It only exists to classify raw events: a path
//! seen before is a change, a path never seen is an add, and a vanished path is
//! a delete only if it was seen.

use crate::matcher::PathMatcher;
use std::collections::{HashMap, HashSet};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Directory -> known child names, with the include filter as gatekeeper
#[derive(Debug)]
pub struct Registry {
    root: PathBuf,
    matcher: Arc<PathMatcher>,
    entries: HashMap<PathBuf, HashSet<OsString>>,
}

impl Registry {
    pub fn new(root: impl Into<PathBuf>, matcher: Arc<PathMatcher>) -> Self {
        Self {
            root: root.into(),
            matcher,
            entries: HashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Relative form of an absolute path below the root
    pub fn relative<'a>(&self, path: &'a Path) -> Option<&'a Path> {
        path.strip_prefix(&self.root).ok()
    }

    /// Track a file. Returns true only if it passes the filter and was not
    /// already tracked.
    pub fn register(&mut self, path: &Path) -> bool {
        self.register_entry(path, false)
    }

    /// Track a directory as a child of its parent, subject to the same filter
    pub fn register_dir(&mut self, path: &Path) -> bool {
        self.register_entry(path, true)
    }

    fn register_entry(&mut self, path: &Path, is_dir: bool) -> bool {
        if path == self.root {
            // The root is exempt from filtering
            return self.entries.insert(path.to_path_buf(), HashSet::new()).is_none();
        }

        let Some(relative) = self.relative(path) else {
            return false;
        };
        if !self.matcher.included_as(relative, is_dir) {
            return false;
        }

        let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
            return false;
        };
        self.entries
            .entry(parent.to_path_buf())
            .or_default()
            .insert(name.to_os_string())
    }

    /// Known either as a directory key or as a tracked child of its parent
    pub fn registered(&self, path: &Path) -> bool {
        if self.entries.contains_key(path) {
            return true;
        }
        match (path.parent(), path.file_name()) {
            (Some(parent), Some(name)) => self
                .entries
                .get(parent)
                .map(|children| children.contains(name))
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Forget a path as a child of its parent
    pub fn unregister(&mut self, path: &Path) -> bool {
        match (path.parent(), path.file_name()) {
            (Some(parent), Some(name)) => self
                .entries
                .get_mut(parent)
                .map(|children| children.remove(name))
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Drop a directory entry together with every entry below it
    pub fn unregister_dir(&mut self, dir: &Path) {
        self.entries.retain(|key, _| !key.starts_with(dir));
    }

    /// Absolute paths of the known children of `dir`
    pub fn children(&self, dir: &Path) -> Vec<PathBuf> {
        self.entries
            .get(dir)
            .map(|children| children.iter().map(|name| dir.join(name)).collect())
            .unwrap_or_default()
    }

    /// Total tracked child names
    pub fn len(&self) -> usize {
        self.entries.values().map(|c| c.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// The set of directories holding an active OS watch
#[derive(Debug, Default)]
pub struct WatchedDirs {
    dirs: HashSet<PathBuf>,
}

impl WatchedDirs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a directory. Returns false if it was already watched.
    pub fn insert(&mut self, dir: PathBuf) -> bool {
        self.dirs.insert(dir)
    }

    pub fn contains(&self, dir: &Path) -> bool {
        self.dirs.contains(dir)
    }

    /// Remove `dir` and every watched directory below it, returning them
    pub fn remove_tree(&mut self, dir: &Path) -> Vec<PathBuf> {
        let removed: Vec<PathBuf> = self
            .dirs
            .iter()
            .filter(|d| d.starts_with(dir))
            .cloned()
            .collect();
        for d in &removed {
            self.dirs.remove(d);
        }
        removed
    }

    /// Empty the set, returning everything that was in it
    pub fn drain(&mut self) -> Vec<PathBuf> {
        self.dirs.drain().collect()
    }

    pub fn len(&self) -> usize {
        self.dirs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty()
    }
}
