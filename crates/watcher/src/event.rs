//! Normalized change events shared by every backend

use crate::error::WatchError;
use std::fmt;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Classification of a change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    /// Path appeared
    Add,
    /// Existing path was modified
    Change,
    /// Path went away
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Add => "add",
            ChangeKind::Change => "change",
            ChangeKind::Delete => "delete",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified change below a watch root
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    /// Type of change
    pub kind: ChangeKind,
    /// Path relative to `root`
    pub path: PathBuf,
    /// The watch root this event belongs to
    pub root: Arc<Path>,
    /// Metadata at normalization time. Always `None` for deletes.
    pub stat: Option<Metadata>,
}

impl ChangeEvent {
    pub fn new(kind: ChangeKind, path: PathBuf, root: Arc<Path>, stat: Option<Metadata>) -> Self {
        let stat = match kind {
            ChangeKind::Delete => None,
            _ => stat,
        };
        Self {
            kind,
            path,
            root,
            stat,
        }
    }

    /// Debounce key: `<kind>:<relative path>`
    pub fn key(&self) -> String {
        event_key(self.kind, &self.path)
    }

    /// Absolute path of the changed entry
    pub fn absolute_path(&self) -> PathBuf {
        self.root.join(&self.path)
    }

    pub fn is_dir(&self) -> bool {
        self.stat.as_ref().map(|s| s.is_dir()).unwrap_or(false)
    }
}

pub(crate) fn event_key(kind: ChangeKind, path: &Path) -> String {
    format!("{}:{}", kind.as_str(), path.display())
}

/// Everything a watcher publishes
#[derive(Debug, Clone)]
pub enum WatchEvent {
    /// Initial discovery finished
    Ready,
    /// A classified add/change/delete
    Change(ChangeEvent),
    /// A non-fatal (or, for lost services, terminal) error
    Error(Arc<WatchError>),
}

/// Subscription keys for [`crate::Emitter::on`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    Ready,
    Change,
    Add,
    Delete,
    /// Every classified change, whatever its kind
    All,
    Error,
}

impl EventName {
    pub fn for_kind(kind: ChangeKind) -> Self {
        match kind {
            ChangeKind::Add => EventName::Add,
            ChangeKind::Change => EventName::Change,
            ChangeKind::Delete => EventName::Delete,
        }
    }
}
