//! Directory-tree watching for treewatch
//!
//! This crate turns three very different sources of change notifications into
//! one stream of debounced `add` / `change` / `delete` events:
//! - Native OS notifications, one non-recursive watch per directory
//! - Polling with periodic snapshot diffs
//! - An external process speaking a line protocol
//! - A caller-supplied [`Backend`] built by a [`BackendFactory`]
//!
//! Paths are filtered by include globs, ignore rules (globs, regexes,
//! predicates and gitignore files) and a dotfile policy. Every event path is
//! relative to the watch root.

pub mod backend;
pub mod client;
pub mod connection;
pub mod debounce;
pub mod emitter;
pub mod error;
pub mod event;
pub mod matcher;
pub mod options;
pub mod platform;
pub mod registry;
pub mod walker;
mod watcher;

pub use backend::{Backend, BackendFactory};
pub use connection::{CommandLauncher, Connection, ConnectionManager, Launcher, ServiceMessage};
pub use emitter::{Emitter, Handler, HandlerId, WatcherState};
pub use error::WatchError;
pub use event::{ChangeEvent, ChangeKind, EventName, WatchEvent};
pub use matcher::{IgnoreRule, PathMatcher};
pub use options::{BackendKind, WatchConfig, WatchOptions};
pub use watcher::Watcher;

/// Shorthand for [`Watcher::new`]
pub fn watch(root: impl AsRef<std::path::Path>, options: WatchOptions) -> Result<Watcher, WatchError> {
    Watcher::new(root, options)
}
