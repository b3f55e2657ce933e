//! Error types for the watch engine.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors from watcher construction and operation.
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("Failed to initialize watcher: {reason}")]
    InitFailed { reason: String },

    #[error("Invalid watch options: {reason}")]
    InvalidOptions { reason: String },

    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Cannot watch path {path}: {reason}")]
    PathWatchFailed { path: PathBuf, reason: String },

    #[error("File system error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Native watch backend error: {0}")]
    Notify(#[from] notify::Error),

    #[error("Failed to launch change service for {root}: {reason}")]
    LaunchFailed { root: PathBuf, reason: String },

    #[error("Lost connection to change service for {root}, reconnect failed: {reason}")]
    ConnectionLost { root: PathBuf, reason: String },

    #[error("Failed to load config: {reason}")]
    ConfigError { reason: String },

    #[error("Watcher task failed: {reason}")]
    TaskFailed { reason: String },

    #[error("Watcher is closed")]
    Closed,
}

impl WatchError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        WatchError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        WatchError::InvalidOptions {
            reason: reason.into(),
        }
    }
}

impl From<globset::Error> for WatchError {
    fn from(e: globset::Error) -> Self {
        WatchError::InvalidPattern {
            pattern: e.glob().unwrap_or_default().to_string(),
            reason: e.kind().to_string(),
        }
    }
}

impl From<toml::de::Error> for WatchError {
    fn from(e: toml::de::Error) -> Self {
        WatchError::ConfigError {
            reason: e.to_string(),
        }
    }
}
