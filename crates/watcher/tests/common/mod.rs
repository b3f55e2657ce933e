//! Common utilities for watcher integration tests

#![allow(dead_code)]

use anyhow::{anyhow, bail, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{timeout, Instant};
use treewatch::{ChangeEvent, ChangeKind, WatchEvent, Watcher};

/// How long to wait for an expected event
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Quiet period used to check that nothing else arrives
pub const SETTLE: Duration = Duration::from_millis(600);

/// Temporary tree: `file_0..9` plus `sub_0..9`, each holding `file_0..9`
pub struct Fixture {
    _dir: TempDir,
    root: PathBuf,
}

impl Fixture {
    pub fn new() -> Result<Self> {
        let dir = TempDir::new()?;
        let root = fs::canonicalize(dir.path())?;
        for i in 0..10 {
            fs::write(root.join(format!("file_{}", i)), format!("file {}", i))?;
            let sub = root.join(format!("sub_{}", i));
            fs::create_dir(&sub)?;
            for j in 0..10 {
                fs::write(sub.join(format!("file_{}", j)), format!("sub {} file {}", i, j))?;
            }
        }
        Ok(Self { _dir: dir, root })
    }

    /// Canonical root
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    pub fn write(&self, relative: &str, contents: &str) -> Result<()> {
        fs::write(self.path(relative), contents)?;
        Ok(())
    }
}

/// Buffers everything a watcher publishes
pub struct Recorder {
    rx: UnboundedReceiver<WatchEvent>,
}

impl Recorder {
    pub fn attach(watcher: &Watcher) -> Self {
        Self {
            rx: watcher.events(),
        }
    }

    /// Wait for `ready`, failing on anything else first except errors
    pub async fn ready(&mut self) -> Result<()> {
        let deadline = Instant::now() + EVENT_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, self.rx.recv()).await {
                Ok(Some(WatchEvent::Ready)) => return Ok(()),
                Ok(Some(WatchEvent::Change(event))) => {
                    bail!("change before ready: {} {}", event.kind, event.path.display())
                }
                Ok(Some(WatchEvent::Error(e))) => bail!("error before ready: {}", e),
                Ok(None) => bail!("watcher closed before ready"),
                Err(_) => bail!("timed out waiting for ready"),
            }
        }
    }

    /// Next change, skipping nothing
    pub async fn next_change(&mut self) -> Result<ChangeEvent> {
        match timeout(EVENT_TIMEOUT, self.rx.recv()).await {
            Ok(Some(WatchEvent::Change(event))) => Ok(event),
            Ok(Some(other)) => Err(anyhow!("expected a change, got {:?}", other)),
            Ok(None) => Err(anyhow!("watcher closed")),
            Err(_) => Err(anyhow!("timed out waiting for a change")),
        }
    }

    /// Wait for a change of `kind` on `path`, skipping other changes
    pub async fn expect(&mut self, kind: ChangeKind, path: &str) -> Result<ChangeEvent> {
        let deadline = Instant::now() + EVENT_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, self.rx.recv()).await {
                Ok(Some(WatchEvent::Change(event)))
                    if event.kind == kind && event.path == Path::new(path) =>
                {
                    return Ok(event)
                }
                Ok(Some(_)) => continue,
                Ok(None) => bail!("watcher closed waiting for {} {}", kind, path),
                Err(_) => bail!("timed out waiting for {} {}", kind, path),
            }
        }
    }

    /// Every change arriving within `window`
    pub async fn collect(&mut self, window: Duration) -> Vec<ChangeEvent> {
        let deadline = Instant::now() + window;
        let mut changes = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, self.rx.recv()).await {
                Ok(Some(WatchEvent::Change(event))) => changes.push(event),
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => return changes,
            }
        }
    }

    /// Next error event
    pub async fn error(&mut self) -> Result<String> {
        let deadline = Instant::now() + EVENT_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, self.rx.recv()).await {
                Ok(Some(WatchEvent::Error(e))) => return Ok(e.to_string()),
                Ok(Some(_)) => continue,
                Ok(None) => bail!("watcher closed waiting for an error"),
                Err(_) => bail!("timed out waiting for an error"),
            }
        }
    }

    /// True once the watcher has closed and the channel drained
    pub async fn is_closed(&mut self) -> bool {
        loop {
            match timeout(EVENT_TIMEOUT, self.rx.recv()).await {
                Ok(Some(_)) => continue,
                Ok(None) => return true,
                Err(_) => return false,
            }
        }
    }
}

/// Count of changes of `kind` on `path`
pub fn count(changes: &[ChangeEvent], kind: ChangeKind, path: &str) -> usize {
    changes
        .iter()
        .filter(|c| c.kind == kind && c.path == Path::new(path))
        .count()
}
