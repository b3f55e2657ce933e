//! Polling backend
//!
//! Walks the tree on a fixed interval and diffs consecutive snapshots.
//! Works on filesystems where native notifications are unavailable (network
//! mounts, some containers) at the cost of latency and a full scan per tick.

use super::{sleep_until, Backend, Dispatcher};
use crate::emitter::Emitter;
use crate::error::WatchError;
use crate::event::ChangeKind;
use crate::matcher::PathMatcher;
use crate::options::{BackendKind, WatchOptions};
use crate::walker::{WalkEntry, Walker};
use std::collections::{HashMap, HashSet};
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Relative path -> metadata of every tracked entry
pub type Snapshot = HashMap<PathBuf, Metadata>;

/// Take a snapshot of `root`. Ignored directories are not descended into,
/// files are recorded only when included, directories always.
pub async fn snapshot(
    root: &Path,
    matcher: &Arc<PathMatcher>,
    follow_links: bool,
) -> (Snapshot, Vec<(PathBuf, std::io::Error)>) {
    let prune_root = root.to_path_buf();
    let prune_matcher = matcher.clone();

    let mut entries = Snapshot::new();
    let mut errors = Vec::new();
    let mut stream = Walker::new(root)
        .follow_links(follow_links)
        .skip_dir(move |path| match path.strip_prefix(&prune_root) {
            Ok(relative) => prune_matcher.ignored_as(relative, true),
            Err(_) => false,
        })
        .walk();

    while let Some(entry) = stream.next().await {
        let (path, is_dir) = match entry {
            WalkEntry::Dir(path) => (path, true),
            WalkEntry::File(path) => (path, false),
            WalkEntry::Failed(path, e) => {
                errors.push((path, e));
                continue;
            }
        };
        let Ok(relative) = path.strip_prefix(root) else {
            continue;
        };
        if !is_dir && !matcher.included_as(relative, false) {
            continue;
        }
        match tokio::fs::symlink_metadata(&path).await {
            Ok(metadata) => {
                entries.insert(relative.to_path_buf(), metadata);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => errors.push((path, e)),
        }
    }
    (entries, errors)
}

/// Changes between two snapshots, sorted by path within each kind.
/// Deletes come first, then adds, then changes.
pub fn diff(old: &Snapshot, new: &Snapshot) -> Vec<(ChangeKind, PathBuf, Option<Metadata>)> {
    let mut removed: Vec<&PathBuf> = old.keys().filter(|p| !new.contains_key(*p)).collect();
    let mut created: Vec<&PathBuf> = new.keys().filter(|p| !old.contains_key(*p)).collect();
    let mut changed: Vec<&PathBuf> = new
        .iter()
        .filter(|(path, after)| match old.get(*path) {
            Some(before) => modified(before, after),
            None => false,
        })
        .map(|(path, _)| path)
        .collect();
    removed.sort();
    created.sort();
    changed.sort();

    let mut changes = Vec::with_capacity(removed.len() + created.len() + changed.len());
    changes.extend(removed.into_iter().map(|p| (ChangeKind::Delete, p.clone(), None)));
    changes.extend(
        created
            .into_iter()
            .map(|p| (ChangeKind::Add, p.clone(), new.get(p).cloned())),
    );
    changes.extend(
        changed
            .into_iter()
            .map(|p| (ChangeKind::Change, p.clone(), new.get(p).cloned())),
    );
    changes
}

fn modified(before: &Metadata, after: &Metadata) -> bool {
    if before.is_dir() || after.is_dir() {
        return before.is_dir() != after.is_dir();
    }
    before.len() != after.len() || before.modified().ok() != after.modified().ok()
}

/// Interval-driven snapshot diffing
pub struct PollBackend {
    root: Arc<Path>,
    matcher: Arc<PathMatcher>,
    emitter: Arc<Emitter>,
    interval: Duration,
    debounce: Duration,
    ready_delay: Duration,
    follow_links: bool,
    task: Option<JoinHandle<()>>,
}

impl PollBackend {
    pub fn new(
        root: Arc<Path>,
        matcher: Arc<PathMatcher>,
        emitter: Arc<Emitter>,
        options: &WatchOptions,
    ) -> Self {
        Self {
            root,
            matcher,
            emitter,
            interval: options.interval,
            debounce: options.debounce_for(BackendKind::Poll),
            ready_delay: options.ready_delay_for(BackendKind::Poll),
            follow_links: options.follow_links,
            task: None,
        }
    }
}

impl Backend for PollBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Poll
    }

    fn start(&mut self) -> Result<(), WatchError> {
        if self.task.is_some() {
            return Err(WatchError::InitFailed {
                reason: "poll backend already started".to_string(),
            });
        }
        if self.interval.is_zero() {
            return Err(WatchError::invalid("poll interval must be non-zero"));
        }

        let poller = Poller {
            matcher: self.matcher.clone(),
            dispatcher: Dispatcher::new(self.root.clone(), self.emitter.clone(), self.debounce),
            interval: self.interval,
            ready_delay: self.ready_delay,
            follow_links: self.follow_links,
            reported: HashSet::new(),
        };
        self.task = Some(tokio::spawn(poller.run()));
        Ok(())
    }

    fn emitter(&self) -> &Arc<Emitter> {
        &self.emitter
    }

    fn close(&mut self) -> bool {
        let closed = self.emitter.close();
        if let Some(task) = &self.task {
            task.abort();
        }
        if closed {
            debug!("poll watcher on {} closed", self.root.display());
        }
        closed
    }

    fn take_task(&mut self) -> Option<JoinHandle<()>> {
        self.task.take()
    }
}

struct Poller {
    matcher: Arc<PathMatcher>,
    dispatcher: Dispatcher,
    interval: Duration,
    ready_delay: Duration,
    follow_links: bool,
    /// Failing paths already surfaced, so a persistent failure is reported once
    reported: HashSet<PathBuf>,
}

impl Poller {
    async fn run(mut self) {
        let mut current = self.scan().await;
        if self.dispatcher.is_closed() {
            return;
        }
        info!(
            "Polling {} every {:?} ({} entries)",
            self.dispatcher.root().display(),
            self.interval,
            current.len()
        );
        // mtime granularity can hide writes landing right after the first scan
        self.dispatcher.ready_after(self.ready_delay);

        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let deadline = self.dispatcher.next_deadline();
            tokio::select! {
                _ = ticker.tick() => {
                    let next = self.scan().await;
                    for (kind, path, metadata) in diff(&current, &next) {
                        self.dispatcher.schedule(kind, path, metadata);
                    }
                    current = next;
                }
                _ = sleep_until(deadline) => self.dispatcher.flush(Instant::now()),
            }
            if self.dispatcher.is_closed() {
                break;
            }
        }
        self.dispatcher.cancel();
    }

    /// Snapshot with directory entries that fail the include filter hidden
    async fn scan(&mut self) -> Snapshot {
        let root = self.dispatcher.root().to_path_buf();
        let (mut entries, errors) = snapshot(&root, &self.matcher, self.follow_links).await;

        let mut failing = HashSet::new();
        for (path, e) in errors {
            if !self.reported.contains(&path) {
                warn!("Failed to scan {}: {}", path.display(), e);
                self.dispatcher.error(WatchError::io(path.clone(), e));
            }
            failing.insert(path);
        }
        self.reported = failing;

        let matcher = &self.matcher;
        entries.retain(|path, metadata| !metadata.is_dir() || matcher.included_as(path, true));
        entries
    }
}
