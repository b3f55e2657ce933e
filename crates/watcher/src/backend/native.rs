//! Native OS notifications
//!
//! Every directory below the root gets its own non-recursive `notify` watch,
//! so the watched set follows the tree as it is mutated. Raw events are
//! forwarded from the notify thread over a channel into a single event-loop
//! task that owns the [`Registry`] and classifies each event:
//!
//! - path vanished: forget it, drop watches below it, `Delete` if it was known
//! - new directory: watch it, announce it, then walk it and announce its contents
//! - known file: `Change`
//! - unknown file passing the filter: `Add`
//!
//! Notifications that do not name the affected child (`Any`/`Other` events on
//! a watched directory, or a rescan request) fall back to scanning the
//! directory's known children: the first one that no longer exists is taken as
//! the deleted entry, otherwise the most recently modified one as the changed
//! entry. This guess is best-effort and can pick the wrong sibling.

use super::{sleep_until, stat, Backend, Dispatcher};
use crate::emitter::Emitter;
use crate::error::WatchError;
use crate::event::ChangeKind;
use crate::matcher::PathMatcher;
use crate::options::{BackendKind, WatchOptions};
use crate::registry::{Registry, WatchedDirs};
use crate::walker::{WalkEntry, Walker};
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use parking_lot::Mutex;
use std::fs::Metadata;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

type RawEvent = notify::Result<notify::Event>;

/// Device, inode and birth time of a watched directory
type DirId = (u64, u64, Option<SystemTime>);

#[cfg(unix)]
fn dir_id(metadata: &Metadata) -> Option<DirId> {
    use std::os::unix::fs::MetadataExt;
    Some((metadata.dev(), metadata.ino(), metadata.created().ok()))
}

#[cfg(not(unix))]
fn dir_id(_metadata: &Metadata) -> Option<DirId> {
    None
}

/// The OS watch handle plus the directories it currently covers
struct Watches {
    watcher: Option<RecommendedWatcher>,
    dirs: WatchedDirs,
    ids: HashMap<PathBuf, DirId>,
}

impl Watches {
    fn new() -> Self {
        Self {
            watcher: None,
            dirs: WatchedDirs::new(),
            ids: HashMap::new(),
        }
    }

    /// Watch `dir` unless already watched. Returns whether a watch was added.
    fn watch(&mut self, dir: &Path) -> notify::Result<bool> {
        let Some(watcher) = self.watcher.as_mut() else {
            return Ok(false);
        };
        if self.dirs.contains(dir) {
            return Ok(false);
        }
        watcher.watch(dir, RecursiveMode::NonRecursive)?;
        self.dirs.insert(dir.to_path_buf());
        if let Some(id) = std::fs::metadata(dir).ok().as_ref().and_then(dir_id) {
            self.ids.insert(dir.to_path_buf(), id);
        }
        Ok(true)
    }

    /// Re-issue the OS watch for an already watched `dir`
    fn refresh(&mut self, dir: &Path) -> notify::Result<()> {
        match self.watcher.as_mut() {
            Some(watcher) if self.dirs.contains(dir) => {
                watcher.watch(dir, RecursiveMode::NonRecursive)
            }
            _ => Ok(()),
        }
    }

    fn is_watched(&self, dir: &Path) -> bool {
        self.dirs.contains(dir)
    }

    /// Whether the directory now at `dir` is not the one the watch was put
    /// on. Without inode identity, a removal notification decides.
    fn replaced(&self, dir: &Path, metadata: &Metadata, removal: bool) -> bool {
        if !self.dirs.contains(dir) {
            return false;
        }
        match (self.ids.get(dir), dir_id(metadata)) {
            (Some(old), Some(new)) => *old != new,
            _ => removal,
        }
    }

    /// Stop watching `dir` and everything below it
    fn unwatch_tree(&mut self, dir: &Path) {
        for removed in self.dirs.remove_tree(dir) {
            self.ids.remove(&removed);
            if let Some(watcher) = self.watcher.as_mut() {
                // The OS usually dropped the watch along with the directory
                let _ = watcher.unwatch(&removed);
            }
            trace!("unwatched {}", removed.display());
        }
    }

    /// Drop every watch and the handle itself
    fn release(&mut self) -> usize {
        let dirs = self.dirs.drain();
        self.ids.clear();
        if let Some(mut watcher) = self.watcher.take() {
            for dir in &dirs {
                let _ = watcher.unwatch(dir);
            }
        }
        dirs.len()
    }
}

/// Per-directory OS watches with registry-based classification
pub struct NativeBackend {
    root: Arc<Path>,
    matcher: Arc<PathMatcher>,
    emitter: Arc<Emitter>,
    debounce: Duration,
    ready_delay: Duration,
    follow_links: bool,
    watches: Arc<Mutex<Watches>>,
    task: Option<JoinHandle<()>>,
}

impl NativeBackend {
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
            debounce: options.debounce_for(BackendKind::Native),
            ready_delay: options.ready_delay_for(BackendKind::Native),
            follow_links: options.follow_links,
            watches: Arc::new(Mutex::new(Watches::new())),
            task: None,
        }
    }

    /// Number of directories holding an active OS watch
    pub fn watched_dirs(&self) -> usize {
        self.watches.lock().dirs.len()
    }
}

impl Backend for NativeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    fn start(&mut self) -> Result<(), WatchError> {
        if self.task.is_some() {
            return Err(WatchError::InitFailed {
                reason: "native backend already started".to_string(),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel::<RawEvent>();
        let watcher = notify::recommended_watcher(move |res: RawEvent| {
            let _ = tx.send(res);
        })?;

        {
            let mut watches = self.watches.lock();
            watches.watcher = Some(watcher);
            watches
                .watch(&self.root)
                .map_err(|e| WatchError::PathWatchFailed {
                    path: self.root.to_path_buf(),
                    reason: e.to_string(),
                })?;
        }

        let event_loop = EventLoop {
            matcher: self.matcher.clone(),
            registry: Registry::new(self.root.to_path_buf(), self.matcher.clone()),
            dispatcher: Dispatcher::new(self.root.clone(), self.emitter.clone(), self.debounce),
            watches: self.watches.clone(),
            follow_links: self.follow_links,
            ready_delay: self.ready_delay,
        };
        self.task = Some(tokio::spawn(event_loop.run(rx)));
        Ok(())
    }

    fn emitter(&self) -> &Arc<Emitter> {
        &self.emitter
    }

    fn close(&mut self) -> bool {
        let closed = self.emitter.close();
        let released = self.watches.lock().release();
        if let Some(task) = &self.task {
            task.abort();
        }
        if closed {
            debug!("native watcher on {} closed, released {} watches", self.root.display(), released);
        }
        closed
    }

    fn take_task(&mut self) -> Option<JoinHandle<()>> {
        self.task.take()
    }
}

struct EventLoop {
    matcher: Arc<PathMatcher>,
    registry: Registry,
    dispatcher: Dispatcher,
    watches: Arc<Mutex<Watches>>,
    follow_links: bool,
    ready_delay: Duration,
}

impl EventLoop {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<RawEvent>) {
        let root = self.dispatcher.root().to_path_buf();
        self.registry.register_dir(&root);
        self.discover(&root, false).await;
        if self.dispatcher.is_closed() {
            return;
        }

        info!(
            "Watching {} ({} directories, {} entries)",
            root.display(),
            self.watches.lock().dirs.len(),
            self.registry.len()
        );
        self.dispatcher.ready_after(self.ready_delay);

        loop {
            let deadline = self.dispatcher.next_deadline();
            tokio::select! {
                raw = rx.recv() => match raw {
                    Some(Ok(event)) => self.handle(event).await,
                    Some(Err(e)) => {
                        warn!("native watch error: {}", e);
                        self.dispatcher.error(e.into());
                    }
                    // Watch handle released
                    None => break,
                },
                _ = sleep_until(deadline) => self.dispatcher.flush(Instant::now()),
            }
            if self.dispatcher.is_closed() {
                break;
            }
        }
        self.dispatcher.cancel();
    }

    async fn handle(&mut self, event: notify::Event) {
        if matches!(event.kind, EventKind::Access(_)) {
            return;
        }
        trace!("raw event {:?} {:?}", event.kind, event.paths);

        let root = self.dispatcher.root().to_path_buf();
        if event.need_rescan() {
            let dirs: Vec<PathBuf> = if event.paths.is_empty() {
                vec![root]
            } else {
                event.paths.clone()
            };
            for dir in dirs {
                self.guess_and_normalize(&dir).await;
            }
            return;
        }

        let unnamed = matches!(event.kind, EventKind::Any | EventKind::Other);
        let removal = matches!(
            event.kind,
            EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(RenameMode::From))
        );
        for path in event.paths {
            if self.dispatcher.is_closed() {
                return;
            }
            if path == root {
                if unnamed {
                    self.guess_and_normalize(&path).await;
                }
                continue;
            }
            if unnamed && self.watches.lock().is_watched(&path) {
                self.guess_and_normalize(&path).await;
                continue;
            }
            self.normalize(path, removal).await;
        }
    }

    async fn guess_and_normalize(&mut self, dir: &Path) {
        match self.guess(dir).await {
            Some(path) => self.normalize(path, false).await,
            None => trace!("no candidate for unnamed event in {}", dir.display()),
        }
    }

    /// Pick the child of `dir` an unnamed notification most likely refers to
    async fn guess(&self, dir: &Path) -> Option<PathBuf> {
        let mut newest: Option<(SystemTime, PathBuf)> = None;
        for child in self.registry.children(dir) {
            match stat(&child).await {
                Ok(None) => return Some(child),
                Ok(Some(metadata)) => {
                    let Ok(mtime) = metadata.modified() else {
                        continue;
                    };
                    if newest.as_ref().map(|(t, _)| mtime > *t).unwrap_or(true) {
                        newest = Some((mtime, child));
                    }
                }
                Err(_) => continue,
            }
        }
        newest.map(|(_, path)| path)
    }

    /// Classify one path from its current state. `removal` marks paths a
    /// remove or rename-away notification named.
    async fn normalize(&mut self, path: PathBuf, removal: bool) {
        let Some(relative) = self.dispatcher.relative(&path) else {
            return;
        };
        if relative.as_os_str().is_empty() {
            return;
        }

        match stat(&path).await {
            Ok(None) => self.vanished(&path, relative),
            Err(e) => {
                debug!("stat {} failed: {}", path.display(), e);
                self.dispatcher.error(WatchError::io(path, e));
            }
            Ok(Some(metadata)) if metadata.is_dir() => {
                let replaced = self.watches.lock().replaced(&path, &metadata, removal);
                if replaced {
                    // Deleted and recreated before we got here; the old
                    // watch died with the old directory
                    debug!("{} was replaced", path.display());
                    self.vanished(&path, relative.clone());
                } else if removal {
                    self.refresh_watch(&path);
                }
                self.appeared_dir(&path, relative, metadata).await;
            }
            Ok(Some(metadata)) => {
                if self.registry.registered(&path) {
                    self.dispatcher
                        .schedule(ChangeKind::Change, relative, Some(metadata));
                } else if self.registry.register(&path) {
                    self.dispatcher.schedule(ChangeKind::Add, relative, Some(metadata));
                }
            }
        }
    }

    fn vanished(&mut self, path: &Path, relative: PathBuf) {
        let known = self.registry.registered(path);
        self.registry.unregister(path);
        self.registry.unregister_dir(path);
        self.watches.lock().unwatch_tree(path);
        if known {
            self.dispatcher.schedule(ChangeKind::Delete, relative, None);
        }
    }

    async fn appeared_dir(&mut self, path: &Path, relative: PathBuf, metadata: Metadata) {
        if self.matcher.ignored_as(&relative, true) {
            return;
        }
        if !self.watch_dir(path) {
            return;
        }
        self.registry.register_dir(path);
        if self.matcher.included_as(&relative, true) {
            self.dispatcher.schedule(ChangeKind::Add, relative, Some(metadata));
        }
        // Entries created before the watch was in place
        self.discover(path, true).await;
    }

    fn watch_dir(&self, dir: &Path) -> bool {
        let result = self.watches.lock().watch(dir);
        match result {
            Ok(added) => added,
            Err(e) => {
                self.watch_failed(dir, e);
                false
            }
        }
    }

    fn refresh_watch(&self, dir: &Path) {
        let result = self.watches.lock().refresh(dir);
        if let Err(e) = result {
            self.watch_failed(dir, e);
        }
    }

    fn watch_failed(&self, dir: &Path, e: notify::Error) {
        let vanished = match &e.kind {
            notify::ErrorKind::PathNotFound => true,
            notify::ErrorKind::Io(io) => io.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        };
        if vanished {
            debug!("{} vanished before it could be watched", dir.display());
        } else {
            warn!("Failed to watch {}: {}", dir.display(), e);
            self.dispatcher.error(WatchError::PathWatchFailed {
                path: dir.to_path_buf(),
                reason: e.to_string(),
            });
        }
    }

    /// Walk `dir`, watching and registering everything below it. With
    /// `announce`, newly watched directories and newly registered files are
    /// emitted as adds.
    async fn discover(&mut self, dir: &Path, announce: bool) {
        let root = self.dispatcher.root().clone();
        let matcher = self.matcher.clone();

        let mut stream = Walker::new(dir)
            .follow_links(self.follow_links)
            .skip_dir(move |path| match path.strip_prefix(&root) {
                Ok(relative) => matcher.ignored_as(relative, true),
                Err(_) => false,
            })
            .walk();

        while let Some(entry) = stream.next().await {
            if self.dispatcher.is_closed() {
                return;
            }
            match entry {
                WalkEntry::Dir(path) => {
                    if !self.watch_dir(&path) {
                        continue;
                    }
                    self.registry.register_dir(&path);
                    if announce {
                        self.announce(&path, true).await;
                    }
                }
                WalkEntry::File(path) => {
                    if self.registry.register(&path) && announce {
                        self.announce(&path, false).await;
                    }
                }
                WalkEntry::Failed(path, e) => {
                    warn!("Failed to read {}: {}", path.display(), e);
                    self.dispatcher.error(WatchError::io(path, e));
                }
            }
        }
    }

    async fn announce(&mut self, path: &Path, is_dir: bool) {
        let Some(relative) = self.dispatcher.relative(path) else {
            return;
        };
        if is_dir && !self.matcher.included_as(&relative, true) {
            return;
        }
        match stat(path).await {
            Ok(Some(metadata)) => self.dispatcher.schedule(ChangeKind::Add, relative, Some(metadata)),
            Ok(None) => self.vanished(path, relative),
            Err(e) => self.dispatcher.error(WatchError::io(path, e)),
        }
    }
}
