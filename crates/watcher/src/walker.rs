//! Recursive directory discovery
//!
//! The traversal itself runs on the blocking pool with `walkdir`; entries are
//! handed back over a channel so callers consume them on their own task, one
//! at a time, and can mutate their state without locking.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Entries buffered between the walking thread and the consumer
const WALK_BUFFER: usize = 256;

/// Predicate naming directories whose contents are not traversed
pub type DirFilter = Arc<dyn Fn(&Path) -> bool + Send + Sync>;

/// One discovered entry
#[derive(Debug)]
pub enum WalkEntry {
    Dir(PathBuf),
    File(PathBuf),
    /// An entry that could not be read for a reason other than vanishing
    Failed(PathBuf, io::Error),
}

/// Configures a traversal below `root`
pub struct Walker {
    root: PathBuf,
    follow_links: bool,
    skip: Option<DirFilter>,
}

impl Walker {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            follow_links: false,
            skip: None,
        }
    }

    pub fn follow_links(mut self, follow: bool) -> Self {
        self.follow_links = follow;
        self
    }

    /// Skip directories (and everything under them) for which `skip` is
    /// true. The root is always traversed.
    pub fn skip_dir<F>(mut self, skip: F) -> Self
    where
        F: Fn(&Path) -> bool + Send + Sync + 'static,
    {
        self.skip = Some(Arc::new(skip));
        self
    }

    /// Start the traversal. The root itself is not yielded.
    pub fn walk(self) -> WalkStream {
        let (tx, rx) = mpsc::channel(WALK_BUFFER);
        let Walker {
            root,
            follow_links,
            skip,
        } = self;

        tokio::task::spawn_blocking(move || {
            let walk = WalkDir::new(&root)
                .follow_links(follow_links)
                .min_depth(1)
                .into_iter()
                .filter_entry(|entry| {
                    if !entry.file_type().is_dir() {
                        return true;
                    }
                    match &skip {
                        Some(skip) => !skip(entry.path()),
                        None => true,
                    }
                });

            for entry in walk {
                let item = match entry {
                    Ok(entry) if entry.file_type().is_dir() => {
                        WalkEntry::Dir(entry.into_path())
                    }
                    Ok(entry) => WalkEntry::File(entry.into_path()),
                    Err(e) => {
                        let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.clone());
                        match e.into_io_error() {
                            Some(io) if io.kind() == io::ErrorKind::NotFound => {
                                // Raced with a deletion: zero children
                                debug!("walk: {} vanished", path.display());
                                continue;
                            }
                            Some(io) => WalkEntry::Failed(path, io),
                            None => {
                                warn!("walk: symlink loop at {}", path.display());
                                continue;
                            }
                        }
                    }
                };
                if tx.blocking_send(item).is_err() {
                    // Consumer went away
                    return;
                }
            }
        });

        WalkStream { rx }
    }
}

/// Lazily consumed traversal; `None` marks completion
pub struct WalkStream {
    rx: mpsc::Receiver<WalkEntry>,
}

impl WalkStream {
    pub async fn next(&mut self) -> Option<WalkEntry> {
        self.rx.recv().await
    }
}

/// Callback-style traversal. Completion of the returned future is the single
/// "done" signal. Returns the errors met along the way.
pub async fn walk<D, F>(root: &Path, mut on_dir: D, mut on_file: F) -> Vec<(PathBuf, io::Error)>
where
    D: FnMut(&Path),
    F: FnMut(&Path),
{
    let mut errors = Vec::new();
    let mut stream = Walker::new(root).walk();
    while let Some(entry) = stream.next().await {
        match entry {
            WalkEntry::Dir(path) => on_dir(&path),
            WalkEntry::File(path) => on_file(&path),
            WalkEntry::Failed(path, e) => errors.push((path, e)),
        }
    }
    errors
}
