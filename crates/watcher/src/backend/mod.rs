//! Event sources
//!
//! Every backend turns its own kind of raw notification into [`ChangeEvent`]s
//! and publishes them through a shared [`Emitter`]. The facade only sees the
//! [`Backend`] trait.

pub mod external;
pub mod native;
pub mod poll;

use crate::debounce::Debouncer;
use crate::emitter::{Emitter, Handler, HandlerId, WatcherState};
use crate::error::WatchError;
use crate::event::{event_key, ChangeEvent, ChangeKind, EventName};
use crate::matcher::PathMatcher;
use crate::options::BackendKind;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::trace;

pub use external::ExternalBackend;
pub use native::NativeBackend;
pub use poll::PollBackend;

/// Capability set shared by every event source
pub trait Backend: Send {
    fn kind(&self) -> BackendKind;

    /// Begin watching. Must be called from within a Tokio runtime.
    fn start(&mut self) -> Result<(), WatchError>;

    fn emitter(&self) -> &Arc<Emitter>;

    fn on(&self, name: EventName, handler: Handler) -> HandlerId {
        self.emitter().on(name, move |event| handler(event))
    }

    /// Release every resource synchronously. Returns true only for the call
    /// that actually closed.
    fn close(&mut self) -> bool;

    /// Background task driving this backend, if still owned
    fn take_task(&mut self) -> Option<JoinHandle<()>>;
}

/// Builds a caller-supplied backend for the canonical root.
///
/// The backend publishes through the given emitter and is started by the
/// watcher right after construction.
pub type BackendFactory = Arc<
    dyn Fn(Arc<Path>, Arc<PathMatcher>, Arc<Emitter>) -> Result<Box<dyn Backend>, WatchError>
        + Send
        + Sync,
>;

/// Debounce + ready bookkeeping owned by a backend's event loop
pub(crate) struct Dispatcher {
    root: Arc<Path>,
    emitter: Arc<Emitter>,
    debouncer: Debouncer<String, ChangeEvent>,
    ready_at: Option<Instant>,
}

impl Dispatcher {
    pub(crate) fn new(root: Arc<Path>, emitter: Arc<Emitter>, delay: Duration) -> Self {
        Self {
            root,
            emitter,
            debouncer: Debouncer::new(delay),
            ready_at: None,
        }
    }

    pub(crate) fn root(&self) -> &Arc<Path> {
        &self.root
    }

    pub(crate) fn emitter(&self) -> &Arc<Emitter> {
        &self.emitter
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.emitter.state() == WatcherState::Closed
    }

    /// Path relative to the root, if it lies below it
    pub(crate) fn relative(&self, path: &Path) -> Option<PathBuf> {
        path.strip_prefix(&self.root).ok().map(Path::to_path_buf)
    }

    /// Queue a change under its `<kind>:<path>` key.
    ///
    /// A change for a path whose add is still pending is dropped: creating a
    /// file usually produces a modify notification right behind the create.
    pub(crate) fn schedule(&mut self, kind: ChangeKind, path: PathBuf, stat: Option<Metadata>) {
        if kind == ChangeKind::Change && self.debouncer.is_pending(&event_key(ChangeKind::Add, &path)) {
            trace!("change for {} shadowed by pending add", path.display());
            return;
        }
        let event = ChangeEvent::new(kind, path, self.root.clone(), stat);
        self.debouncer.schedule(event.key(), event);
    }

    /// Fire `ready` once `delay` has passed
    pub(crate) fn ready_after(&mut self, delay: Duration) {
        if self.emitter.state() != WatcherState::Initializing {
            return;
        }
        if delay.is_zero() {
            self.emitter.emit_ready();
        } else {
            self.ready_at = Some(Instant::now() + delay);
        }
    }

    pub(crate) fn error(&self, error: WatchError) {
        self.emitter.emit_error(error);
    }

    /// Earliest moment something becomes due
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        match (self.ready_at, self.debouncer.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Emit whatever is due at `now`
    pub(crate) fn flush(&mut self, now: Instant) {
        if let Some(at) = self.ready_at {
            if at <= now {
                self.ready_at = None;
                self.emitter.emit_ready();
            }
        }
        for event in self.debouncer.take_ready(now) {
            self.emitter.emit_change(event);
        }
    }

    /// Drop pending timers
    pub(crate) fn cancel(&mut self) {
        self.debouncer.cancel_all();
        self.ready_at = None;
    }
}

/// Sleep until `deadline`, or forever when there is none
pub(crate) async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Stat without following a final symlink. `Ok(None)` means not found.
pub(crate) async fn stat(path: &Path) -> std::io::Result<Option<Metadata>> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) => Ok(Some(metadata)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}
