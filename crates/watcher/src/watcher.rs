//! Public watcher handle

use crate::backend::{Backend, ExternalBackend, NativeBackend, PollBackend};
use crate::connection::ConnectionManager;
use crate::emitter::{Emitter, HandlerId, WatcherState};
use crate::error::WatchError;
use crate::event::{EventName, WatchEvent};
use crate::options::{BackendKind, WatchOptions};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

/// Watches one directory tree and publishes classified changes.
///
/// Events are delivered to handlers attached with [`Watcher::on`] or through
/// the channel returned by [`Watcher::events`]. Must be created inside a
/// Tokio runtime.
///
/// ```no_run
/// # async fn demo() -> Result<(), treewatch::WatchError> {
/// use treewatch::{EventName, WatchEvent, WatchOptions, Watcher};
///
/// let mut watcher = Watcher::new(".", WatchOptions::new().glob("**/*.rs"))?;
/// watcher.on(EventName::Change, |event| {
///     if let WatchEvent::Change(change) = event {
///         println!("{} changed", change.path.display());
///     }
/// });
/// watcher.ready().await?;
/// watcher.close();
/// # Ok(())
/// # }
/// ```
pub struct Watcher {
    root: Arc<Path>,
    emitter: Arc<Emitter>,
    backend: Box<dyn Backend>,
    persistent: bool,
}

impl Watcher {
    pub fn new(root: impl AsRef<Path>, options: WatchOptions) -> Result<Self, WatchError> {
        let kind = options.validate()?;
        tokio::runtime::Handle::try_current().map_err(|_| WatchError::InitFailed {
            reason: "a Tokio runtime is required".to_string(),
        })?;

        let root = root.as_ref();
        let canonical = std::fs::canonicalize(root).map_err(|e| WatchError::io(root, e))?;
        if !canonical.is_dir() {
            return Err(WatchError::invalid(format!(
                "{} is not a directory",
                canonical.display()
            )));
        }
        let root: Arc<Path> = Arc::from(canonical.as_path());
        let emitter = Arc::new(Emitter::new());

        let mut backend: Box<dyn Backend> = match kind {
            BackendKind::Native => Box::new(NativeBackend::new(
                root.clone(),
                Arc::new(options.matcher(&root)?),
                emitter.clone(),
                &options,
            )),
            BackendKind::Poll => Box::new(PollBackend::new(
                root.clone(),
                Arc::new(options.matcher(&root)?),
                emitter.clone(),
                &options,
            )),
            BackendKind::External => {
                let manager = match &options.connection {
                    Some(manager) => manager.clone(),
                    None => ConnectionManager::with_command(&options.external_command())?,
                };
                Box::new(ExternalBackend::new(
                    root.clone(),
                    emitter.clone(),
                    manager,
                    &options,
                ))
            }
            BackendKind::Custom => {
                let factory = options
                    .factory
                    .as_ref()
                    .ok_or_else(|| WatchError::invalid("custom backend requested without a factory"))?;
                factory(root.clone(), Arc::new(options.matcher(&root)?), emitter.clone())?
            }
        };
        backend.start()?;
        info!("Started {} watcher on {}", kind, root.display());

        Ok(Self {
            root,
            emitter,
            backend,
            persistent: options.persistent,
        })
    }

    /// Canonical watch root; event paths are relative to it
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn state(&self) -> WatcherState {
        self.emitter.state()
    }

    /// Attach a handler
    pub fn on<F>(&self, name: EventName, handler: F) -> HandlerId
    where
        F: Fn(&WatchEvent) + Send + Sync + 'static,
    {
        self.emitter.on(name, handler)
    }

    /// Detach a handler
    pub fn off(&self, id: HandlerId) -> bool {
        self.emitter.off(id)
    }

    /// Channel of ready, every change and errors. Closes with the watcher.
    pub fn events(&self) -> mpsc::UnboundedReceiver<WatchEvent> {
        self.emitter.events()
    }

    /// Resolve once `ready` has fired. Fails if the watcher closes first.
    pub async fn ready(&self) -> Result<(), WatchError> {
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        self.emitter.on(EventName::Ready, move |_| {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(());
            }
        });
        rx.await.map_err(|_| WatchError::Closed)
    }

    /// Release every watch, cancel pending events and detach all handlers.
    ///
    /// Safe before `ready` and safe to repeat; returns true only for the call
    /// that closed.
    pub fn close(&mut self) -> bool {
        let closed = self.backend.close();
        if closed {
            debug!("Closed watcher on {}", self.root.display());
        }
        closed
    }

    /// Close and wait for the background task to finish
    pub async fn shutdown(&mut self) -> Result<bool, WatchError> {
        let closed = self.close();
        if let Some(task) = self.backend.take_task() {
            match task.await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    return Err(WatchError::TaskFailed {
                        reason: e.to_string(),
                    })
                }
            }
        }
        Ok(closed)
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        if !self.persistent {
            self.close();
        }
    }
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("root", &self.root)
            .field("backend", &self.backend.kind())
            .field("state", &self.state())
            .field("persistent", &self.persistent)
            .finish()
    }
}
