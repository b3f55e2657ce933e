//! Event publisher and watcher lifecycle state
//!
//! Handlers are keyed by [`EventName`]. A classified change is delivered to the
//! handlers for its own kind first, then to the `All` handlers. Once closed,
//! every handler is detached and further emits are dropped.

use crate::error::WatchError;
use crate::event::{ChangeEvent, EventName, WatchEvent};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Callback attached with [`Emitter::on`]
pub type Handler = Arc<dyn Fn(&WatchEvent) + Send + Sync>;

/// Identifies an attached handler for [`Emitter::off`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Lifecycle of a watcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    /// Backend is enumerating or subscribing; `ready` has not fired
    Initializing,
    /// Steady-state event emission
    Ready,
    /// Terminal; resources released, nothing fires
    Closed,
}

/// Multi-event publisher shared by a backend and its facade
pub struct Emitter {
    handlers: RwLock<Vec<(EventName, HandlerId, Handler)>>,
    state: Mutex<WatcherState>,
    next_id: AtomicU64,
}

impl Emitter {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
            state: Mutex::new(WatcherState::Initializing),
            next_id: AtomicU64::new(1),
        }
    }

    /// Attach a handler for one event name.
    ///
    /// `ready` is latched: a `Ready` handler attached after it fired is called
    /// immediately.
    pub fn on<F>(&self, name: EventName, handler: F) -> HandlerId
    where
        F: Fn(&WatchEvent) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        // Held across the push so a concurrent emit_ready cannot slip between
        let state = self.state.lock();
        match *state {
            WatcherState::Closed => return id,
            WatcherState::Ready if name == EventName::Ready => {
                drop(state);
                handler(&WatchEvent::Ready);
                return id;
            }
            _ => {}
        }
        self.handlers.write().push((name, id, Arc::new(handler)));
        id
    }

    /// Detach a handler. Returns false if it was not attached.
    pub fn off(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|(_, h, _)| *h != id);
        handlers.len() != before
    }

    /// Channel subscription receiving ready, every change, and errors
    pub fn events(&self) -> mpsc::UnboundedReceiver<WatchEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        for name in [EventName::Ready, EventName::All, EventName::Error] {
            let tx = tx.clone();
            self.on(name, move |event| {
                let _ = tx.send(event.clone());
            });
        }
        rx
    }

    pub fn state(&self) -> WatcherState {
        *self.state.lock()
    }

    /// Number of attached handlers
    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    /// Transition to `Ready` and fire `ready`. Only the first call fires.
    pub fn emit_ready(&self) {
        {
            let mut state = self.state.lock();
            if *state != WatcherState::Initializing {
                return;
            }
            *state = WatcherState::Ready;
        }
        self.dispatch(&[EventName::Ready], &WatchEvent::Ready);
    }

    pub fn emit_change(&self, event: ChangeEvent) {
        let name = EventName::for_kind(event.kind);
        self.dispatch(&[name, EventName::All], &WatchEvent::Change(event));
    }

    pub fn emit_error(&self, error: impl Into<Arc<WatchError>>) {
        let error = error.into();
        debug!("emitting error: {}", error);
        self.dispatch(&[EventName::Error], &WatchEvent::Error(error));
    }

    pub fn emit(&self, event: WatchEvent) {
        match event {
            WatchEvent::Ready => self.emit_ready(),
            WatchEvent::Change(change) => self.emit_change(change),
            WatchEvent::Error(error) => self.emit_error(error),
        }
    }

    /// Enter `Closed` and detach every handler.
    ///
    /// Returns true only for the call that performed the transition.
    pub fn close(&self) -> bool {
        {
            let mut state = self.state.lock();
            if *state == WatcherState::Closed {
                return false;
            }
            *state = WatcherState::Closed;
        }
        self.handlers.write().clear();
        true
    }

    fn dispatch(&self, names: &[EventName], event: &WatchEvent) {
        if self.state() == WatcherState::Closed {
            return;
        }

        // Snapshot so handlers may attach or detach while running.
        let targets: Vec<Handler> = {
            let handlers = self.handlers.read();
            names
                .iter()
                .flat_map(|name| {
                    handlers
                        .iter()
                        .filter(move |(n, _, _)| n == name)
                        .map(|(_, _, h)| h.clone())
                })
                .collect()
        };

        for handler in targets {
            if self.state() == WatcherState::Closed {
                return;
            }
            handler(event);
        }
    }
}

impl Default for Emitter {
    fn default() -> Self {
        Self::new()
    }
}
