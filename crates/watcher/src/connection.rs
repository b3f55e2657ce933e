//! Connections to an external change-reporting service
//!
//! A [`ConnectionManager`] owns at most one live connection per root and fans
//! its lines out to every subscribed watcher. Managers are explicit values:
//! whoever constructs watchers decides whether they share one (pass it through
//! [`crate::WatchOptions::connection`]) or each get their own.
//!
//! When a stream ends while watchers are still subscribed, the service is
//! relaunched once. If that relaunch fails, or the relaunched stream ends
//! without producing a single line, every subscriber of the root receives
//! [`ServiceMessage::Failed`] and the connection is dropped.

use crate::error::WatchError;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What a subscriber receives
#[derive(Debug, Clone)]
pub enum ServiceMessage {
    /// One non-blank line of service output
    Line(String),
    /// The service is gone for good
    Failed(Arc<WatchError>),
}

/// A line stream, optionally backed by a child process
pub struct Connection {
    reader: Box<dyn AsyncBufRead + Send + Unpin>,
    child: Option<Child>,
}

impl Connection {
    pub fn new(reader: impl AsyncBufRead + Send + Unpin + 'static) -> Self {
        Self {
            reader: Box::new(reader),
            child: None,
        }
    }

    /// Read the child's stdout; the child is killed when the connection drops
    pub fn from_child(mut child: Child) -> Result<Self, WatchError> {
        let stdout = child.stdout.take().ok_or_else(|| WatchError::InitFailed {
            reason: "child process has no piped stdout".to_string(),
        })?;
        Ok(Self {
            reader: Box::new(BufReader::new(stdout)),
            child: Some(child),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }

    /// Next line without its terminator. `None` at end of stream.
    pub async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        let mut buf = Vec::new();
        let read = self.reader.read_until(b'\n', &mut buf).await?;
        if read == 0 {
            return Ok(None);
        }
        let line = String::from_utf8_lossy(&buf);
        Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").field("pid", &self.pid()).finish()
    }
}

/// Opens connections for a root
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, root: &Path) -> Result<Connection, WatchError>;
}

/// Runs a program in the root directory and reads its stdout
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    program: String,
    args: Vec<String>,
}

impl CommandLauncher {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// From `[program, args..]`
    pub fn from_command(command: &[String]) -> Result<Self, WatchError> {
        match command.split_first() {
            Some((program, args)) if !program.trim().is_empty() => {
                Ok(Self::new(program.clone(), args.iter().cloned()))
            }
            _ => Err(WatchError::invalid("external command must name a program")),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

#[async_trait]
impl Launcher for CommandLauncher {
    async fn launch(&self, root: &Path) -> Result<Connection, WatchError> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .current_dir(root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| WatchError::LaunchFailed {
                root: root.to_path_buf(),
                reason: format!("{}: {}", self.program, e),
            })?;
        debug!("launched {} for {} (pid {:?})", self.program, root.display(), child.id());
        Connection::from_child(child)
    }
}

type Sender = mpsc::UnboundedSender<ServiceMessage>;

/// Subscribers of one root. A closed set accepts no new members.
#[derive(Default)]
struct Members {
    list: Vec<(u64, Sender)>,
    closed: bool,
}

struct Shared {
    members: Mutex<Members>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn new(id: u64, tx: Sender) -> Self {
        Self {
            members: Mutex::new(Members {
                list: vec![(id, tx)],
                closed: false,
            }),
            task: Mutex::new(None),
        }
    }

    /// Add a subscriber unless the connection is shutting down
    fn join(&self, id: u64, tx: &Sender) -> bool {
        let mut members = self.members.lock();
        if members.closed {
            return false;
        }
        members.list.push((id, tx.clone()));
        true
    }

    /// Remove `id`. Closes the set when it was the last member.
    fn leave(&self, id: u64) -> bool {
        let mut members = self.members.lock();
        members.list.retain(|(sid, _)| *sid != id);
        if members.list.is_empty() {
            members.closed = true;
        }
        members.closed
    }

    /// Close the set if nobody is left
    fn close_if_empty(&self) -> bool {
        let mut members = self.members.lock();
        if members.list.is_empty() {
            members.closed = true;
        }
        members.closed
    }

    fn is_closed(&self) -> bool {
        self.members.lock().closed
    }

    fn len(&self) -> usize {
        self.members.lock().list.len()
    }

    fn broadcast(&self, message: ServiceMessage) {
        self.members
            .lock()
            .list
            .retain(|(_, tx)| tx.send(message.clone()).is_ok());
    }

    /// Deliver a final message to every member and close the set
    fn fail(&self, message: ServiceMessage) {
        let mut members = self.members.lock();
        members.closed = true;
        for (_, tx) in members.list.drain(..) {
            let _ = tx.send(message.clone());
        }
    }
}

/// One connection per root, shared by every subscriber of that root
pub struct ConnectionManager {
    launcher: Arc<dyn Launcher>,
    roots: Arc<DashMap<PathBuf, Arc<Shared>>>,
    next_id: AtomicU64,
}

impl ConnectionManager {
    pub fn new(launcher: impl Launcher + 'static) -> Arc<Self> {
        Arc::new(Self {
            launcher: Arc::new(launcher),
            roots: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Manager launching `[program, args..]` per root
    pub fn with_command(command: &[String]) -> Result<Arc<Self>, WatchError> {
        Ok(Self::new(CommandLauncher::from_command(command)?))
    }

    /// Roots with a live connection
    pub fn connection_count(&self) -> usize {
        self.roots.len()
    }

    pub fn subscriber_count(&self, root: &Path) -> usize {
        self.roots
            .get(root)
            .map(|shared| shared.len())
            .unwrap_or(0)
    }

    /// Join the connection for `root`, launching it if there is none
    pub async fn subscribe(self: &Arc<Self>, root: &Path) -> Result<Subscription, WatchError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = Subscription {
            id,
            root: root.to_path_buf(),
            rx,
            manager: Arc::downgrade(self),
        };

        // A closed connection is on its way out; start a fresh one instead
        if let Some(shared) = self.roots.get(root).map(|s| s.value().clone()) {
            if shared.join(id, &tx) {
                return Ok(subscription);
            }
        }

        let connection = self.launcher.launch(root).await?;

        let shared = {
            let entry = self.roots.entry(root.to_path_buf());
            match entry {
                dashmap::mapref::entry::Entry::Occupied(mut existing) => {
                    if existing.get().join(id, &tx) {
                        // Another subscriber launched first; ours is dropped and killed
                        return Ok(subscription);
                    }
                    let shared = Arc::new(Shared::new(id, tx));
                    existing.insert(shared.clone());
                    shared
                }
                dashmap::mapref::entry::Entry::Vacant(vacant) => {
                    let shared = Arc::new(Shared::new(id, tx));
                    vacant.insert(shared.clone());
                    shared
                }
            }
        };

        info!("Connected change service for {}", root.display());
        let task = tokio::spawn(pump(
            root.to_path_buf(),
            shared.clone(),
            self.launcher.clone(),
            self.roots.clone(),
            connection,
        ));
        *shared.task.lock() = Some(task);
        Ok(subscription)
    }

    fn unsubscribe(&self, root: &Path, id: u64) {
        let Some(shared) = self.roots.get(root).map(|s| s.value().clone()) else {
            return;
        };
        if !shared.leave(id) {
            return;
        }

        self.roots.remove_if(root, |_, s| Arc::ptr_eq(s, &shared));
        if let Some(task) = shared.task.lock().take() {
            // Dropping the connection kills the child
            task.abort();
        }
        debug!("Disconnected change service for {}", root.display());
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("roots", &self.roots.len())
            .finish()
    }
}

/// A watcher's membership in a shared connection; leaving is automatic on drop
pub struct Subscription {
    id: u64,
    root: PathBuf,
    rx: mpsc::UnboundedReceiver<ServiceMessage>,
    manager: Weak<ConnectionManager>,
}

impl Subscription {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn recv(&mut self) -> Option<ServiceMessage> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.unsubscribe(&self.root, self.id);
        }
    }
}

/// Forward lines until the stream ends. Returns the number forwarded.
async fn forward(root: &Path, shared: &Shared, connection: &mut Connection) -> usize {
    let mut delivered = 0;
    loop {
        match connection.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                shared.broadcast(ServiceMessage::Line(line));
                delivered += 1;
            }
            Ok(None) => return delivered,
            Err(e) => {
                warn!("Reading change service for {} failed: {}", root.display(), e);
                return delivered;
            }
        }
    }
}

async fn pump(
    root: PathBuf,
    shared: Arc<Shared>,
    launcher: Arc<dyn Launcher>,
    roots: Arc<DashMap<PathBuf, Arc<Shared>>>,
    mut connection: Connection,
) {
    let mut relaunched = false;
    loop {
        let delivered = forward(&root, &shared, &mut connection).await;
        if shared.close_if_empty() {
            roots.remove_if(&root, |_, s| Arc::ptr_eq(s, &shared));
            return;
        }

        let failure = if relaunched && delivered == 0 {
            Some("service ended again without output".to_string())
        } else {
            warn!("Change service for {} ended, relaunching", root.display());
            match launcher.launch(&root).await {
                Ok(next) => {
                    connection = next;
                    relaunched = true;
                    None
                }
                Err(e) => Some(e.to_string()),
            }
        };

        if let Some(reason) = failure {
            warn!("Change service for {} lost: {}", root.display(), reason);
            roots.remove_if(&root, |_, s| Arc::ptr_eq(s, &shared));
            shared.fail(ServiceMessage::Failed(Arc::new(WatchError::ConnectionLost {
                root: root.clone(),
                reason,
            })));
            return;
        }
    }
}
