//! External change service backend
//!
//! Consumes the line protocol `<action> <absolute path>` where action is one
//! of `write`, `rename`, `remove` or `create`. Lines that do not fit are
//! skipped. There is no registry here: whatever the service reports is
//! emitted, so filtering belongs to the service.

use super::{sleep_until, stat, Backend, Dispatcher};
use crate::connection::{ConnectionManager, ServiceMessage};
use crate::emitter::Emitter;
use crate::error::WatchError;
use crate::event::ChangeKind;
use crate::options::{BackendKind, WatchOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Parse one protocol line
pub fn parse_line(line: &str) -> Option<(ChangeKind, PathBuf)> {
    let line = line.trim_end_matches(['\r', '\n']);
    let (action, path) = line.split_once(char::is_whitespace)?;
    let kind = match action {
        "write" | "rename" => ChangeKind::Change,
        "remove" => ChangeKind::Delete,
        "create" => ChangeKind::Add,
        _ => return None,
    };
    if path.trim().is_empty() {
        return None;
    }
    Some((kind, PathBuf::from(path)))
}

/// Parse every line of a chunk, in order
pub fn parse_chunk(chunk: &str) -> Vec<(ChangeKind, PathBuf)> {
    chunk.lines().filter_map(parse_line).collect()
}

/// Watches through a [`ConnectionManager`]
pub struct ExternalBackend {
    root: Arc<Path>,
    emitter: Arc<Emitter>,
    manager: Arc<ConnectionManager>,
    debounce: Duration,
    ready_delay: Duration,
    task: Option<JoinHandle<()>>,
}

impl ExternalBackend {
    pub fn new(
        root: Arc<Path>,
        emitter: Arc<Emitter>,
        manager: Arc<ConnectionManager>,
        options: &WatchOptions,
    ) -> Self {
        Self {
            root,
            emitter,
            manager,
            debounce: options.debounce_for(BackendKind::External),
            ready_delay: options.ready_delay_for(BackendKind::External),
            task: None,
        }
    }
}

impl Backend for ExternalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::External
    }

    fn start(&mut self) -> Result<(), WatchError> {
        if self.task.is_some() {
            return Err(WatchError::InitFailed {
                reason: "external backend already started".to_string(),
            });
        }

        let manager = self.manager.clone();
        let mut dispatcher = Dispatcher::new(self.root.clone(), self.emitter.clone(), self.debounce);
        let ready_delay = self.ready_delay;

        self.task = Some(tokio::spawn(async move {
            let root = dispatcher.root().to_path_buf();
            let mut subscription = match manager.subscribe(&root).await {
                Ok(subscription) => subscription,
                Err(e) => {
                    warn!("Cannot connect change service for {}: {}", root.display(), e);
                    dispatcher.error(e);
                    return;
                }
            };
            dispatcher.ready_after(ready_delay);

            loop {
                let deadline = dispatcher.next_deadline();
                tokio::select! {
                    message = subscription.recv() => match message {
                        Some(ServiceMessage::Line(line)) => handle_line(&mut dispatcher, &line).await,
                        Some(ServiceMessage::Failed(e)) => {
                            dispatcher.emitter().emit_error(e);
                            break;
                        }
                        None => break,
                    },
                    _ = sleep_until(deadline) => dispatcher.flush(Instant::now()),
                }
                if dispatcher.is_closed() {
                    break;
                }
            }
            dispatcher.cancel();
        }));
        Ok(())
    }

    fn emitter(&self) -> &Arc<Emitter> {
        &self.emitter
    }

    fn close(&mut self) -> bool {
        let closed = self.emitter.close();
        if let Some(task) = &self.task {
            // Dropping the subscription leaves the shared connection
            task.abort();
        }
        if closed {
            debug!("external watcher on {} closed", self.root.display());
        }
        closed
    }

    fn take_task(&mut self) -> Option<JoinHandle<()>> {
        self.task.take()
    }
}

async fn handle_line(dispatcher: &mut Dispatcher, line: &str) {
    let Some((kind, path)) = parse_line(line) else {
        trace!("skipping malformed line {:?}", line);
        return;
    };
    let path = if path.is_absolute() {
        path
    } else {
        dispatcher.root().join(path)
    };
    let Some(relative) = dispatcher.relative(&path) else {
        trace!("{} is outside the root", path.display());
        return;
    };

    let metadata = match kind {
        ChangeKind::Delete => None,
        // A raced deletion just means no metadata
        ChangeKind::Add | ChangeKind::Change => stat(&path).await.ok().flatten(),
    };
    dispatcher.schedule(kind, relative, metadata);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_actions() {
        assert_eq!(
            parse_line("write /t/file_1"),
            Some((ChangeKind::Change, PathBuf::from("/t/file_1")))
        );
        assert_eq!(
            parse_line("rename /t/file_1"),
            Some((ChangeKind::Change, PathBuf::from("/t/file_1")))
        );
        assert_eq!(
            parse_line("remove /t/sub_9"),
            Some((ChangeKind::Delete, PathBuf::from("/t/sub_9")))
        );
        assert_eq!(
            parse_line("create /t/with space\r\n"),
            Some((ChangeKind::Add, PathBuf::from("/t/with space")))
        );
    }

    #[test]
    fn test_malformed_lines_skipped() {
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line("   "), None);
        assert_eq!(parse_line("sorry not sorry:"), None);
        assert_eq!(parse_line("      never gonna give you up"), None);
        assert_eq!(parse_line("write"), None);
        assert_eq!(parse_line("write "), None);
        assert_eq!(parse_line("overwrite /t/file_1"), None);
    }

    #[test]
    fn test_parse_chunk_keeps_order() {
        let chunk = "create /t/a\n\nnever gonna let you down\nwrite /t/a\nremove /t/b\n";
        assert_eq!(
            parse_chunk(chunk),
            vec![
                (ChangeKind::Add, PathBuf::from("/t/a")),
                (ChangeKind::Change, PathBuf::from("/t/a")),
                (ChangeKind::Delete, PathBuf::from("/t/b")),
            ]
        );
    }
}
