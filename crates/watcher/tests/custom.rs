//! Caller-supplied backend tests

mod common;

use anyhow::Result;
use common::{Fixture, Recorder};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use treewatch::{
    Backend, BackendKind, ChangeEvent, ChangeKind, Emitter, PathMatcher, WatchError, WatchOptions,
    Watcher,
};

/// Announces every included name in `names` as added, then goes quiet
struct ScriptedBackend {
    root: Arc<Path>,
    matcher: Arc<PathMatcher>,
    emitter: Arc<Emitter>,
    names: Vec<&'static str>,
    task: Option<JoinHandle<()>>,
}

impl Backend for ScriptedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Custom
    }

    fn start(&mut self) -> Result<(), WatchError> {
        let root = self.root.clone();
        let matcher = self.matcher.clone();
        let emitter = self.emitter.clone();
        let names = self.names.clone();
        self.task = Some(tokio::spawn(async move {
            emitter.emit_ready();
            for name in names {
                let path = PathBuf::from(name);
                if matcher.included(&path) {
                    emitter.emit_change(ChangeEvent::new(ChangeKind::Add, path, root.clone(), None));
                }
            }
        }));
        Ok(())
    }

    fn emitter(&self) -> &Arc<Emitter> {
        &self.emitter
    }

    fn close(&mut self) -> bool {
        if let Some(task) = &self.task {
            task.abort();
        }
        self.emitter.close()
    }

    fn take_task(&mut self) -> Option<JoinHandle<()>> {
        self.task.take()
    }
}

fn scripted(names: Vec<&'static str>, built: Arc<AtomicUsize>) -> WatchOptions {
    WatchOptions::new().custom_backend(move |root, matcher, emitter| {
        built.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedBackend {
            root,
            matcher,
            emitter,
            names: names.clone(),
            task: None,
        }) as Box<dyn Backend>)
    })
}

#[tokio::test]
async fn test_custom_backend_drives_the_watcher() -> Result<()> {
    let fixture = Fixture::new()?;
    let built = Arc::new(AtomicUsize::new(0));
    let options = scripted(vec!["file_new", ".hidden"], built.clone());

    let mut watcher = Watcher::new(fixture.root(), options)?;
    let mut events = Recorder::attach(&watcher);
    assert_eq!(built.load(Ordering::SeqCst), 1);
    assert_eq!(watcher.backend_kind(), BackendKind::Custom);

    events.ready().await?;
    let added = events.next_change().await?;
    assert_eq!(added.path, Path::new("file_new"));
    assert_eq!(added.root.as_ref(), fixture.root());

    // The matcher handed to the backend carries the dotfile policy
    assert!(events.collect(common::SETTLE).await.is_empty());

    watcher.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_custom_backend_failure_is_returned() -> Result<()> {
    let fixture = Fixture::new()?;
    let options = WatchOptions::new()
        .custom_backend(|_, _, _| Err(WatchError::invalid("backend unavailable")));

    let result = Watcher::new(fixture.root(), options);
    assert!(matches!(result, Err(WatchError::InvalidOptions { .. })));
    Ok(())
}

#[tokio::test]
async fn test_custom_backend_conflicts_with_poll() -> Result<()> {
    let fixture = Fixture::new()?;
    let built = Arc::new(AtomicUsize::new(0));
    let options = scripted(vec![], built.clone()).poll(true);

    assert!(Watcher::new(fixture.root(), options).is_err());
    assert_eq!(built.load(Ordering::SeqCst), 0);
    Ok(())
}
