//! External change service end-to-end tests

mod common;

use anyhow::Result;
use async_trait::async_trait;
use common::{count, Fixture, Recorder, SETTLE};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufReader, DuplexStream};
use treewatch::{
    BackendKind, ChangeKind, Connection, ConnectionManager, Launcher, WatchError, WatchOptions,
    Watcher,
};

/// Hands out pre-made pipes, one per launch; fails once they run out
struct Pipes(Mutex<Vec<DuplexStream>>);

#[async_trait]
impl Launcher for Pipes {
    async fn launch(&self, root: &Path) -> Result<Connection, WatchError> {
        match self.0.lock().pop() {
            Some(stream) => Ok(Connection::new(BufReader::new(stream))),
            None => Err(WatchError::LaunchFailed {
                root: root.to_path_buf(),
                reason: "no service available".to_string(),
            }),
        }
    }
}

/// A manager with one connected pipe, and the write end of that pipe
fn service() -> (Arc<ConnectionManager>, DuplexStream) {
    let (writer, reader) = tokio::io::duplex(4096);
    (ConnectionManager::new(Pipes(Mutex::new(vec![reader]))), writer)
}

async fn start(fixture: &Fixture, manager: &Arc<ConnectionManager>) -> Result<(Watcher, Recorder)> {
    let options = WatchOptions::new()
        .backend(BackendKind::External)
        .connection(manager.clone());
    let watcher = Watcher::new(fixture.root(), options)?;
    let mut recorder = Recorder::attach(&watcher);
    recorder.ready().await?;
    Ok((watcher, recorder))
}

#[tokio::test]
async fn test_actions_map_to_kinds() -> Result<()> {
    let fixture = Fixture::new()?;
    let (manager, mut service) = service();
    let (mut watcher, mut events) = start(&fixture, &manager).await?;
    let root = fixture.root().display().to_string();

    fixture.write("file_new", "created")?;
    service
        .write_all(format!("create {}/file_new\n", root).as_bytes())
        .await?;
    let added = events.expect(ChangeKind::Add, "file_new").await?;
    assert!(added.stat.is_some());

    service
        .write_all(format!("write {}/file_1\nrename {}/file_2\n", root, root).as_bytes())
        .await?;
    events.expect(ChangeKind::Change, "file_1").await?;
    events.expect(ChangeKind::Change, "file_2").await?;

    service
        .write_all(format!("remove {}/sub_9\n", root).as_bytes())
        .await?;
    let deleted = events.expect(ChangeKind::Delete, "sub_9").await?;
    assert!(deleted.stat.is_none());

    watcher.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_malformed_lines_are_skipped() -> Result<()> {
    let fixture = Fixture::new()?;
    let (manager, mut service) = service();
    let (mut watcher, mut events) = start(&fixture, &manager).await?;
    let root = fixture.root().display().to_string();

    service
        .write_all(
            format!(
                "\n\nsorry not sorry:\n      never gonna give you up\nwrite {}/file_3\n",
                root
            )
            .as_bytes(),
        )
        .await?;

    let changes = events.collect(SETTLE).await;
    assert_eq!(changes.len(), 1, "unexpected events: {:?}", changes);
    assert_eq!(count(&changes, ChangeKind::Change, "file_3"), 1);

    watcher.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_raced_stat_yields_no_metadata() -> Result<()> {
    let fixture = Fixture::new()?;
    let (manager, mut service) = service();
    let (mut watcher, mut events) = start(&fixture, &manager).await?;
    let root = fixture.root().display().to_string();

    service
        .write_all(format!("create {}/already_gone\n", root).as_bytes())
        .await?;
    let added = events.expect(ChangeKind::Add, "already_gone").await?;
    assert!(added.stat.is_none());

    watcher.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_duplicate_lines_coalesce() -> Result<()> {
    let fixture = Fixture::new()?;
    let (manager, mut service) = service();
    let (mut watcher, mut events) = start(&fixture, &manager).await?;
    let root = fixture.root().display().to_string();

    let burst = format!("write {}/file_1\n", root).repeat(5);
    service.write_all(burst.as_bytes()).await?;

    let changes = events.collect(SETTLE).await;
    assert_eq!(count(&changes, ChangeKind::Change, "file_1"), 1);

    watcher.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_watchers_share_one_connection() -> Result<()> {
    let fixture = Fixture::new()?;
    let (manager, mut service) = service();
    let (mut first, mut first_events) = start(&fixture, &manager).await?;
    let (mut second, mut second_events) = start(&fixture, &manager).await?;
    assert_eq!(manager.connection_count(), 1);
    assert_eq!(manager.subscriber_count(fixture.root()), 2);

    service
        .write_all(format!("write {}/file_1\n", fixture.root().display()).as_bytes())
        .await?;
    first_events.expect(ChangeKind::Change, "file_1").await?;
    second_events.expect(ChangeKind::Change, "file_1").await?;

    first.shutdown().await?;
    assert_eq!(manager.subscriber_count(fixture.root()), 1);
    second.shutdown().await?;
    assert_eq!(manager.connection_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_lost_service_surfaces_error() -> Result<()> {
    let fixture = Fixture::new()?;
    let (manager, service) = service();
    let (mut watcher, mut events) = start(&fixture, &manager).await?;

    // Stream ends and the relaunch has nothing to connect to
    drop(service);
    let message = events.error().await?;
    assert!(message.contains("reconnect failed"), "{}", message);

    watcher.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_launch_failure_surfaces_error() -> Result<()> {
    let fixture = Fixture::new()?;
    let manager = ConnectionManager::new(Pipes(Mutex::new(Vec::new())));
    let options = WatchOptions::new()
        .backend(BackendKind::External)
        .connection(manager);
    let mut watcher = Watcher::new(fixture.root(), options)?;
    let mut events = Recorder::attach(&watcher);

    let message = events.error().await?;
    assert!(message.contains("no service available"), "{}", message);

    watcher.shutdown().await?;
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn test_command_service() -> Result<()> {
    let fixture = Fixture::new()?;
    let script = "echo \"write $(pwd)/file_1\"; sleep 30";
    let options = WatchOptions::new()
        .backend(BackendKind::External)
        .command(["sh", "-c", script]);
    let (mut watcher, mut events) = {
        let watcher = Watcher::new(fixture.root(), options)?;
        let mut recorder = Recorder::attach(&watcher);
        recorder.ready().await?;
        (watcher, recorder)
    };

    events.expect(ChangeKind::Change, "file_1").await?;
    watcher.shutdown().await?;
    Ok(())
}
