//! Print watcher events as they happen

use super::WatchArgs;
use anyhow::{Context, Result};
use owo_colors::OwoColorize;
use serde_json::json;
use treewatch::{ChangeKind, WatchEvent, Watcher};

/// One line for `event`, colored or as a JSON object
pub fn render(event: &WatchEvent, as_json: bool) -> String {
    if as_json {
        let value = match event {
            WatchEvent::Ready => json!({ "event": "ready" }),
            WatchEvent::Change(change) => json!({
                "event": change.kind.as_str(),
                "path": change.path.display().to_string(),
                "root": change.root.display().to_string(),
                "is_dir": change.is_dir(),
            }),
            WatchEvent::Error(e) => json!({
                "event": "error",
                "message": e.to_string(),
            }),
        };
        return value.to_string();
    }

    match event {
        WatchEvent::Ready => format!("{}", "ready".cyan()),
        WatchEvent::Change(change) => {
            let path = change.path.display().to_string();
            let suffix = if change.is_dir() { "/" } else { "" };
            let label = match change.kind {
                ChangeKind::Add => format!("{}", "add   ".green()),
                ChangeKind::Change => format!("{}", "change".yellow()),
                ChangeKind::Delete => format!("{}", "delete".red()),
            };
            format!("{} {}{}", label, path, suffix)
        }
        WatchEvent::Error(e) => format!("{} {}", "error ".red().bold(), e),
    }
}

/// Stream events for `args` until interrupted
pub async fn run(args: &WatchArgs, as_json: bool) -> Result<()> {
    let dir = args.dir()?;
    let options = args.options()?;
    let mut watcher = Watcher::new(&dir, options)
        .with_context(|| format!("Failed to watch {}", dir.display()))?;
    let mut events = watcher.events();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => println!("{}", render(&event, as_json)),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    watcher.shutdown().await?;
    Ok(())
}
