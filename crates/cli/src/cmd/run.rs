//! Run a shell command whenever the tree changes
//!
//! The command runs once when the watcher is ready and again on every
//! content change. `--wait` swallows changes for a quiet period after each
//! run, `--kill` stops the previous run before starting the next.

use super::WatchArgs;
use anyhow::{anyhow, Context, Result};
use owo_colors::OwoColorize;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, warn};
use treewatch::{ChangeKind, WatchError, WatchEvent, Watcher};

#[cfg(unix)]
use nix::sys::signal::Signal;

/// Spawns the user's command and keeps hold of the latest run
struct Runner {
    command: String,
    kill: bool,
    #[cfg(unix)]
    signal: Signal,
    child: Option<Child>,
}

impl Runner {
    fn new(command: String, kill: bool, kill_signal: &str) -> Result<Self> {
        #[cfg(not(unix))]
        let _ = kill_signal;
        Ok(Self {
            command,
            kill,
            #[cfg(unix)]
            signal: parse_signal(kill_signal)?,
            child: None,
        })
    }

    async fn run(&mut self) -> Result<()> {
        if self.kill {
            if let Some(child) = self.child.take() {
                self.terminate(child).await;
            }
        }

        let child = shell(&self.command)
            .spawn()
            .with_context(|| format!("Failed to run '{}'", self.command))?;
        debug!("Started '{}' as pid {:?}", self.command, child.id());
        self.child = Some(child);
        Ok(())
    }

    #[cfg(unix)]
    async fn terminate(&self, mut child: Child) {
        use nix::sys::signal::killpg;
        use nix::unistd::Pid;

        let Some(pid) = child.id() else {
            // Already reaped
            return;
        };
        match killpg(Pid::from_raw(pid as i32), self.signal) {
            Ok(()) => {}
            Err(nix::errno::Errno::ESRCH) => return,
            Err(e) => {
                warn!("Failed to signal pid {}: {}", pid, e);
                return;
            }
        }
        if let Err(e) = child.wait().await {
            warn!("Failed to wait for pid {}: {}", pid, e);
        }
    }

    #[cfg(not(unix))]
    async fn terminate(&self, mut child: Child) {
        if let Err(e) = child.kill().await {
            warn!("Failed to stop previous run: {}", e);
        }
    }
}

#[cfg(unix)]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    // Own process group so --kill reaches the whole tree
    cmd.process_group(0);
    inherit(cmd)
}

#[cfg(not(unix))]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    inherit(cmd)
}

fn inherit(mut cmd: Command) -> Command {
    cmd.stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());
    cmd
}

/// Accepts `TERM`, `SIGTERM`, `sigterm` or a signal number
#[cfg(unix)]
pub fn parse_signal(name: &str) -> Result<Signal> {
    let upper = name.trim().to_ascii_uppercase();
    if let Ok(number) = upper.parse::<i32>() {
        return Signal::try_from(number).map_err(|_| anyhow!("Unknown signal: {}", name));
    }
    let full = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{}", upper)
    };
    full.parse::<Signal>()
        .map_err(|_| anyhow!("Unknown signal: {}", name))
}

/// Watch `args` and rerun `command` on changes
pub async fn run(
    command: String,
    args: &WatchArgs,
    wait: Duration,
    kill: bool,
    kill_signal: &str,
) -> Result<()> {
    let dir = args.dir()?;
    let options = args.options()?;
    let mut runner = Runner::new(command, kill, kill_signal)?;

    let mut watcher = Watcher::new(&dir, options)
        .with_context(|| format!("Failed to watch {}", dir.display()))?;
    let mut events = watcher.events();
    let pattern = args.glob.join(",");
    let mut quiet_until: Option<Instant> = None;

    let result = loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(WatchEvent::Ready) => {
                    println!("{} {}/{}", "Watching:".bold(), dir.display(), pattern);
                    if let Err(e) = runner.run().await {
                        break Err(e);
                    }
                }
                Some(WatchEvent::Change(change)) if change.kind == ChangeKind::Change => {
                    if quiet_until.is_some_and(|until| Instant::now() < until) {
                        continue;
                    }
                    println!("{} {}", "Change detected in:".yellow(), change.path.display());
                    if let Err(e) = runner.run().await {
                        break Err(e);
                    }
                    if !wait.is_zero() {
                        quiet_until = Some(Instant::now() + wait);
                    }
                }
                Some(WatchEvent::Change(_)) => {}
                Some(WatchEvent::Error(e)) => {
                    if matches!(*e, WatchError::ConnectionLost { .. }) {
                        break Err(anyhow!("{}", e));
                    }
                    warn!("{}", e);
                }
                None => break Ok(()),
            },
            _ = tokio::signal::ctrl_c() => break Ok(()),
        }
    };

    watcher.shutdown().await?;
    result
}
