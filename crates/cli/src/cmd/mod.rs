//! CLI command implementations

pub mod config;
pub mod emit_changes;
pub mod events;
pub mod run;

use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;
use std::time::Duration;
use treewatch::{BackendKind, WatchConfig, WatchOptions};

/// Options shared by every command that watches a directory
#[derive(Args, Debug, Clone, Default)]
pub struct WatchArgs {
    /// Directory to watch (default: current directory)
    pub dir: Option<PathBuf>,

    /// Only report paths matching this glob (repeatable)
    #[arg(short, long = "glob")]
    pub glob: Vec<String>,

    /// Ignore paths matching this glob (repeatable)
    #[arg(short, long = "ignored")]
    pub ignored: Vec<String>,

    /// Include dotfiles
    #[arg(short, long)]
    pub dot: bool,

    /// Poll instead of using native notifications
    #[arg(short, long, conflicts_with = "external")]
    pub poll: bool,

    /// Poll interval in milliseconds
    #[arg(long)]
    pub interval: Option<u64>,

    /// Read changes from an external service (watchexec by default)
    #[arg(short = 'x', long)]
    pub external: bool,

    /// TOML file with a [watch] table
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

impl WatchArgs {
    pub fn dir(&self) -> Result<PathBuf> {
        match &self.dir {
            Some(dir) => Ok(dir.clone()),
            None => std::env::current_dir().context("Failed to get current directory"),
        }
    }

    /// Config file settings with command-line flags layered on top
    pub fn config(&self) -> Result<WatchConfig> {
        let mut config = match &self.config {
            Some(path) => WatchConfig::load(path)
                .with_context(|| format!("Failed to load {}", path.display()))?,
            None => WatchConfig::default(),
        };

        config.glob.extend(self.glob.iter().cloned());
        config.ignore.extend(self.ignored.iter().cloned());
        if self.dot {
            config.dot = true;
        }
        if self.poll {
            config.backend = Some(BackendKind::Poll);
        }
        if self.external {
            config.backend = Some(BackendKind::External);
        }
        if let Some(ms) = self.interval {
            config.interval_ms = Some(ms);
        }
        Ok(config)
    }

    pub fn options(&self) -> Result<WatchOptions> {
        let options = self
            .config()?
            .into_options()
            .context("Invalid watch configuration")?;
        Ok(options)
    }
}

/// Seconds as accepted by `--wait`
pub fn seconds(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value)
    } else {
        Duration::ZERO
    }
}
