//! Watcher configuration
//!
//! [`WatchOptions`] is the programmatic form, built with chained setters.
//! [`WatchConfig`] is the plain-data subset that can be read from TOML:
//!
//! ```toml
//! [watch]
//! glob = ["**/*.rs", "**/*.toml"]
//! ignore = ["target/**"]
//! ignore_regex = ["\\.swp$"]
//! dot = false
//! backend = "poll"
//! interval_ms = 250
//! ```

use crate::backend::{Backend, BackendFactory};
use crate::connection::ConnectionManager;
use crate::debounce::DEFAULT_DELAY;
use crate::error::WatchError;
use crate::emitter::Emitter;
use crate::matcher::{IgnoreRule, PathMatcher};
use crate::platform::{MTIME_RESOLUTION, NATIVE_READY_DELAY};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Default poll interval
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(100);

/// Program the external backend runs when no command is configured
pub const DEFAULT_EXTERNAL_COMMAND: &[&str] = &["watchexec", "-n", "--", "treewatch", "emit-changes"];

/// Source of raw change notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// One OS watch per directory
    #[default]
    Native,
    /// Periodic snapshot diff
    Poll,
    /// Line protocol from a change-reporting subprocess
    External,
    /// Supplied by the caller through [`WatchOptions::custom_backend`]
    #[serde(skip)]
    Custom,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendKind::Native => "native",
            BackendKind::Poll => "poll",
            BackendKind::External => "external",
            BackendKind::Custom => "custom",
        })
    }
}

/// Options accepted by [`crate::Watcher::new`]
#[derive(Clone)]
pub struct WatchOptions {
    pub(crate) globs: Vec<String>,
    pub(crate) ignore: Vec<IgnoreRule>,
    pub(crate) ignore_files: Vec<PathBuf>,
    pub(crate) dot: bool,
    pub(crate) backend: Option<BackendKind>,
    pub(crate) poll: bool,
    pub(crate) interval: Duration,
    pub(crate) debounce: Option<Duration>,
    pub(crate) ready_delay: Option<Duration>,
    pub(crate) persistent: bool,
    pub(crate) follow_links: bool,
    pub(crate) command: Option<Vec<String>>,
    pub(crate) connection: Option<Arc<ConnectionManager>>,
    pub(crate) factory: Option<BackendFactory>,
}

impl WatchOptions {
    pub fn new() -> Self {
        Self {
            globs: Vec::new(),
            ignore: Vec::new(),
            ignore_files: Vec::new(),
            dot: false,
            backend: None,
            poll: false,
            interval: DEFAULT_INTERVAL,
            debounce: None,
            ready_delay: None,
            persistent: true,
            follow_links: false,
            command: None,
            connection: None,
            factory: None,
        }
    }

    /// Add an include glob
    pub fn glob(mut self, pattern: impl Into<String>) -> Self {
        self.globs.push(pattern.into());
        self
    }

    pub fn globs<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.globs.extend(patterns.into_iter().map(Into::into));
        self
    }

    /// Add an exclusion rule (glob string, `Regex`, or [`IgnoreRule`])
    pub fn ignore(mut self, rule: impl Into<IgnoreRule>) -> Self {
        self.ignore.push(rule.into());
        self
    }

    /// Exclude paths for which `f` returns true
    pub fn ignore_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&Path) -> bool + Send + Sync + 'static,
    {
        self.ignore.push(IgnoreRule::predicate(f));
        self
    }

    /// Add a gitignore-style file; relative paths resolve against the root
    pub fn ignore_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.ignore_files.push(path.into());
        self
    }

    /// Include dot-prefixed paths
    pub fn dot(mut self, dot: bool) -> Self {
        self.dot = dot;
        self
    }

    pub fn backend(mut self, backend: BackendKind) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Shorthand for the polling backend
    pub fn poll(mut self, poll: bool) -> Self {
        self.poll = poll;
        self
    }

    /// Poll interval
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Override the backend's default debounce window
    pub fn debounce(mut self, delay: Duration) -> Self {
        self.debounce = Some(delay);
        self
    }

    /// Override the backend's default settle time before `ready`
    pub fn ready_delay(mut self, delay: Duration) -> Self {
        self.ready_delay = Some(delay);
        self
    }

    /// Keep watching after the [`crate::Watcher`] handle is dropped
    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn follow_links(mut self, follow: bool) -> Self {
        self.follow_links = follow;
        self
    }

    /// Program and arguments for the external backend
    pub fn command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = Some(command.into_iter().map(Into::into).collect());
        self
    }

    /// Share a connection manager between external watchers
    pub fn connection(mut self, manager: Arc<ConnectionManager>) -> Self {
        self.connection = Some(manager);
        self
    }

    /// Use a caller-supplied backend instead of the built-in ones
    pub fn custom_backend<F>(mut self, factory: F) -> Self
    where
        F: Fn(Arc<Path>, Arc<PathMatcher>, Arc<Emitter>) -> Result<Box<dyn Backend>, WatchError>
            + Send
            + Sync
            + 'static,
    {
        self.backend = Some(BackendKind::Custom);
        self.factory = Some(Arc::new(factory));
        self
    }

    /// Backend selected by these options. `poll` conflicts with any other
    /// explicitly requested backend.
    pub fn resolved_backend(&self) -> Result<BackendKind, WatchError> {
        match (self.poll, self.backend) {
            (true, Some(kind)) if kind != BackendKind::Poll => Err(WatchError::invalid(format!(
                "poll requested together with the {} backend",
                kind
            ))),
            (true, _) => Ok(BackendKind::Poll),
            (false, kind) => Ok(kind.unwrap_or_default()),
        }
    }

    /// Check everything that can be checked without touching the filesystem
    pub fn validate(&self) -> Result<BackendKind, WatchError> {
        let kind = self.resolved_backend()?;

        if kind == BackendKind::Custom && self.factory.is_none() {
            return Err(WatchError::invalid("custom backend requested without a factory"));
        }
        if kind == BackendKind::Poll && self.interval.is_zero() {
            return Err(WatchError::invalid("poll interval must be non-zero"));
        }
        if let Some(command) = &self.command {
            if command.first().map(|p| p.trim().is_empty()).unwrap_or(true) {
                return Err(WatchError::invalid("external command must name a program"));
            }
        }
        Ok(kind)
    }

    pub fn debounce_for(&self, kind: BackendKind) -> Duration {
        self.debounce.unwrap_or(match kind {
            BackendKind::Poll => self.interval + DEFAULT_DELAY,
            BackendKind::Native | BackendKind::External | BackendKind::Custom => DEFAULT_DELAY,
        })
    }

    pub fn ready_delay_for(&self, kind: BackendKind) -> Duration {
        self.ready_delay.unwrap_or(match kind {
            BackendKind::Native => NATIVE_READY_DELAY,
            BackendKind::Poll => MTIME_RESOLUTION,
            BackendKind::External | BackendKind::Custom => Duration::ZERO,
        })
    }

    /// External program and arguments, falling back to the default
    pub fn external_command(&self) -> Vec<String> {
        self.command.clone().unwrap_or_else(|| {
            DEFAULT_EXTERNAL_COMMAND
                .iter()
                .map(|s| s.to_string())
                .collect()
        })
    }

    /// Compile globs, ignore rules and ignore files for `root`
    pub fn matcher(&self, root: &Path) -> Result<PathMatcher, WatchError> {
        let mut matcher = PathMatcher::new(&self.globs, &self.ignore, self.dot)?;
        for file in &self.ignore_files {
            let file = if file.is_absolute() {
                file.clone()
            } else {
                root.join(file)
            };
            matcher.add_ignore_file(root, &file)?;
        }
        Ok(matcher)
    }
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for WatchOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchOptions")
            .field("globs", &self.globs)
            .field("ignore", &self.ignore)
            .field("ignore_files", &self.ignore_files)
            .field("dot", &self.dot)
            .field("backend", &self.backend)
            .field("poll", &self.poll)
            .field("interval", &self.interval)
            .field("debounce", &self.debounce)
            .field("persistent", &self.persistent)
            .field("command", &self.command)
            .field("custom_backend", &self.factory.is_some())
            .finish()
    }
}

/// Serializable watch configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Include globs; a single string is accepted
    #[serde(deserialize_with = "one_or_many")]
    pub glob: Vec<String>,
    /// Ignore globs; a single string is accepted
    #[serde(deserialize_with = "one_or_many")]
    pub ignore: Vec<String>,
    /// Ignore regular expressions
    pub ignore_regex: Vec<String>,
    /// Gitignore-style files
    pub ignore_files: Vec<PathBuf>,
    pub dot: bool,
    pub backend: Option<BackendKind>,
    pub interval_ms: Option<u64>,
    pub debounce_ms: Option<u64>,
    pub follow_links: bool,
    /// External program and arguments
    pub command: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    watch: WatchConfig,
}

impl WatchConfig {
    /// Parse the `[watch]` table of a TOML document
    pub fn from_toml_str(contents: &str) -> Result<Self, WatchError> {
        let file: ConfigFile = toml::from_str(contents)?;
        Ok(file.watch)
    }

    pub fn load(path: &Path) -> Result<Self, WatchError> {
        let contents = std::fs::read_to_string(path).map_err(|e| WatchError::ConfigError {
            reason: format!("{}: {}", path.display(), e),
        })?;
        Self::from_toml_str(&contents)
    }

    /// Convert to options; regexes are compiled here
    pub fn into_options(self) -> Result<WatchOptions, WatchError> {
        let mut options = WatchOptions::new()
            .globs(self.glob)
            .dot(self.dot)
            .follow_links(self.follow_links);

        for pattern in self.ignore {
            options = options.ignore(pattern);
        }
        for pattern in &self.ignore_regex {
            options = options.ignore(IgnoreRule::regex(pattern)?);
        }
        for file in self.ignore_files {
            options = options.ignore_file(file);
        }
        if let Some(backend) = self.backend {
            options = options.backend(backend);
        }
        if let Some(ms) = self.interval_ms {
            options = options.interval(Duration::from_millis(ms));
        }
        if let Some(ms) = self.debounce_ms {
            options = options.debounce(Duration::from_millis(ms));
        }
        if !self.command.is_empty() {
            options = options.command(self.command);
        }
        Ok(options)
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    })
}
