//! Include/ignore evaluation for relative paths
//!
//! Three tiers, evaluated in order:
//! 1. Ignore rules (globs, regexes, predicates, gitignore files) - always win
//! 2. Explicit include globs, when any are configured
//! 3. Otherwise everything, except dot-prefixed segments unless `dot` is set
//!
//! Globs follow minimatch conventions: `*` stays inside one segment, `**`
//! spans segments, and wildcards do not match a leading `.` unless dot
//! matching is on or the pattern spells the dot out.

use crate::error::WatchError;
use globset::{GlobBuilder, GlobMatcher};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use regex::Regex;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// Predicate over a path relative to the watch root
pub type PathPredicate = Arc<dyn Fn(&Path) -> bool + Send + Sync>;

/// One exclusion rule, as supplied by the caller
#[derive(Clone)]
pub enum IgnoreRule {
    /// Glob pattern, evaluated without dot matching
    Glob(String),
    /// Regular expression searched anywhere in the relative path
    Pattern(Regex),
    /// Arbitrary predicate
    Predicate(PathPredicate),
}

impl IgnoreRule {
    pub fn glob(pattern: impl Into<String>) -> Self {
        IgnoreRule::Glob(pattern.into())
    }

    pub fn regex(pattern: &str) -> Result<Self, WatchError> {
        Regex::new(pattern)
            .map(IgnoreRule::Pattern)
            .map_err(|e| WatchError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: e.to_string(),
            })
    }

    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&Path) -> bool + Send + Sync + 'static,
    {
        IgnoreRule::Predicate(Arc::new(f))
    }
}

impl fmt::Debug for IgnoreRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IgnoreRule::Glob(g) => f.debug_tuple("Glob").field(g).finish(),
            IgnoreRule::Pattern(r) => f.debug_tuple("Pattern").field(&r.as_str()).finish(),
            IgnoreRule::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

impl From<&str> for IgnoreRule {
    fn from(pattern: &str) -> Self {
        IgnoreRule::Glob(pattern.to_string())
    }
}

impl From<String> for IgnoreRule {
    fn from(pattern: String) -> Self {
        IgnoreRule::Glob(pattern)
    }
}

impl From<Regex> for IgnoreRule {
    fn from(pattern: Regex) -> Self {
        IgnoreRule::Pattern(pattern)
    }
}

/// A compiled glob with its dot policy
#[derive(Debug, Clone)]
struct CompiledGlob {
    matcher: GlobMatcher,
    /// Per-segment form, present when the pattern spells out a dot segment
    segments: Option<Vec<Segment>>,
}

/// One `/`-separated piece of a pattern
#[derive(Debug, Clone)]
enum Segment {
    Globstar,
    Glob { matcher: GlobMatcher, dot: bool },
}

impl CompiledGlob {
    fn new(pattern: &str) -> Result<Self, WatchError> {
        let normalized = pattern.strip_prefix("./").unwrap_or(pattern);
        let glob = GlobBuilder::new(normalized)
            .literal_separator(true)
            .backslash_escape(true)
            .build()?;
        let explicit_dot = normalized
            .split('/')
            .any(|segment| segment.starts_with('.') && segment != "." && segment != "..");
        Ok(Self {
            matcher: glob.compile_matcher(),
            segments: if explicit_dot {
                split_segments(normalized)
            } else {
                None
            },
        })
    }

    fn is_match(&self, path: &Path, dot: bool) -> bool {
        if dot || !has_dot_segment(path) {
            return self.matcher.is_match(path);
        }
        // Each dot segment of the path needs a pattern segment spelling the dot
        match &self.segments {
            Some(segments) => self.matcher.is_match(path) && segments_match(segments, path),
            None => false,
        }
    }
}

/// Compile each segment on its own. `None` if a segment does not stand
/// alone, e.g. a brace group spanning `/`.
fn split_segments(pattern: &str) -> Option<Vec<Segment>> {
    pattern
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .map(|segment| {
            if segment == "**" {
                return Some(Segment::Globstar);
            }
            let glob = GlobBuilder::new(segment)
                .literal_separator(true)
                .backslash_escape(true)
                .build()
                .ok()?;
            Some(Segment::Glob {
                matcher: glob.compile_matcher(),
                dot: segment.starts_with('.'),
            })
        })
        .collect()
}

/// Segment-wise match where wildcards and `**` never take a dot-prefixed name
fn segments_match(segments: &[Segment], path: &Path) -> bool {
    let names: Vec<String> = path
        .components()
        .filter_map(|c| match c {
            Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();

    let (n, m) = (segments.len(), names.len());
    // matches[i][j]: segments[i..] match names[j..]
    let mut matches = vec![vec![false; m + 1]; n + 1];
    matches[n][m] = true;
    for i in (0..n).rev() {
        for j in (0..=m).rev() {
            matches[i][j] = match &segments[i] {
                Segment::Globstar => {
                    matches[i + 1][j]
                        || (j < m && !names[j].starts_with('.') && matches[i][j + 1])
                }
                Segment::Glob { matcher, dot } => {
                    j < m
                        && (*dot || !names[j].starts_with('.'))
                        && matcher.is_match(names[j].as_str())
                        && matches[i + 1][j + 1]
                }
            };
        }
    }
    matches[0][0]
}

/// Compiled include/ignore configuration
#[derive(Clone)]
pub struct PathMatcher {
    globs: Vec<CompiledGlob>,
    ignore: Vec<PathPredicate>,
    ignore_files: Vec<Arc<Gitignore>>,
    dot: bool,
}

impl PathMatcher {
    /// Compile globs and ignore rules. Invalid patterns fail here, not at match time.
    pub fn new(globs: &[String], ignore: &[IgnoreRule], dot: bool) -> Result<Self, WatchError> {
        let globs = globs
            .iter()
            .map(|g| CompiledGlob::new(g))
            .collect::<Result<Vec<_>, _>>()?;

        let mut predicates: Vec<PathPredicate> = Vec::with_capacity(ignore.len());
        for rule in ignore {
            let predicate: PathPredicate = match rule {
                IgnoreRule::Glob(pattern) => {
                    let glob = CompiledGlob::new(pattern)?;
                    Arc::new(move |path: &Path| glob.is_match(path, false))
                }
                IgnoreRule::Pattern(regex) => {
                    let regex = regex.clone();
                    Arc::new(move |path: &Path| regex.is_match(&path.to_string_lossy()))
                }
                IgnoreRule::Predicate(f) => f.clone(),
            };
            predicates.push(predicate);
        }

        Ok(Self {
            globs,
            ignore: predicates,
            ignore_files: Vec::new(),
            dot,
        })
    }

    /// Matcher that accepts everything not dot-prefixed
    pub fn permissive() -> Self {
        Self {
            globs: Vec::new(),
            ignore: Vec::new(),
            ignore_files: Vec::new(),
            dot: false,
        }
    }

    /// Add a gitignore-style file, rooted at `root`
    pub fn add_ignore_file(&mut self, root: &Path, file: &Path) -> Result<(), WatchError> {
        let mut builder = GitignoreBuilder::new(root);
        if let Some(e) = builder.add(file) {
            return Err(WatchError::ConfigError {
                reason: format!("{}: {}", file.display(), e),
            });
        }
        let gitignore = builder.build().map_err(|e| WatchError::ConfigError {
            reason: format!("{}: {}", file.display(), e),
        })?;
        self.ignore_files.push(Arc::new(gitignore));
        Ok(())
    }

    /// Whether dot-prefixed segments are included by default
    pub fn dot(&self) -> bool {
        self.dot
    }

    /// Tier one alone: does any ignore rule exclude this path?
    pub fn ignored(&self, relative: &Path) -> bool {
        self.ignored_as(relative, false)
    }

    /// Same as [`PathMatcher::ignored`] with a known directory flag, which
    /// lets directory-only gitignore lines (`build/`) apply.
    pub fn ignored_as(&self, relative: &Path, is_dir: bool) -> bool {
        if self.ignore.iter().any(|rule| rule(relative)) {
            return true;
        }
        self.ignore_files.iter().any(|gitignore| {
            gitignore
                .matched_path_or_any_parents(relative, is_dir)
                .is_ignore()
        })
    }

    /// Full three-tier evaluation
    pub fn included(&self, relative: &Path) -> bool {
        self.included_as(relative, false)
    }

    pub fn included_as(&self, relative: &Path, is_dir: bool) -> bool {
        let relative = strip_cur_dir(relative);

        if self.ignored_as(&relative, is_dir) {
            return false;
        }

        if !self.globs.is_empty() {
            return self.globs.iter().any(|g| g.is_match(&relative, self.dot));
        }

        // Default `**/*`: everything, minus dotfiles unless asked for
        if relative.as_os_str().is_empty() {
            return self.dot;
        }
        self.dot || !has_dot_segment(&relative)
    }
}

impl fmt::Debug for PathMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathMatcher")
            .field("globs", &self.globs.len())
            .field("ignore", &self.ignore.len())
            .field("ignore_files", &self.ignore_files.len())
            .field("dot", &self.dot)
            .finish()
    }
}

/// Drop leading `./` components so `./a/b` and `a/b` match the same globs
fn strip_cur_dir(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

/// True if any segment starts with `.` (excluding `.` and `..` themselves)
pub(crate) fn has_dot_segment(path: &Path) -> bool {
    path.components().any(|c| match c {
        Component::Normal(name) => name.to_string_lossy().starts_with('.'),
        _ => false,
    })
}
