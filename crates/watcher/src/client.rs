//! Producer side of the external protocol
//!
//! `watchexec` describes the changes that triggered a run through environment
//! variables holding `:`-separated path lists, optionally relative to a common
//! prefix. This turns them into protocol lines for
//! [`crate::backend::external`].

use std::env;

/// Environment variable holding the prefix shared by every listed path
pub const COMMON_PATH_VAR: &str = "WATCHEXEC_COMMON_PATH";

/// Output order of the variable groups and the action each maps to
const GROUPS: &[(&str, &str)] = &[
    ("WATCHEXEC_CREATED_PATH", "create"),
    ("WATCHEXEC_REMOVED_PATH", "remove"),
    ("WATCHEXEC_RENAMED_PATH", "rename"),
    ("WATCHEXEC_WRITTEN_PATH", "write"),
];

/// Build protocol lines from variables fetched through `lookup`.
/// `None` when no change variable is set.
pub fn format_changes<F>(lookup: F) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    let prefix = lookup(COMMON_PATH_VAR).unwrap_or_default();

    let lines: Vec<String> = GROUPS
        .iter()
        .filter_map(|(var, action)| {
            lookup(var)
                .filter(|value| !value.is_empty())
                .map(|value| (*action, value))
        })
        .flat_map(|(action, value)| {
            value
                .split(':')
                .map(|path| format!("{} {}{}", action, prefix, path))
                .collect::<Vec<_>>()
        })
        .collect();

    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

/// [`format_changes`] over the process environment
pub fn format_from_env() -> Option<String> {
    format_changes(|var| env::var(var).ok())
}
