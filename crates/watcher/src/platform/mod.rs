//! Platform-specific timing for the native backend

use std::time::Duration;

/// Settle time between the end of the initial walk and `ready`.
///
/// FSEvents and ReadDirectoryChangesW deliver buffered notifications for
/// writes made just before the watch was registered; waiting lets that
/// initial storm drain before consumers start reacting.
#[cfg(any(target_os = "macos", target_os = "windows"))]
pub const NATIVE_READY_DELAY: Duration = Duration::from_millis(100);

/// inotify has no write-buffer lag
#[cfg(not(any(target_os = "macos", target_os = "windows")))]
pub const NATIVE_READY_DELAY: Duration = Duration::ZERO;

/// Polling compares modification times, which many filesystems record
/// with whole-second resolution.
pub const MTIME_RESOLUTION: Duration = Duration::from_secs(1);
