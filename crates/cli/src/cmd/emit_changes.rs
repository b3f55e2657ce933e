//! Producer half of the external backend
//!
//! Invoked by the change service (watchexec by default) on every batch of
//! changes; prints one `<action> <path>` line per changed path.

use anyhow::Result;
use std::io::Write;

pub fn run() -> Result<()> {
    if let Some(lines) = treewatch::client::format_from_env() {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{}", lines)?;
        stdout.flush()?;
    }
    Ok(())
}
