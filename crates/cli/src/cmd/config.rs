//! Show the effective watch configuration
//!
//! Config file and flags are merged exactly as `run` and `events` merge them,
//! then validated without starting a watcher.

use super::WatchArgs;
use anyhow::{Context, Result};
use owo_colors::OwoColorize;

pub fn run(args: &WatchArgs) -> Result<()> {
    let dir = args.dir()?;
    let config = args.config()?;
    let options = config
        .clone()
        .into_options()
        .context("Invalid watch configuration")?;
    let backend = options.validate().context("Invalid watch configuration")?;
    // Compiles globs and reads ignore files
    options
        .matcher(&dir)
        .context("Invalid watch configuration")?;

    println!("{}", "Watch Configuration".bold());
    println!("{}: {}", "Root".dimmed(), dir.display().dimmed());
    if let Some(path) = &args.config {
        println!("{}: {}", "File".dimmed(), path.display().dimmed());
    }

    println!("\n{}", "[watch]".yellow());
    println!("  {} = {}", "backend".cyan(), backend);
    println!("  {} = {}", "glob".cyan(), list(&config.glob));
    println!("  {} = {}", "ignore".cyan(), list(&config.ignore));
    if !config.ignore_regex.is_empty() {
        println!("  {} = {}", "ignore_regex".cyan(), list(&config.ignore_regex));
    }
    if !config.ignore_files.is_empty() {
        let files: Vec<String> = config
            .ignore_files
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        println!("  {} = {}", "ignore_files".cyan(), list(&files));
    }
    println!("  {} = {}", "dot".cyan(), config.dot);
    println!("  {} = {}", "follow_links".cyan(), config.follow_links);
    println!(
        "  {} = {}",
        "debounce".cyan(),
        format!("{}ms", options.debounce_for(backend).as_millis()).dimmed()
    );
    println!(
        "  {} = {}",
        "ready_delay".cyan(),
        format!("{}ms", options.ready_delay_for(backend).as_millis()).dimmed()
    );
    match backend {
        treewatch::BackendKind::Poll => {
            let interval = config
                .interval_ms
                .unwrap_or(treewatch::options::DEFAULT_INTERVAL.as_millis() as u64);
            println!("  {} = {}", "interval_ms".cyan(), interval);
        }
        treewatch::BackendKind::External => {
            println!(
                "  {} = {}",
                "command".cyan(),
                options.external_command().join(" ")
            );
        }
        treewatch::BackendKind::Native | treewatch::BackendKind::Custom => {}
    }

    Ok(())
}

fn list(items: &[String]) -> String {
    if items.is_empty() {
        "(none)".to_string()
    } else {
        format!("[{}]", items.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list() {
        assert_eq!(list(&[]), "(none)");
        assert_eq!(
            list(&["**/*.rs".to_string(), "*.toml".to_string()]),
            "[**/*.rs, *.toml]"
        );
    }

    #[test]
    fn test_rejects_bad_glob() {
        let args = WatchArgs {
            dir: Some(std::env::temp_dir()),
            glob: vec!["src/[".to_string()],
            ..Default::default()
        };
        assert!(run(&args).is_err());
    }
}
