//! treewatch CLI - run commands or print events when a directory tree changes

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod cmd;

use cmd::WatchArgs;

/// treewatch - Watch a directory tree for changes
#[derive(Parser)]
#[command(name = "treewatch")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// More log output on stderr (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a shell command on start and on every change
    Run {
        /// Command passed to the shell
        command: String,

        #[command(flatten)]
        watch: WatchArgs,

        /// Ignore further changes for this many seconds after each run
        #[arg(short, long, default_value = "0")]
        wait: f64,

        /// Stop the previous run before starting the next
        #[arg(short, long)]
        kill: bool,

        /// Signal used by --kill
        #[arg(short = 's', long, default_value = "SIGTERM")]
        kill_signal: String,
    },
    /// Print add/change/delete events until interrupted
    Events {
        #[command(flatten)]
        watch: WatchArgs,

        /// One JSON object per line
        #[arg(long)]
        json: bool,
    },
    /// Show the effective watch configuration
    Config {
        #[command(flatten)]
        watch: WatchArgs,
    },
    /// Print pending changes from watchexec environment variables
    EmitChanges,
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    // stdout carries protocol lines for emit-changes
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Run {
            command,
            watch,
            wait,
            kill,
            kill_signal,
        } => cmd::run::run(command, &watch, cmd::seconds(wait), kill, &kill_signal).await,
        Commands::Events { watch, json } => cmd::events::run(&watch, json).await,
        Commands::Config { watch } => cmd::config::run(&watch),
        Commands::EmitChanges => cmd::emit_changes::run(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_arguments() {
        let cli = Cli::parse_from([
            "treewatch", "run", "make test", "src", "-g", "**/*.rs", "-g", "*.toml", "-w", "1.5",
            "-k", "-s", "KILL",
        ]);
        match cli.command {
            Commands::Run {
                command,
                watch,
                wait,
                kill,
                kill_signal,
            } => {
                assert_eq!(command, "make test");
                assert_eq!(watch.dir.as_deref(), Some(std::path::Path::new("src")));
                assert_eq!(watch.glob, vec!["**/*.rs", "*.toml"]);
                assert_eq!(wait, 1.5);
                assert!(kill);
                assert_eq!(kill_signal, "KILL");
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_poll_conflicts_with_external() {
        let result = Cli::try_parse_from(["treewatch", "events", "--poll", "--external"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_verbose_is_global() {
        let cli = Cli::parse_from(["treewatch", "events", "-vv", "--json"]);
        assert_eq!(cli.verbose, 2);
    }
}
