//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// HiJot reminder engine - due-task reminders and response caching for the todo widget
#[derive(Parser, Debug)]
#[command(name = "hijot-reminder")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "HIJOT_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Base URL of the todo API
    #[arg(long, env = "HIJOT_API_URL", global = true)]
    pub api_url: Option<String>,

    /// Directory for durable local storage
    #[arg(long, env = "HIJOT_STORAGE_DIR", global = true)]
    pub storage_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "HIJOT_LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "HIJOT_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to running the scheduler)
    #[command(subcommand)]
    pub command: Option<Command>,
}

impl Cli {
    /// Whether this invocation runs the scheduler and its stdio bridge
    #[must_use]
    pub fn runs_scheduler(&self) -> bool {
        matches!(self.command, None | Some(Command::Run))
    }
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the reminder scheduler with the stdio IPC bridge (default)
    Run,

    /// Show the task the scheduler would arm next
    Next,

    /// Show task counts
    Stats {
        /// Skip the cache and fetch fresh counts
        #[arg(long)]
        fresh: bool,
    },

    /// Response cache commands
    #[command(subcommand)]
    Cache(CacheCommand),

    /// Print the effective configuration as YAML
    Config,
}

/// Cache subcommands
#[derive(Subcommand, Debug)]
pub enum CacheCommand {
    /// List cached keys
    List,

    /// Remove every cached entry
    Clear,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_run() {
        let cli = Cli::try_parse_from(["hijot-reminder"]).unwrap();
        assert!(cli.command.is_none());
        assert!(cli.runs_scheduler());
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_only_run_owns_stdin() {
        assert!(Cli::try_parse_from(["hijot-reminder", "run"]).unwrap().runs_scheduler());
        for args in [&["hijot-reminder", "next"][..], &["hijot-reminder", "stats"], &["hijot-reminder", "cache", "list"]] {
            assert!(!Cli::try_parse_from(args.iter().copied()).unwrap().runs_scheduler());
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "hijot-reminder",
            "cache",
            "clear",
            "--storage-dir",
            "/tmp/hijot",
            "--api-url",
            "http://127.0.0.1:4000/api",
        ])
        .unwrap();

        assert!(matches!(cli.command, Some(Command::Cache(CacheCommand::Clear))));
        assert_eq!(cli.storage_dir, Some(PathBuf::from("/tmp/hijot")));
        assert_eq!(cli.api_url.as_deref(), Some("http://127.0.0.1:4000/api"));
    }

    #[test]
    fn test_stats_fresh_flag() {
        let cli = Cli::try_parse_from(["hijot-reminder", "stats", "--fresh"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Stats { fresh: true })));
    }
}
