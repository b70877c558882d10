//! CLI module for Siemply
//!
//! Argument parsing and subcommand dispatch. The handlers live in
//! [`commands`]; terminal rendering lives in [`output`].

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Siemply - rolling Splunk operations over SSH
#[derive(Parser, Debug, Clone)]
#[command(name = "siemply")]
#[command(version)]
#[command(about = "Run Splunk maintenance playbooks across fleets in rolling batches", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the inventory file
    #[arg(short = 'i', long, global = true, env = "SIEMPLY_INVENTORY")]
    pub inventory: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short = 'v', long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Emit machine-readable JSON instead of human output
    #[arg(long, global = true)]
    pub json: bool,

    /// Log line format
    #[arg(long, global = true)]
    pub log_format: Option<LogFormat>,

    /// Path to configuration file
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,
}

/// Log line format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines
    Text,
    /// One JSON object per line
    Json,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run a playbook
    Run(commands::run::RunArgs),

    /// Run a playbook in dry-run mode
    Check(commands::run::RunArgs),

    /// Resolve a playbook against the task registry without touching hosts
    Validate(commands::validate::ValidateArgs),

    /// List the hosts a target pattern resolves to
    #[command(name = "list-hosts")]
    ListHosts(commands::inventory::ListHostsArgs),
}

impl Cli {
    /// Parse command-line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }

    /// Effective verbosity level (0-3)
    pub fn verbosity(&self) -> u8 {
        self.verbose.min(3)
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
    fn test_parse_run_flags() {
        let cli = Cli::try_parse_from([
            "siemply",
            "run",
            "upgrade.yml",
            "-i",
            "hosts.yml",
            "--limit",
            "uf1,uf2",
            "--batch-size",
            "2",
            "--batch-delay",
            "30s",
            "--strategy",
            "canary",
            "--max-failures",
            "10%",
            "--dry-run",
            "-vv",
        ])
        .unwrap();

        assert_eq!(cli.verbosity(), 2);
        assert_eq!(cli.inventory, Some(PathBuf::from("hosts.yml")));
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.limit, vec!["uf1".to_string(), "uf2".to_string()]);
        assert_eq!(args.batch_size, Some(2));
        assert_eq!(args.batch_delay, Some(std::time::Duration::from_secs(30)));
        assert!(args.dry_run);
    }

    #[test]
    fn test_parse_rejects_bad_strategy() {
        let parsed = Cli::try_parse_from(["siemply", "run", "p.yml", "--strategy", "random"]);
        assert!(parsed.is_err());
    }
}
