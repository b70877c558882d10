//! Subcommands module for the Siemply CLI
//!
//! [`CommandContext`] owns the loaded configuration and knows how to build
//! the collaborators every subcommand needs: the inventory, the task
//! registry and a [`RunStore`] wired to SSH, secrets and audit sinks.

pub mod inventory;
pub mod run;
pub mod validate;

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;

use crate::cli::output::OutputFormatter;
use crate::cli::Cli;
use siemply::audit::{AuditManager, JsonLinesSink, RunArchive, TracingSink};
use siemply::checkpoint::{Checkpointer, TarCheckpointer};
use siemply::config::Config;
use siemply::connection::russh::SshConnector;
use siemply::connection::Connector;
use siemply::executor::Engine;
use siemply::inventory::{AuthResolver, Inventory, InventoryAuthResolver};
use siemply::modules::ModuleRegistry;
use siemply::run::RunStatus;
use siemply::store::RunStore;

/// Exit status for a finished run
pub fn run_exit_code(status: RunStatus) -> i32 {
    match status {
        RunStatus::Completed => 0,
        RunStatus::Partial => 2,
        RunStatus::Failed => 3,
        RunStatus::Cancelled => 4,
        // A run handed back by the store is terminal
        RunStatus::Pending | RunStatus::Running => 1,
    }
}

/// Common context shared between commands
pub struct CommandContext {
    /// Configuration
    pub config: Config,
    /// Output formatter
    pub output: OutputFormatter,
    /// Inventory path from the command line
    pub inventory_path: Option<PathBuf>,
}

impl CommandContext {
    /// Create a new command context from CLI arguments
    pub fn new(cli: &Cli, config: Config) -> Self {
        Self {
            config,
            output: OutputFormatter::new(!cli.no_color, cli.json, cli.verbosity()),
            inventory_path: cli.inventory.clone(),
        }
    }

    /// Effective inventory path: command line, then configuration
    pub fn inventory(&self) -> Option<&PathBuf> {
        self.inventory_path
            .as_ref()
            .or_else(|| self.config.inventory_path())
    }

    /// Load the inventory
    pub fn load_inventory(&self) -> Result<Inventory> {
        let path = self
            .inventory()
            .context("no inventory given (use -i or set defaults.inventory)")?;
        Ok(Inventory::load(path)?)
    }

    fn checkpointer(&self) -> Arc<dyn Checkpointer> {
        let splunk = &self.config.splunk;
        Arc::new(TarCheckpointer::new(
            splunk.checkpoint_dir.clone(),
            vec![format!("{}/etc", splunk.splunk_home.trim_end_matches('/'))],
        ))
    }

    /// Task registry with every built-in executor
    pub fn registry(&self) -> ModuleRegistry {
        ModuleRegistry::with_builtins(&self.config.splunk, self.checkpointer())
    }

    /// Audit fan-out configured from the `audit` section
    pub fn audit(&self) -> Result<AuditManager> {
        let settings = &self.config.audit;
        let mut audit = AuditManager::new();
        if !settings.enabled {
            return Ok(audit);
        }
        audit.add_sink(Arc::new(TracingSink));
        if let Some(path) = &settings.log_path {
            let sink = JsonLinesSink::new(path)
                .with_context(|| format!("failed to open audit log {}", path.display()))?;
            audit.add_sink(Arc::new(sink));
        }
        if let Some(dir) = &settings.archive_dir {
            let archive = RunArchive::new(dir)
                .with_context(|| format!("failed to prepare run archive {}", dir.display()))?;
            audit.add_sink(Arc::new(archive));
        }
        Ok(audit)
    }

    /// A run store executing over SSH
    pub fn store(&self) -> Result<RunStore> {
        let connector: Arc<dyn Connector> = Arc::new(SshConnector::new(self.config.ssh.clone()));
        let auth: Arc<dyn AuthResolver> = Arc::new(
            InventoryAuthResolver::new(
                self.config.defaults.remote_user.clone(),
                self.config.ssh.private_key_file.clone(),
            )
            .with_agent(self.config.ssh.use_agent),
        );
        let checkpointer = self.checkpointer();
        let registry = ModuleRegistry::with_builtins(&self.config.splunk, Arc::clone(&checkpointer));
        let engine = Arc::new(Engine::new(registry, connector, auth, checkpointer));
        Ok(RunStore::new(engine, self.audit()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_exit_codes() {
        assert_eq!(run_exit_code(RunStatus::Completed), 0);
        assert_eq!(run_exit_code(RunStatus::Partial), 2);
        assert_eq!(run_exit_code(RunStatus::Failed), 3);
        assert_eq!(run_exit_code(RunStatus::Cancelled), 4);
    }
}
