//! Run command - execute a playbook in rolling batches
//!
//! `check` shares these arguments and forces dry-run.

use anyhow::{Context, Result};
use clap::Parser;
use futures::StreamExt;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use super::{run_exit_code, CommandContext};
use siemply::inventory::{apply_limit, HostResolver};
use siemply::playbook::{ExecutionPolicy, Playbook};
use siemply::strategy::{CanarySize, MaxFailures, RollingStrategy};

fn parse_duration(value: &str) -> Result<Duration, humantime_serde::re::humantime::DurationError> {
    humantime_serde::re::humantime::parse_duration(value)
}

/// Arguments for the run and check commands
#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    /// Path to the playbook file
    #[arg(required = true)]
    pub playbook: PathBuf,

    /// Groups or hosts to target
    #[arg(long = "hosts", short = 'H', value_delimiter = ',', default_value = "all")]
    pub hosts: Vec<String>,

    /// Narrow the target to these hosts or groups
    #[arg(short = 'l', long, value_delimiter = ',')]
    pub limit: Vec<String>,

    /// Only run tasks with one of these tags
    #[arg(long, short = 't', value_delimiter = ',')]
    pub tags: Vec<String>,

    /// Skip tasks with any of these tags
    #[arg(long, value_delimiter = ',')]
    pub skip_tags: Vec<String>,

    /// Extra variables (key=value), overriding playbook vars
    #[arg(short = 'e', long = "extra-vars", action = clap::ArgAction::Append)]
    pub extra_vars: Vec<String>,

    /// Max concurrent hosts
    #[arg(short = 'f', long)]
    pub forks: Option<usize>,

    /// Max hosts per batch
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Soak time between batches (e.g. 30s, 5m)
    #[arg(long, value_parser = parse_duration)]
    pub batch_delay: Option<Duration>,

    /// Rolling strategy: simple, canary, indexers_last
    #[arg(long)]
    pub strategy: Option<RollingStrategy>,

    /// Canary batch size (count or percentage)
    #[arg(long)]
    pub canary: Option<CanarySize>,

    /// Failures tolerated before aborting (count or percentage)
    #[arg(long)]
    pub max_failures: Option<MaxFailures>,

    /// Whole-run timeout
    #[arg(long, value_parser = parse_duration)]
    pub timeout: Option<Duration>,

    /// Per-task timeout
    #[arg(long, value_parser = parse_duration)]
    pub task_timeout: Option<Duration>,

    /// Report what would change without touching hosts
    #[arg(long)]
    pub dry_run: bool,
}

impl RunArgs {
    /// Resolve the run policy: configuration, then playbook, then flags
    pub fn policy(&self, defaults: ExecutionPolicy, playbook: &Playbook, dry_run: bool) -> ExecutionPolicy {
        let mut policy = defaults.with_playbook_defaults(&playbook.execution);
        if let Some(forks) = self.forks {
            policy.forks = forks;
        }
        if let Some(batch_size) = self.batch_size {
            policy.batch_size = batch_size;
        }
        if let Some(delay) = self.batch_delay {
            policy.batch_delay = delay;
        }
        if let Some(strategy) = self.strategy {
            policy.strategy = strategy;
        }
        if let Some(canary) = self.canary {
            policy.canary = canary;
        }
        if let Some(max) = self.max_failures {
            policy.max_failures = Some(max);
        }
        if let Some(timeout) = self.timeout {
            policy.timeout = Some(timeout);
        }
        if let Some(timeout) = self.task_timeout {
            policy.task_timeout = timeout;
        }
        policy.tags.extend(self.tags.iter().cloned());
        policy.skip_tags.extend(self.skip_tags.iter().cloned());
        policy.dry_run = dry_run || self.dry_run;
        policy
    }

    /// Merge `key=value` pairs into the playbook vars; values parse as YAML
    pub fn apply_extra_vars(&self, playbook: &mut Playbook) -> Result<()> {
        for pair in &self.extra_vars {
            let (key, raw) = pair
                .split_once('=')
                .with_context(|| format!("extra var '{}' is not key=value", pair))?;
            let value: serde_json::Value = serde_yaml::from_str::<serde_yaml::Value>(raw)
                .ok()
                .and_then(|v| serde_json::to_value(v).ok())
                .unwrap_or_else(|| serde_json::Value::String(raw.to_string()));
            playbook.vars.insert(key.trim().to_string(), value);
        }
        Ok(())
    }

    /// Execute the run (or check) command
    pub async fn execute(&self, ctx: &mut CommandContext, dry_run: bool) -> Result<i32> {
        let mut playbook = Playbook::load(&self.playbook)?;
        self.apply_extra_vars(&mut playbook)?;

        let inventory = ctx.load_inventory()?;
        let mut hosts = inventory.resolve_hosts(&self.hosts)?;
        if !self.limit.is_empty() {
            hosts = apply_limit(hosts, &self.limit)?;
        }

        let policy = self.policy(ctx.config.default_policy(), &playbook, dry_run);
        ctx.output.banner(&format!("PLAYBOOK: {} {}", playbook.name, playbook.version));
        if policy.dry_run {
            ctx.output.warning("Running in DRY-RUN mode - no changes will be made");
        }

        let store = ctx.store()?;
        let (id, mut events) = store.submit_streaming(playbook, hosts, policy)?;
        info!(run_id = %id, "run started");

        let mut interrupted = false;
        loop {
            tokio::select! {
                event = events.next() => match event {
                    Some(event) => ctx.output.event(&event)?,
                    None => break,
                },
                signal = tokio::signal::ctrl_c(), if !interrupted => {
                    interrupted = true;
                    if let Err(e) = signal {
                        warn!(error = %e, "failed to listen for Ctrl-C");
                        continue;
                    }
                    ctx.output.warning("Interrupted, cancelling after in-flight tasks finish");
                    store.cancel(id)?;
                }
            }
        }

        let run = store.wait(id).await?;
        ctx.output.recap(&run)?;
        Ok(run_exit_code(run.status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use siemply::playbook::{Phase, Task};
    use siemply::strategy::CountOrPercent;

    fn args(extra: &[&str]) -> RunArgs {
        let mut argv = vec!["run", "upgrade.yml"];
        argv.extend_from_slice(extra);
        RunArgs::try_parse_from(argv).unwrap()
    }

    fn playbook() -> Playbook {
        Playbook::new("upgrade", vec![Phase::new("main", vec![Task::new("t", "command")])])
    }

    #[test]
    fn test_flags_override_playbook_and_config() {
        let mut pb = playbook();
        pb.execution.batch_size = Some(5);
        pb.execution.strategy = Some(RollingStrategy::Canary);

        let policy = args(&["--batch-size", "2", "--max-failures", "25%", "--tags", "precheck"])
            .policy(ExecutionPolicy::default(), &pb, false);

        assert_eq!(policy.batch_size, 2);
        assert_eq!(policy.strategy, RollingStrategy::Canary);
        assert_eq!(policy.max_failures, Some(CountOrPercent::Percent(25.0)));
        assert!(policy.tags.contains("precheck"));
        assert!(!policy.dry_run);
    }

    #[test]
    fn test_check_forces_dry_run() {
        let policy = args(&[]).policy(ExecutionPolicy::default(), &playbook(), true);
        assert!(policy.dry_run);
    }

    #[test]
    fn test_extra_vars() {
        let mut pb = playbook();
        args(&["-e", "target_version=9.1.2", "-e", "retries=3"])
            .apply_extra_vars(&mut pb)
            .unwrap();
        assert_eq!(pb.vars["target_version"], serde_json::json!("9.1.2"));
        assert_eq!(pb.vars["retries"], serde_json::json!(3));

        assert!(args(&["-e", "novalue"]).apply_extra_vars(&mut pb).is_err());
    }
}
