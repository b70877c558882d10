//! Inventory command - list the hosts a target resolves to

use anyhow::Result;
use clap::Parser;

use super::CommandContext;
use siemply::inventory::{apply_limit, HostResolver};

/// Arguments for the list-hosts command
#[derive(Parser, Debug, Clone)]
pub struct ListHostsArgs {
    /// Groups or hosts to resolve
    #[arg(value_delimiter = ',', default_value = "all")]
    pub pattern: Vec<String>,

    /// Narrow the result to these hosts or groups
    #[arg(short = 'l', long, value_delimiter = ',')]
    pub limit: Vec<String>,

    /// Show host facts
    #[arg(long)]
    pub facts: bool,
}

impl ListHostsArgs {
    /// Execute the list-hosts command
    pub async fn execute(&self, ctx: &mut CommandContext) -> Result<i32> {
        let inventory = ctx.load_inventory()?;
        let mut hosts = inventory.resolve_hosts(&self.pattern)?;
        if !self.limit.is_empty() {
            hosts = apply_limit(hosts, &self.limit)?;
        }

        if ctx.output.is_json() {
            ctx.output.json(&hosts, true)?;
            return Ok(0);
        }

        ctx.output.info(&format!("  hosts ({}):", hosts.len()));
        for host in &hosts {
            let groups: Vec<&str> = host.groups.iter().map(String::as_str).collect();
            let role = if host.is_indexer() { " indexer" } else { "" };
            ctx.output.info(&format!(
                "    {} ({}:{}) [{}]{}",
                host.name,
                host.address,
                host.port,
                groups.join(", "),
                role
            ));
            if self.facts {
                for (key, value) in &host.facts {
                    ctx.output.info(&format!("        {} = {}", key, value));
                }
            }
        }
        Ok(0)
    }
}
