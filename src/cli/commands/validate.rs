//! Validate command - resolve a playbook without touching any host

use anyhow::Result;
use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;

use super::CommandContext;
use siemply::playbook::Playbook;

/// Arguments for the validate command
#[derive(Parser, Debug, Clone)]
pub struct ValidateArgs {
    /// Playbook file to validate
    pub playbook: PathBuf,
}

#[derive(Debug, Serialize)]
struct TaskLine<'a> {
    phase: &'a str,
    task: &'a str,
    task_type: &'a str,
    tags: Vec<&'a str>,
}

impl ValidateArgs {
    /// Check the playbook structure, every task type and the resulting policy
    pub async fn execute(&self, ctx: &mut CommandContext) -> Result<i32> {
        let playbook = Playbook::load(&self.playbook)?;
        let registry = ctx.registry();
        registry.resolve_playbook(&playbook)?;
        ctx.config
            .default_policy()
            .with_playbook_defaults(&playbook.execution)
            .validate()?;

        let tasks: Vec<TaskLine<'_>> = playbook
            .tasks()
            .map(|(phase, task)| TaskLine {
                phase: &phase.name,
                task: &task.name,
                task_type: &task.task_type,
                tags: task.tags.iter().map(String::as_str).collect(),
            })
            .collect();

        if ctx.output.is_json() {
            ctx.output.json(
                &serde_json::json!({
                    "playbook": playbook.name,
                    "version": playbook.version,
                    "valid": true,
                    "tasks": tasks,
                }),
                true,
            )?;
            return Ok(0);
        }

        ctx.output.banner(&format!("PLAYBOOK: {} {}", playbook.name, playbook.version));
        for line in &tasks {
            let tags = if line.tags.is_empty() {
                String::new()
            } else {
                format!(" [{}]", line.tags.join(", "))
            };
            ctx.output.info(&format!(
                "  {} / {} ({}){}",
                line.phase, line.task, line.task_type, tags
            ));
        }
        ctx.output.info(&format!(
            "\n{} tasks in {} phases: valid",
            tasks.len(),
            playbook.phases.len()
        ));
        Ok(0)
    }
}
