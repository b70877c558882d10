//! Output formatting for the Siemply CLI
//!
//! Human mode prints colored, Ansible-style progress lines from the run
//! event stream and a recap at the end. JSON mode prints one event per line
//! followed by the terminal run record.

use colored::Colorize;
use serde::Serialize;
use std::time::Instant;

use siemply::events::RunEvent;
use siemply::run::{HostStatus, Run, RunStatus, TaskStatus};

/// Output formatter for the human and JSON modes
pub struct OutputFormatter {
    use_color: bool,
    json_mode: bool,
    verbosity: u8,
    start_time: Instant,
}

impl OutputFormatter {
    /// Create a new output formatter
    pub fn new(use_color: bool, json_mode: bool, verbosity: u8) -> Self {
        // Respect NO_COLOR environment variable
        let use_color = use_color && std::env::var("NO_COLOR").is_err();
        Self {
            use_color,
            json_mode,
            verbosity,
            start_time: Instant::now(),
        }
    }

    /// Whether JSON output was requested
    pub fn is_json(&self) -> bool {
        self.json_mode
    }

    /// Print a banner/header
    pub fn banner(&self, title: &str) {
        if self.json_mode {
            return;
        }
        let line = "=".repeat(title.len() + 4);
        if self.use_color {
            println!("\n{}", line.bright_blue());
            println!("{}", format!("  {}  ", title).bright_blue().bold());
            println!("{}\n", line.bright_blue());
        } else {
            println!("\n{}\n  {}  \n{}\n", line, title, line);
        }
    }

    /// Print an informational line
    pub fn info(&self, message: &str) {
        if self.json_mode {
            return;
        }
        println!("{}", message);
    }

    /// Print a warning to stderr
    pub fn warning(&self, message: &str) {
        if self.use_color {
            eprintln!("{} {}", "[WARNING]".yellow().bold(), message);
        } else {
            eprintln!("[WARNING] {}", message);
        }
    }

    /// Print an error to stderr
    pub fn error(&self, message: &str) {
        if self.use_color {
            eprintln!("{} {}", "[ERROR]".red().bold(), message);
        } else {
            eprintln!("[ERROR] {}", message);
        }
    }

    /// Print any serializable value as JSON on stdout
    pub fn json<T: Serialize>(&self, value: &T, pretty: bool) -> anyhow::Result<()> {
        let text = if pretty {
            serde_json::to_string_pretty(value)?
        } else {
            serde_json::to_string(value)?
        };
        println!("{}", text);
        Ok(())
    }

    fn paint_task(&self, status: TaskStatus) -> String {
        let label = match status {
            TaskStatus::Skipped => "skipping".to_string(),
            other => other.to_string(),
        };
        if !self.use_color {
            return label;
        }
        match status {
            TaskStatus::Ok => label.green().to_string(),
            TaskStatus::Changed => label.yellow().to_string(),
            TaskStatus::Skipped => label.cyan().to_string(),
            TaskStatus::Failed | TaskStatus::Unreachable => label.red().bold().to_string(),
        }
    }

    fn paint_host(&self, status: HostStatus) -> String {
        let label = status.to_string();
        if !self.use_color {
            return label;
        }
        match status {
            HostStatus::Success => label.green().to_string(),
            HostStatus::Failed => label.red().bold().to_string(),
            HostStatus::Skipped => label.cyan().to_string(),
            HostStatus::Pending | HostStatus::Running => label,
        }
    }

    fn paint_run(&self, status: RunStatus) -> String {
        let label = status.to_string().to_uppercase();
        if !self.use_color {
            return label;
        }
        match status {
            RunStatus::Completed => label.green().bold().to_string(),
            RunStatus::Partial | RunStatus::Cancelled => label.yellow().bold().to_string(),
            RunStatus::Failed => label.red().bold().to_string(),
            RunStatus::Pending | RunStatus::Running => label,
        }
    }

    /// Print one run event
    pub fn event(&self, event: &RunEvent) -> anyhow::Result<()> {
        if self.json_mode {
            return self.json(event, false);
        }

        match event {
            RunEvent::RunStarted { hosts, batches, .. } => {
                println!("Targeting {} hosts in {} batches", hosts, batches);
            }
            RunEvent::HostStarted { host, batch, .. } => {
                if self.verbosity >= 1 {
                    println!("[{}] started in batch {}", host, batch + 1);
                }
            }
            RunEvent::TaskCompleted { host, result, .. } => {
                if result.status == TaskStatus::Skipped && self.verbosity == 0 {
                    return Ok(());
                }
                let mut line = format!(
                    "{}: [{}] {} ({})",
                    self.paint_task(result.status),
                    host,
                    result.task,
                    result.task_type
                );
                if result.ignored {
                    line.push_str(" ...ignoring");
                }
                if !result.message.is_empty()
                    && (result.status.is_failure() || self.verbosity >= 1)
                {
                    line.push_str(&format!(" => {}", result.message));
                }
                println!("{}", line);
                if self.verbosity >= 2 {
                    if let Some(stdout) = result.stdout.as_deref().filter(|s| !s.is_empty()) {
                        println!("    stdout: {}", stdout.trim_end());
                    }
                    if let Some(stderr) = result.stderr.as_deref().filter(|s| !s.is_empty()) {
                        println!("    stderr: {}", stderr.trim_end());
                    }
                }
            }
            RunEvent::HostCompleted {
                host,
                status,
                error,
                ..
            } => match error {
                Some(error) => println!("[{}] {}: {}", host, self.paint_host(*status), error),
                None => println!("[{}] {}", host, self.paint_host(*status)),
            },
            RunEvent::BatchCompleted {
                batch,
                failed,
                processed,
                ..
            } => {
                let header = format!("BATCH {} DONE ({} of {} hosts failed)", batch + 1, failed, processed);
                let stars = "*".repeat(80_usize.saturating_sub(header.len() + 1));
                if self.use_color {
                    println!("\n{} {}\n", header.bright_white().bold(), stars.bright_black());
                } else {
                    println!("\n{} {}\n", header, stars);
                }
            }
            RunEvent::RunCompleted { .. } => {}
        }
        Ok(())
    }

    /// Print the final recap
    pub fn recap(&self, run: &Run) -> anyhow::Result<()> {
        if self.json_mode {
            return self.json(run, true);
        }

        self.banner("RUN RECAP");
        for host in &run.host_results {
            let count = |status: TaskStatus| host.tasks.iter().filter(|t| t.status == status).count();
            println!(
                "{:<30} : {:<10} ok={:<4} changed={:<4} failed={:<4} skipped={:<4} unreachable={}",
                host.host,
                self.paint_host(host.status),
                count(TaskStatus::Ok),
                count(TaskStatus::Changed),
                count(TaskStatus::Failed),
                count(TaskStatus::Skipped),
                count(TaskStatus::Unreachable),
            );
            if let Some(rollback) = &host.rollback {
                println!("{:<30}   rollback: {}", "", rollback.message);
            }
        }

        let summary = run.summary();
        println!();
        println!(
            "Run {} {} ({} hosts: {} succeeded, {} failed, {} skipped)",
            run.id,
            self.paint_run(run.status),
            summary.total_hosts,
            summary.hosts_success,
            summary.hosts_failed,
            summary.hosts_skipped,
        );
        if let Some(reason) = &run.abort_reason {
            println!("Aborted: {}", reason);
        }
        let elapsed = summary.duration.unwrap_or_else(|| self.start_time.elapsed());
        println!("Finished in {:.2}s", elapsed.as_secs_f64());
        Ok(())
    }
}
