//! Run records.
//!
//! A [`Run`] is created at submission with one [`HostResult`] per resolved
//! target host and keeps exactly that set until it is archived. Host results
//! carry their [`TaskResult`]s in the flattened phase/task order of the
//! playbook.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::inventory::Host;
use crate::playbook::{ExecutionPolicy, Playbook};

/// Run identifier
pub type RunId = Uuid;

/// Overall run state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Submitted, no batch started yet
    Pending,
    /// Batches are being processed
    Running,
    /// Every host succeeded
    Completed,
    /// No host succeeded, or the run aborted before any success
    Failed,
    /// Some hosts succeeded and some did not
    Partial,
    /// Cancellation was requested before natural completion
    Cancelled,
}

impl RunStatus {
    /// Whether the run is finished
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Pending | RunStatus::Running)
    }

    /// Derive the terminal status from the host outcomes.
    pub fn conclude(hosts: &[HostResult], cancelled: bool) -> Self {
        if cancelled {
            return RunStatus::Cancelled;
        }
        let succeeded = hosts
            .iter()
            .filter(|h| h.status == HostStatus::Success)
            .count();
        if succeeded == 0 {
            RunStatus::Failed
        } else if succeeded == hosts.len() {
            RunStatus::Completed
        } else {
            RunStatus::Partial
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Partial => "partial",
            RunStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Per-host state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    /// Not started
    Pending,
    /// Executing tasks
    Running,
    /// All tasks done without an unhandled failure
    Success,
    /// Halted by an unhandled failure
    Failed,
    /// Never started, or stopped by cancellation/abort
    Skipped,
}

impl HostStatus {
    /// Whether the host reached a final state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            HostStatus::Success | HostStatus::Failed | HostStatus::Skipped
        )
    }
}

impl fmt::Display for HostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HostStatus::Pending => "pending",
            HostStatus::Running => "running",
            HostStatus::Success => "success",
            HostStatus::Failed => "failed",
            HostStatus::Skipped => "skipped",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of one task on one host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Desired state already held
    Ok,
    /// Remote state was (or would be) changed
    Changed,
    /// Executor reported failure
    Failed,
    /// Not executed
    Skipped,
    /// Host could not be reached
    Unreachable,
}

impl TaskStatus {
    /// Whether this outcome counts as a failure
    pub fn is_failure(&self) -> bool {
        matches!(self, TaskStatus::Failed | TaskStatus::Unreachable)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Ok => "ok",
            TaskStatus::Changed => "changed",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
            TaskStatus::Unreachable => "unreachable",
        };
        write!(f, "{}", s)
    }
}

/// Maximum bytes of stdout/stderr kept per task
pub const OUTPUT_EXCERPT_LIMIT: usize = 4096;

/// Keep the tail of command output, cut on a char boundary.
pub fn excerpt(output: &str) -> String {
    if output.len() <= OUTPUT_EXCERPT_LIMIT {
        return output.to_string();
    }
    let mut start = output.len() - OUTPUT_EXCERPT_LIMIT;
    while !output.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &output[start..])
}

/// Result of one task on one host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Task name
    pub task: String,
    /// Phase name
    pub phase: String,
    /// Task type
    pub task_type: String,
    /// Outcome
    pub status: TaskStatus,
    /// Human-readable message
    pub message: String,
    /// Standard output excerpt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    /// Standard error excerpt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    /// Exit code of the last command, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rc: Option<i32>,
    /// Wall time spent, retries included
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// Retries consumed
    pub retries: u32,
    /// Failure was tolerated through ignore_errors
    #[serde(default)]
    pub ignored: bool,
    /// Completion time
    pub timestamp: DateTime<Utc>,
}

impl TaskResult {
    /// A task that was not executed
    pub fn skipped(
        phase: impl Into<String>,
        task: impl Into<String>,
        task_type: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            task: task.into(),
            phase: phase.into(),
            task_type: task_type.into(),
            status: TaskStatus::Skipped,
            message: reason.into(),
            stdout: None,
            stderr: None,
            rc: None,
            duration: Duration::ZERO,
            retries: 0,
            ignored: false,
            timestamp: Utc::now(),
        }
    }
}

/// Outcome of an automatic rollback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackRecord {
    /// Checkpoint label restored (if one was recorded)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<String>,
    /// Whether the rollback succeeded
    pub success: bool,
    /// Detail
    pub message: String,
    /// When the rollback finished
    pub timestamp: DateTime<Utc>,
}

/// Result of the run on one host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostResult {
    /// Host name
    pub host: String,
    /// Host address
    pub address: String,
    /// Host state
    pub status: HostStatus,
    /// Batch index the host was scheduled in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch: Option<usize>,
    /// Task results in flattened playbook order
    pub tasks: Vec<TaskResult>,
    /// Error summary when failed or skipped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Automatic rollback, when one was attempted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<RollbackRecord>,
    /// When the host started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the host finished
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl HostResult {
    /// A pending result for `host`
    pub fn pending(host: &Host) -> Self {
        Self {
            host: host.name.clone(),
            address: host.address.clone(),
            status: HostStatus::Pending,
            batch: None,
            tasks: Vec::new(),
            error: None,
            rollback: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Find a task result by task name
    pub fn task(&self, name: &str) -> Option<&TaskResult> {
        self.tasks.iter().find(|t| t.task == name)
    }

    /// Task statuses in order
    pub fn statuses(&self) -> Vec<TaskStatus> {
        self.tasks.iter().map(|t| t.status).collect()
    }
}

/// Why a run stopped before processing every batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum AbortReason {
    /// Cumulative failures crossed max_failures
    FailureThreshold {
        /// Hosts failed so far
        failed: usize,
        /// Hosts processed so far
        processed: usize,
    },
    /// The canary batch had a failure
    CanaryFailed,
    /// The run-wide timeout elapsed
    Timeout,
    /// Cancellation was requested
    Cancelled,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::FailureThreshold { failed, processed } => write!(
                f,
                "failure threshold exceeded ({} of {} hosts failed)",
                failed, processed
            ),
            AbortReason::CanaryFailed => write!(f, "canary batch failed"),
            AbortReason::Timeout => write!(f, "run timeout exceeded"),
            AbortReason::Cancelled => write!(f, "run cancelled"),
        }
    }
}

/// A playbook run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Run id
    pub id: RunId,
    /// Playbook name
    pub playbook: String,
    /// Playbook version
    pub playbook_version: String,
    /// Resolved target hosts
    pub hosts: Vec<Host>,
    /// Policy snapshot
    pub policy: ExecutionPolicy,
    /// Run state
    pub status: RunStatus,
    /// Submission time
    pub created_at: DateTime<Utc>,
    /// When batch 1 started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the run became terminal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Number of planned batches
    #[serde(default)]
    pub batch_count: usize,
    /// Why the run stopped early
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<AbortReason>,
    /// One entry per target host, in target order
    pub host_results: Vec<HostResult>,
}

impl Run {
    /// A pending run
    pub fn new(id: RunId, playbook: &Playbook, hosts: Vec<Host>, policy: ExecutionPolicy) -> Self {
        let host_results = hosts.iter().map(HostResult::pending).collect();
        Self {
            id,
            playbook: playbook.name.clone(),
            playbook_version: playbook.version.clone(),
            hosts,
            policy,
            status: RunStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            batch_count: 0,
            abort_reason: None,
            host_results,
        }
    }

    /// Look up a host result
    pub fn host(&self, name: &str) -> Option<&HostResult> {
        self.host_results.iter().find(|h| h.host == name)
    }

    /// Counts for reporting
    pub fn summary(&self) -> RunSummary {
        let mut summary = RunSummary {
            total_hosts: self.host_results.len(),
            ..Default::default()
        };
        for host in &self.host_results {
            match host.status {
                HostStatus::Success => summary.hosts_success += 1,
                HostStatus::Failed => summary.hosts_failed += 1,
                HostStatus::Skipped => summary.hosts_skipped += 1,
                HostStatus::Pending | HostStatus::Running => summary.hosts_pending += 1,
            }
            for task in &host.tasks {
                match task.status {
                    TaskStatus::Ok => summary.tasks_ok += 1,
                    TaskStatus::Changed => summary.tasks_changed += 1,
                    TaskStatus::Failed => summary.tasks_failed += 1,
                    TaskStatus::Skipped => summary.tasks_skipped += 1,
                    TaskStatus::Unreachable => summary.tasks_unreachable += 1,
                }
            }
        }
        if let (Some(start), Some(end)) = (self.started_at, self.finished_at) {
            summary.duration = (end - start).to_std().ok();
        }
        summary
    }
}

/// Aggregate counts of a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Number of target hosts
    pub total_hosts: usize,
    /// Hosts that succeeded
    pub hosts_success: usize,
    /// Hosts that failed
    pub hosts_failed: usize,
    /// Hosts skipped
    pub hosts_skipped: usize,
    /// Hosts not yet terminal
    pub hosts_pending: usize,
    /// Tasks ok
    pub tasks_ok: usize,
    /// Tasks changed
    pub tasks_changed: usize,
    /// Tasks failed
    pub tasks_failed: usize,
    /// Tasks skipped
    pub tasks_skipped: usize,
    /// Tasks unreachable
    pub tasks_unreachable: usize,
    /// Wall time from first batch to completion
    #[serde(default, with = "humantime_serde")]
    pub duration: Option<Duration>,
}
