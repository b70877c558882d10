//! Run events
//!
//! Every state change the aggregator records is also published as a
//! [`RunEvent`]. Subscribers receive events from their subscription point
//! forward; the stream of one run ends with [`RunEvent::RunCompleted`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::run::{AbortReason, HostStatus, RunId, RunStatus, RunSummary, TaskResult};

/// Something that happened during a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    /// The scheduler began batch 1
    RunStarted {
        run_id: RunId,
        hosts: usize,
        batches: usize,
        timestamp: DateTime<Utc>,
    },
    /// A host state machine left `pending`
    HostStarted {
        run_id: RunId,
        host: String,
        batch: usize,
        timestamp: DateTime<Utc>,
    },
    /// A task reached a result on one host
    TaskCompleted {
        run_id: RunId,
        host: String,
        result: TaskResult,
    },
    /// A host reached a terminal state
    HostCompleted {
        run_id: RunId,
        host: String,
        status: HostStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        timestamp: DateTime<Utc>,
    },
    /// Every host of a batch is terminal
    BatchCompleted {
        run_id: RunId,
        batch: usize,
        /// Failed hosts across the run so far
        failed: usize,
        /// Processed hosts across the run so far
        processed: usize,
        timestamp: DateTime<Utc>,
    },
    /// The run is terminal; no further events follow
    RunCompleted {
        run_id: RunId,
        status: RunStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        abort_reason: Option<AbortReason>,
        summary: RunSummary,
        timestamp: DateTime<Utc>,
    },
}

impl RunEvent {
    /// Run this event belongs to
    pub fn run_id(&self) -> RunId {
        match self {
            RunEvent::RunStarted { run_id, .. }
            | RunEvent::HostStarted { run_id, .. }
            | RunEvent::TaskCompleted { run_id, .. }
            | RunEvent::HostCompleted { run_id, .. }
            | RunEvent::BatchCompleted { run_id, .. }
            | RunEvent::RunCompleted { run_id, .. } => *run_id,
        }
    }

    /// Short event name, as used in the serialized form
    pub fn kind(&self) -> &'static str {
        match self {
            RunEvent::RunStarted { .. } => "run_started",
            RunEvent::HostStarted { .. } => "host_started",
            RunEvent::TaskCompleted { .. } => "task_completed",
            RunEvent::HostCompleted { .. } => "host_completed",
            RunEvent::BatchCompleted { .. } => "batch_completed",
            RunEvent::RunCompleted { .. } => "run_completed",
        }
    }

    /// Whether this is the last event of its run
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunEvent::RunCompleted { .. })
    }

    /// Host the event concerns, if any
    pub fn host(&self) -> Option<&str> {
        match self {
            RunEvent::HostStarted { host, .. }
            | RunEvent::TaskCompleted { host, .. }
            | RunEvent::HostCompleted { host, .. } => Some(host),
            _ => None,
        }
    }
}

impl fmt::Display for RunEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunEvent::RunStarted { hosts, batches, .. } => {
                write!(f, "run started: {} hosts in {} batches", hosts, batches)
            }
            RunEvent::HostStarted { host, batch, .. } => {
                write!(f, "[{}] started (batch {})", host, batch + 1)
            }
            RunEvent::TaskCompleted { host, result, .. } => {
                write!(f, "[{}] {} => {}", host, result.task, result.status)?;
                if !result.message.is_empty() {
                    write!(f, ": {}", result.message)?;
                }
                Ok(())
            }
            RunEvent::HostCompleted { host, status, error, .. } => match error {
                Some(error) => write!(f, "[{}] {}: {}", host, status, error),
                None => write!(f, "[{}] {}", host, status),
            },
            RunEvent::BatchCompleted {
                batch,
                failed,
                processed,
                ..
            } => write!(
                f,
                "batch {} completed ({} of {} hosts failed so far)",
                batch + 1,
                failed,
                processed
            ),
            RunEvent::RunCompleted {
                status,
                abort_reason,
                ..
            } => match abort_reason {
                Some(reason) => write!(f, "run {}: {}", status, reason),
                None => write!(f, "run {}", status),
            },
        }
    }
}
