//! Checkpoints and rollback.
//!
//! A checkpoint is a named archive of selected remote paths stored on the
//! host itself. The most recent checkpoint of a host is kept in its fact
//! table under [`LAST_CHECKPOINT`] so a later critical failure can restore it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::connection::{escape_shell_arg, ConnectionError, Session};
use crate::inventory::Host;

/// Fact key holding the most recent [`CheckpointRef`] of a host
pub const LAST_CHECKPOINT: &str = "last_checkpoint";

/// Checkpoint and rollback failures
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Checkpoint '{label}' failed on {host}: {message}")]
    CheckpointFailed {
        host: String,
        label: String,
        message: String,
    },

    #[error("Rollback to '{label}' failed on {host}: {message}")]
    RollbackFailed {
        host: String,
        label: String,
        message: String,
    },

    #[error("No checkpoint recorded for {0}")]
    NoCheckpoint(String),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// A restorable snapshot on one host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRef {
    /// Checkpoint label
    pub label: String,
    /// Host name
    pub host: String,
    /// Archive location on the host
    pub location: String,
    /// Absolute paths captured
    pub paths: Vec<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl CheckpointRef {
    /// Read a checkpoint reference back from a fact value
    pub fn from_fact(value: &serde_json::Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    /// Fact value for this reference
    pub fn to_fact(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Takes and restores checkpoints over a session.
#[async_trait]
pub trait Checkpointer: Send + Sync {
    /// Snapshot `paths` on `host` under `label`
    async fn checkpoint(
        &self,
        session: &dyn Session,
        host: &Host,
        label: &str,
        paths: &[String],
    ) -> Result<CheckpointRef, CheckpointError>;

    /// Restore a snapshot taken by [`checkpoint`](Self::checkpoint)
    async fn rollback(
        &self,
        session: &dyn Session,
        host: &Host,
        checkpoint: &CheckpointRef,
    ) -> Result<(), CheckpointError>;

    /// Paths captured when a task names none
    fn default_paths(&self) -> &[String];
}

/// Checkpointer that tars paths into a directory on the host
#[derive(Debug, Clone)]
pub struct TarCheckpointer {
    base_dir: String,
    default_paths: Vec<String>,
}

impl Default for TarCheckpointer {
    fn default() -> Self {
        Self::new("/opt/siemply/checkpoints", vec!["/opt/splunk/etc".to_string()])
    }
}

impl TarCheckpointer {
    /// Store archives under `base_dir`
    pub fn new(base_dir: impl Into<String>, default_paths: Vec<String>) -> Self {
        Self {
            base_dir: base_dir.into().trim_end_matches('/').to_string(),
            default_paths,
        }
    }

    /// Archive path for a label
    pub fn location(&self, label: &str) -> String {
        let safe: String = label
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}/{}.tar.gz", self.base_dir, safe)
    }
}

fn relative(path: &str) -> String {
    escape_shell_arg(path.trim_start_matches('/'))
}

#[async_trait]
impl Checkpointer for TarCheckpointer {
    async fn checkpoint(
        &self,
        session: &dyn Session,
        host: &Host,
        label: &str,
        paths: &[String],
    ) -> Result<CheckpointRef, CheckpointError> {
        let failed = |message: String| CheckpointError::CheckpointFailed {
            host: host.name.clone(),
            label: label.to_string(),
            message,
        };
        if paths.is_empty() {
            return Err(failed("no paths to capture".into()));
        }
        if let Some(rel) = paths.iter().find(|p| !p.starts_with('/')) {
            return Err(failed(format!("path '{}' is not absolute", rel)));
        }

        let location = self.location(label);
        let members: Vec<String> = paths.iter().map(|p| relative(p)).collect();
        let command = format!(
            "mkdir -p {} && tar -czf {} -C / {}",
            escape_shell_arg(&self.base_dir),
            escape_shell_arg(&location),
            members.join(" ")
        );
        debug!(host = %host.name, label, %location, "Creating checkpoint");
        let result = session.execute(&command, None).await?;
        if !result.success {
            return Err(failed(result.stderr.trim().to_string()));
        }

        info!(host = %host.name, label, %location, "Checkpoint created");
        Ok(CheckpointRef {
            label: label.to_string(),
            host: host.name.clone(),
            location,
            paths: paths.to_vec(),
            created_at: Utc::now(),
        })
    }

    async fn rollback(
        &self,
        session: &dyn Session,
        host: &Host,
        checkpoint: &CheckpointRef,
    ) -> Result<(), CheckpointError> {
        let failed = |message: String| CheckpointError::RollbackFailed {
            host: host.name.clone(),
            label: checkpoint.label.clone(),
            message,
        };
        let archive = escape_shell_arg(&checkpoint.location);
        let command = format!("test -f {archive} && tar -xzf {archive} -C /");
        info!(host = %host.name, label = %checkpoint.label, "Rolling back to checkpoint");
        let result = session.execute(&command, None).await?;
        if result.success {
            Ok(())
        } else if result.stderr.trim().is_empty() {
            Err(failed(format!("archive {} not found", checkpoint.location)))
        } else {
            Err(failed(result.stderr.trim().to_string()))
        }
    }

    fn default_paths(&self) -> &[String] {
        &self.default_paths
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_sanitizes_label() {
        let cp = TarCheckpointer::new("/var/cp/", vec![]);
        assert_eq!(cp.location("pre upgrade/9.1"), "/var/cp/pre_upgrade_9.1.tar.gz");
    }

    #[test]
    fn test_ref_fact_round_trip() {
        let r = CheckpointRef {
            label: "pre".into(),
            host: "h1".into(),
            location: "/x/pre.tar.gz".into(),
            paths: vec!["/opt/splunk/etc".into()],
            created_at: Utc::now(),
        };
        assert_eq!(CheckpointRef::from_fact(&r.to_fact()), Some(r));
        assert_eq!(CheckpointRef::from_fact(&serde_json::json!("nope")), None);
    }
}
