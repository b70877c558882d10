//! Audit trail for runs
//!
//! Every [`RunEvent`] published by the aggregator is fanned out to the
//! registered [`AuditSink`]s, and every terminal [`Run`] is handed to them
//! for archiving.
//!
//! # Example
//!
//! ```rust,ignore
//! use siemply::audit::{AuditManager, JsonLinesSink, RunArchive, TracingSink};
//!
//! let mut manager = AuditManager::new();
//! manager.add_sink(Arc::new(TracingSink));
//! manager.add_sink(Arc::new(JsonLinesSink::new("/var/log/siemply/audit.jsonl")?));
//! manager.add_sink(Arc::new(RunArchive::new("/var/lib/siemply/runs")?));
//! ```
//!
//! Sinks fail open by default: a broken sink is logged and skipped so an
//! audit problem never changes the outcome of a run.

mod sink;

pub use sink::{JsonLinesSink, RunArchive, TracingSink};

use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

use crate::events::RunEvent;
use crate::run::Run;

/// Audit sink errors
#[derive(Debug, Error)]
pub enum AuditError {
    /// Writing the trail failed
    #[error("audit I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serializing an event or run failed
    #[error("audit serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for audit sinks
pub type AuditResult<T> = std::result::Result<T, AuditError>;

/// Destination for run events and archived runs
pub trait AuditSink: Send + Sync {
    /// Sink name for diagnostics
    fn name(&self) -> &str;

    /// Record one event
    fn record(&self, event: &RunEvent) -> AuditResult<()>;

    /// Persist a terminal run
    fn archive(&self, _run: &Run) -> AuditResult<()> {
        Ok(())
    }

    /// Flush buffered output
    fn flush(&self) -> AuditResult<()> {
        Ok(())
    }
}

/// Fan-out over the registered sinks
#[derive(Clone, Default)]
pub struct AuditManager {
    sinks: Vec<Arc<dyn AuditSink>>,
    fail_closed: bool,
}

impl AuditManager {
    /// Create a manager without sinks
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink
    pub fn add_sink(&mut self, sink: Arc<dyn AuditSink>) {
        self.sinks.push(sink);
    }

    /// Builder variant of [`add_sink`](Self::add_sink)
    pub fn with_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.add_sink(sink);
        self
    }

    /// Return the first sink error instead of logging it
    pub fn set_fail_closed(&mut self, fail_closed: bool) {
        self.fail_closed = fail_closed;
    }

    /// Number of sinks
    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    /// Send an event to every sink
    pub fn record(&self, event: &RunEvent) -> AuditResult<()> {
        self.each(|sink| sink.record(event))
    }

    /// Archive a terminal run in every sink, then flush them
    pub fn archive(&self, run: &Run) -> AuditResult<()> {
        self.each(|sink| sink.archive(run))?;
        self.each(|sink| sink.flush())
    }

    fn each(&self, op: impl Fn(&dyn AuditSink) -> AuditResult<()>) -> AuditResult<()> {
        for sink in &self.sinks {
            if let Err(e) = op(sink.as_ref()) {
                if self.fail_closed {
                    return Err(e);
                }
                warn!(sink = sink.name(), error = %e, "audit sink failed");
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for AuditManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditManager")
            .field(
                "sinks",
                &self.sinks.iter().map(|s| s.name().to_string()).collect::<Vec<_>>(),
            )
            .field("fail_closed", &self.fail_closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::RunId;
    use chrono::Utc;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recording {
        events: Mutex<Vec<String>>,
    }

    impl AuditSink for Recording {
        fn name(&self) -> &str {
            "recording"
        }

        fn record(&self, event: &RunEvent) -> AuditResult<()> {
            self.events.lock().push(event.kind().to_string());
            Ok(())
        }
    }

    struct Broken;

    impl AuditSink for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn record(&self, _event: &RunEvent) -> AuditResult<()> {
            Err(AuditError::Io(std::io::Error::other("disk full")))
        }
    }

    fn started() -> RunEvent {
        RunEvent::RunStarted {
            run_id: RunId::new_v4(),
            hosts: 2,
            batches: 1,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_fan_out_fails_open() {
        let recording = Arc::new(Recording::default());
        let manager = AuditManager::new()
            .with_sink(Arc::new(Broken))
            .with_sink(recording.clone());

        assert!(manager.record(&started()).is_ok());
        assert_eq!(*recording.events.lock(), vec!["run_started".to_string()]);
    }

    #[test]
    fn test_fail_closed() {
        let mut manager = AuditManager::new().with_sink(Arc::new(Broken));
        manager.set_fail_closed(true);
        assert!(manager.record(&started()).is_err());
    }
}
