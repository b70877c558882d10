//! Built-in audit sinks

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;

use super::{AuditResult, AuditSink};
use crate::events::RunEvent;
use crate::run::Run;

/// Logs every event through `tracing` under the `siemply::audit` target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl AuditSink for TracingSink {
    fn name(&self) -> &str {
        "tracing"
    }

    fn record(&self, event: &RunEvent) -> AuditResult<()> {
        info!(
            target: "siemply::audit",
            run_id = %event.run_id(),
            event = event.kind(),
            host = event.host().unwrap_or("-"),
            "{}",
            event
        );
        Ok(())
    }
}

/// Appends one JSON document per event to a file
pub struct JsonLinesSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonLinesSink {
    /// Open (or create) the log file, creating parent directories
    pub fn new(path: impl AsRef<Path>) -> AuditResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    /// Log file location
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for JsonLinesSink {
    fn name(&self) -> &str {
        "jsonl"
    }

    fn record(&self, event: &RunEvent) -> AuditResult<()> {
        let line = serde_json::to_string(event)?;
        let mut writer = self.writer.lock();
        writeln!(writer, "{}", line)?;
        if event.is_terminal() {
            writer.flush()?;
        }
        Ok(())
    }

    fn flush(&self) -> AuditResult<()> {
        self.writer.lock().flush()?;
        Ok(())
    }
}

impl std::fmt::Debug for JsonLinesSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonLinesSink").field("path", &self.path).finish()
    }
}

/// Writes each terminal run to `<dir>/<run_id>.json`
#[derive(Debug, Clone)]
pub struct RunArchive {
    dir: PathBuf,
}

impl RunArchive {
    /// Use `dir`, creating it if needed
    pub fn new(dir: impl AsRef<Path>) -> AuditResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Archive location of a run
    pub fn path_for(&self, run: &Run) -> PathBuf {
        self.dir.join(format!("{}.json", run.id))
    }

    /// Read an archived run back
    pub fn load(&self, id: &str) -> AuditResult<Run> {
        let content = std::fs::read_to_string(self.dir.join(format!("{}.json", id)))?;
        Ok(serde_json::from_str(&content)?)
    }
}

impl AuditSink for RunArchive {
    fn name(&self) -> &str {
        "archive"
    }

    fn record(&self, _event: &RunEvent) -> AuditResult<()> {
        Ok(())
    }

    fn archive(&self, run: &Run) -> AuditResult<()> {
        let path = self.path_for(run);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(run)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playbook::{ExecutionPolicy, Phase, Playbook, Task};
    use crate::run::{RunId, RunStatus, RunSummary};
    use chrono::Utc;

    #[test]
    fn test_jsonl_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit/events.jsonl");
        let sink = JsonLinesSink::new(&path).unwrap();
        let id = RunId::new_v4();

        sink.record(&RunEvent::RunStarted {
            run_id: id,
            hosts: 1,
            batches: 1,
            timestamp: Utc::now(),
        })
        .unwrap();
        sink.record(&RunEvent::RunCompleted {
            run_id: id,
            status: RunStatus::Completed,
            abort_reason: None,
            summary: RunSummary::default(),
            timestamp: Utc::now(),
        })
        .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let kinds: Vec<String> = content
            .lines()
            .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["event"].to_string())
            .collect();
        assert_eq!(kinds, vec!["\"run_started\"", "\"run_completed\""]);
    }

    #[test]
    fn test_run_archive_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let archive = RunArchive::new(dir.path()).unwrap();
        let playbook = Playbook::new(
            "upgrade",
            vec![Phase::new("main", vec![Task::new("noop", "command").arg("cmd", "true")])],
        );
        let run = Run::new(
            RunId::new_v4(),
            &playbook,
            vec![crate::inventory::Host::new("uf1")],
            ExecutionPolicy::default(),
        );

        archive.archive(&run).unwrap();
        let loaded = archive.load(&run.id.to_string()).unwrap();
        assert_eq!(loaded, run);
    }
}
