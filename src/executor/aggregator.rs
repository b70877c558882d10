//! Run Aggregator
//!
//! The single writer of a [`Run`] record. Host workers and the scheduler
//! report deltas here; readers get consistent snapshots at any time. Every
//! recorded change is published as a [`RunEvent`] while the write lock is
//! held, so event order always matches record order.

use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::audit::{AuditManager, AuditResult};
use crate::events::RunEvent;
use crate::run::{
    AbortReason, HostStatus, RollbackRecord, Run, RunId, RunStatus, TaskResult,
};

const EVENT_CAPACITY: usize = 1024;

/// A change to one host's result
#[derive(Debug, Clone)]
pub enum HostUpdate {
    /// The host's worker began
    Started { batch: usize },
    /// The next task in playbook order has a result
    Task(TaskResult),
    /// The host reached a terminal state
    Finished {
        status: HostStatus,
        error: Option<String>,
        rollback: Option<RollbackRecord>,
    },
}

/// Single aggregation point for one run
pub struct Aggregator {
    run: RwLock<Run>,
    events: broadcast::Sender<RunEvent>,
    done: watch::Sender<bool>,
    audit: AuditManager,
    archived: AtomicBool,
    cancel: CancellationToken,
}

impl Aggregator {
    /// Take ownership of a pending run
    pub fn new(run: Run, audit: AuditManager) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (done, _) = watch::channel(false);
        Arc::new(Self {
            run: RwLock::new(run),
            events,
            done,
            audit,
            archived: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        })
    }

    /// Run id
    pub fn id(&self) -> RunId {
        self.run.read().id
    }

    /// Consistent copy of the run as recorded so far
    pub fn snapshot(&self) -> Run {
        self.run.read().clone()
    }

    /// Current run state
    pub fn status(&self) -> RunStatus {
        self.run.read().status
    }

    /// The run's cancellation flag
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request cooperative cancellation. No effect on a terminal run.
    pub fn cancel(&self) -> bool {
        if self.status().is_terminal() {
            return false;
        }
        self.cancel.cancel();
        true
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn publish(&self, event: RunEvent) {
        if let Err(e) = self.audit.record(&event) {
            warn!(error = %e, "failed to record audit event");
        }
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Batch 1 is about to start
    pub fn run_started(&self, batches: usize) {
        let mut run = self.run.write();
        run.status = RunStatus::Running;
        run.started_at = Some(Utc::now());
        run.batch_count = batches;
        self.publish(RunEvent::RunStarted {
            run_id: run.id,
            hosts: run.host_results.len(),
            batches,
            timestamp: Utc::now(),
        });
    }

    /// Apply a delta to the host at `index` of the target list
    pub fn record(&self, index: usize, update: HostUpdate) {
        let mut run = self.run.write();
        let run_id = run.id;
        let Some(host) = run.host_results.get_mut(index) else {
            warn!(%run_id, index, "update for unknown host index dropped");
            return;
        };
        if host.status.is_terminal() {
            warn!(%run_id, host = %host.host, "update for finished host dropped");
            return;
        }

        let event = match update {
            HostUpdate::Started { batch } => {
                host.status = HostStatus::Running;
                host.batch = Some(batch);
                host.started_at = Some(Utc::now());
                RunEvent::HostStarted {
                    run_id,
                    host: host.host.clone(),
                    batch,
                    timestamp: Utc::now(),
                }
            }
            HostUpdate::Task(result) => {
                host.tasks.push(result.clone());
                RunEvent::TaskCompleted {
                    run_id,
                    host: host.host.clone(),
                    result,
                }
            }
            HostUpdate::Finished {
                status,
                error,
                rollback,
            } => {
                host.status = status;
                host.error = error.clone();
                host.rollback = rollback;
                host.finished_at = Some(Utc::now());
                RunEvent::HostCompleted {
                    run_id,
                    host: host.host.clone(),
                    status,
                    error,
                    timestamp: Utc::now(),
                }
            }
        };
        self.publish(event);
    }

    /// A batch finished; `failed` and `processed` are run-wide totals
    pub fn batch_completed(&self, batch: usize, failed: usize, processed: usize) {
        let run = self.run.read();
        self.publish(RunEvent::BatchCompleted {
            run_id: run.id,
            batch,
            failed,
            processed,
            timestamp: Utc::now(),
        });
    }

    /// Mark every host that never started as skipped.
    ///
    /// Their task lists are filled with skipped results so each host still
    /// carries the full playbook order.
    pub fn skip_unstarted(&self, skipped: impl Fn(&str) -> Vec<TaskResult>, reason: &str) {
        let mut run = self.run.write();
        let run_id = run.id;
        let mut events = Vec::new();
        for host in run
            .host_results
            .iter_mut()
            .filter(|h| h.status == HostStatus::Pending)
        {
            host.status = HostStatus::Skipped;
            host.tasks = skipped(reason);
            host.error = Some(reason.to_string());
            host.finished_at = Some(Utc::now());
            events.push(RunEvent::HostCompleted {
                run_id,
                host: host.host.clone(),
                status: HostStatus::Skipped,
                error: Some(reason.to_string()),
                timestamp: Utc::now(),
            });
        }
        for event in events {
            self.publish(event);
        }
    }

    /// Make the run terminal, archive it and end the event stream
    pub fn finish(&self, abort_reason: Option<AbortReason>) -> Run {
        let finished = {
            let mut run = self.run.write();
            if run.status.is_terminal() {
                return run.clone();
            }
            let cancelled = matches!(abort_reason, Some(AbortReason::Cancelled));
            run.status = RunStatus::conclude(&run.host_results, cancelled);
            run.abort_reason = abort_reason.clone();
            run.finished_at = Some(Utc::now());
            if run.started_at.is_none() {
                run.started_at = run.finished_at;
            }
            self.publish(RunEvent::RunCompleted {
                run_id: run.id,
                status: run.status,
                abort_reason,
                summary: run.summary(),
                timestamp: Utc::now(),
            });
            run.clone()
        };

        match self.audit.archive(&finished) {
            Ok(()) => self.archived.store(true, Ordering::SeqCst),
            Err(e) => warn!(run_id = %finished.id, error = %e, "failed to archive run"),
        }
        debug!(run_id = %finished.id, status = %finished.status, "run finished");
        self.done.send_replace(true);
        finished
    }

    /// Whether the terminal run reached the audit sinks
    pub fn is_archived(&self) -> bool {
        self.archived.load(Ordering::SeqCst)
    }

    /// Retry archiving a terminal run whose archive in `finish` failed
    pub fn archive(&self) -> AuditResult<()> {
        if self.is_archived() {
            return Ok(());
        }
        self.audit.archive(&self.snapshot())?;
        self.archived.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Wait until the run is terminal and return it
    pub async fn wait(&self) -> Run {
        let mut done = self.done.subscribe();
        // Only fails if the sender is gone, which cannot outlive self
        let _ = done.wait_for(|finished| *finished).await;
        self.snapshot()
    }

    /// Events from now on, ending with `RunCompleted`.
    ///
    /// For a run that already ended, a replay of its terminal state.
    pub fn subscribe(&self) -> BoxStream<'static, RunEvent> {
        let run = self.run.read();
        if run.status.is_terminal() {
            return stream::iter(replay(&run)).boxed();
        }
        let rx = self.events.subscribe();
        drop(run);

        stream::unfold((rx, false), |(mut rx, ended)| async move {
            if ended {
                return None;
            }
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let last = event.is_terminal();
                        return Some((event, (rx, last)));
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "event subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}

impl std::fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let run = self.run.read();
        f.debug_struct("Aggregator")
            .field("run_id", &run.id)
            .field("status", &run.status)
            .finish_non_exhaustive()
    }
}

/// Terminal state of a run expressed as events
fn replay(run: &Run) -> Vec<RunEvent> {
    let mut events = vec![RunEvent::RunStarted {
        run_id: run.id,
        hosts: run.host_results.len(),
        batches: run.batch_count,
        timestamp: run.started_at.unwrap_or(run.created_at),
    }];
    for host in &run.host_results {
        if let (Some(batch), Some(started)) = (host.batch, host.started_at) {
            events.push(RunEvent::HostStarted {
                run_id: run.id,
                host: host.host.clone(),
                batch,
                timestamp: started,
            });
        }
        events.extend(host.tasks.iter().map(|task| RunEvent::TaskCompleted {
            run_id: run.id,
            host: host.host.clone(),
            result: task.clone(),
        }));
        events.push(RunEvent::HostCompleted {
            run_id: run.id,
            host: host.host.clone(),
            status: host.status,
            error: host.error.clone(),
            timestamp: host.finished_at.unwrap_or_else(Utc::now),
        });
    }
    events.push(RunEvent::RunCompleted {
        run_id: run.id,
        status: run.status,
        abort_reason: run.abort_reason.clone(),
        summary: run.summary(),
        timestamp: run.finished_at.unwrap_or_else(Utc::now),
    });
    events
}
