//! Run Store
//!
//! Entry point for callers: submit a run, query it, cancel it, follow its
//! events. Runs stay in memory from submission until [`RunStore::archive`]
//! hands a finished run off to the audit sinks, which keep the durable copy.

use dashmap::DashMap;
use futures::stream::BoxStream;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::AuditManager;
use crate::error::{Error, Result};
use crate::events::RunEvent;
use crate::executor::{Aggregator, Engine, Scheduler};
use crate::inventory::Host;
use crate::playbook::{ExecutionPolicy, Playbook};
use crate::run::{Run, RunId};

/// Registry of submitted runs
pub struct RunStore {
    engine: Arc<Engine>,
    audit: AuditManager,
    runs: DashMap<RunId, Arc<Aggregator>>,
}

impl RunStore {
    /// Create a store executing runs on `engine`
    pub fn new(engine: Arc<Engine>, audit: AuditManager) -> Self {
        Self {
            engine,
            audit,
            runs: DashMap::new(),
        }
    }

    /// Validate and start a run.
    ///
    /// Configuration errors (unknown task type, malformed policy, empty
    /// target) are returned before a run is created. Must be called from
    /// within a Tokio runtime; the run proceeds in the background.
    pub fn submit(
        &self,
        playbook: Playbook,
        hosts: Vec<Host>,
        policy: ExecutionPolicy,
    ) -> Result<RunId> {
        let (scheduler, aggregator) = self.prepare(playbook, hosts, policy)?;
        tokio::spawn(scheduler.run());
        Ok(aggregator.id())
    }

    /// Like [`submit`](Self::submit), subscribing before the first batch
    /// starts so the stream carries every event of the run.
    pub fn submit_streaming(
        &self,
        playbook: Playbook,
        hosts: Vec<Host>,
        policy: ExecutionPolicy,
    ) -> Result<(RunId, BoxStream<'static, RunEvent>)> {
        let (scheduler, aggregator) = self.prepare(playbook, hosts, policy)?;
        let events = aggregator.subscribe();
        tokio::spawn(scheduler.run());
        Ok((aggregator.id(), events))
    }

    fn prepare(
        &self,
        playbook: Playbook,
        hosts: Vec<Host>,
        policy: ExecutionPolicy,
    ) -> Result<(Scheduler, Arc<Aggregator>)> {
        if hosts.is_empty() {
            return Err(Error::NoHosts);
        }
        let plan = Arc::new(self.engine.prepare(playbook, policy)?);

        let id = Uuid::new_v4();
        let run = Run::new(id, &plan.playbook, hosts, plan.policy.clone());
        let aggregator = Aggregator::new(run, self.audit.clone());
        self.runs.insert(id, Arc::clone(&aggregator));
        info!(run_id = %id, playbook = %plan.playbook.name, "run submitted");

        let scheduler = Scheduler::new(Arc::clone(&self.engine), plan, Arc::clone(&aggregator));
        Ok((scheduler, aggregator))
    }

    fn aggregator(&self, id: RunId) -> Result<Arc<Aggregator>> {
        self.runs
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::RunNotFound(id.to_string()))
    }

    /// Consistent snapshot of a run
    pub fn get_status(&self, id: RunId) -> Result<Run> {
        Ok(self.aggregator(id)?.snapshot())
    }

    /// Request cooperative cancellation. Cancelling a finished run is a no-op.
    pub fn cancel(&self, id: RunId) -> Result<()> {
        let aggregator = self.aggregator(id)?;
        if aggregator.cancel() {
            info!(run_id = %id, "cancellation requested");
        }
        Ok(())
    }

    /// Events of a run from now on, or a replay if it already ended
    pub fn stream_events(&self, id: RunId) -> Result<BoxStream<'static, RunEvent>> {
        Ok(self.aggregator(id)?.subscribe())
    }

    /// Wait for a run to become terminal
    pub async fn wait(&self, id: RunId) -> Result<Run> {
        let aggregator = self.aggregator(id)?;
        Ok(aggregator.wait().await)
    }

    /// Submit and wait in one call
    pub async fn execute(
        &self,
        playbook: Playbook,
        hosts: Vec<Host>,
        policy: ExecutionPolicy,
    ) -> Result<Run> {
        let id = self.submit(playbook, hosts, policy)?;
        self.wait(id).await
    }

    /// Evict a finished run once the audit sinks hold its archive.
    ///
    /// Active runs are refused. If the archive write fails the run stays in
    /// the store so it can be retried.
    pub fn archive(&self, id: RunId) -> Result<Run> {
        let aggregator = self.aggregator(id)?;
        let run = aggregator.snapshot();
        if !run.status.is_terminal() {
            return Err(Error::RunActive(id.to_string()));
        }
        aggregator.archive()?;
        self.runs.remove(&id);
        info!(run_id = %id, status = %run.status, "run archived and evicted");
        Ok(run)
    }

    /// Archive and evict every finished run, returning how many left the store
    pub fn prune(&self) -> usize {
        let finished: Vec<RunId> = self
            .runs
            .iter()
            .filter(|entry| entry.value().status().is_terminal())
            .map(|entry| *entry.key())
            .collect();
        finished
            .into_iter()
            .filter(|id| match self.archive(*id) {
                Ok(_) => true,
                Err(e) => {
                    warn!(run_id = %id, error = %e, "run kept in store");
                    false
                }
            })
            .count()
    }

    /// Snapshots of every run, oldest first
    pub fn list(&self) -> Vec<Run> {
        let mut runs: Vec<Run> = self.runs.iter().map(|entry| entry.value().snapshot()).collect();
        runs.sort_by_key(|run| run.created_at);
        runs
    }
}

impl std::fmt::Debug for RunStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunStore")
            .field("runs", &self.runs.len())
            .finish_non_exhaustive()
    }
}
