//! Batch Scheduler
//!
//! Partitions the target hosts into ordered batches and runs them strictly
//! one after another. Hosts within a batch run concurrently, bounded by the
//! run-wide `forks` pool. Between batches the scheduler checks the failure
//! threshold, the canary gate, cancellation and the run timeout, then soaks
//! for `batch_delay`.

use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use super::{Aggregator, Engine, HostRunner, HostUpdate, Plan};
use crate::inventory::Host;
use crate::playbook::ExecutionPolicy;
use crate::run::{AbortReason, HostStatus, Run};
use crate::strategy::RollingStrategy;

/// Split hosts into batches of indices into `hosts`.
///
/// - `simple`: input order, `batch_size` hosts per batch.
/// - `canary`: a first batch of the canary size (capped at `batch_size`),
///   then the rest in input order.
/// - `indexers_last`: non-indexers first, indexers after them; no batch
///   mixes the two.
pub fn partition(hosts: &[Host], policy: &ExecutionPolicy) -> Vec<Vec<usize>> {
    let size = policy.batch_size.max(1);
    let indices: Vec<usize> = (0..hosts.len()).collect();

    match policy.strategy {
        RollingStrategy::Simple => chunk(&indices, size),
        RollingStrategy::Canary => {
            let canary = policy.canary.of(hosts.len()).clamp(1, size).min(hosts.len());
            let (first, rest) = indices.split_at(canary);
            let mut batches = Vec::new();
            if !first.is_empty() {
                batches.push(first.to_vec());
            }
            batches.extend(chunk(rest, size));
            batches
        }
        RollingStrategy::IndexersLast => {
            let (indexers, others): (Vec<usize>, Vec<usize>) =
                indices.into_iter().partition(|&i| hosts[i].is_indexer());
            let mut batches = chunk(&others, size);
            batches.extend(chunk(&indexers, size));
            batches
        }
    }
}

fn chunk(indices: &[usize], size: usize) -> Vec<Vec<usize>> {
    indices.chunks(size).map(<[usize]>::to_vec).collect()
}

/// Drives one run from its first batch to its terminal state
pub struct Scheduler {
    engine: Arc<Engine>,
    plan: Arc<Plan>,
    aggregator: Arc<Aggregator>,
}

impl Scheduler {
    /// Create a scheduler for the run held by `aggregator`
    pub fn new(engine: Arc<Engine>, plan: Arc<Plan>, aggregator: Arc<Aggregator>) -> Self {
        Self {
            engine,
            plan,
            aggregator,
        }
    }

    /// Process every batch and return the terminal run
    #[instrument(skip(self), fields(run_id = %self.aggregator.id(), playbook = %self.plan.playbook.name))]
    pub async fn run(self) -> Run {
        let policy = &self.plan.policy;
        let hosts = self.aggregator.snapshot().hosts;
        let batches = partition(&hosts, policy);
        info!(
            hosts = hosts.len(),
            batches = batches.len(),
            strategy = %policy.strategy,
            dry_run = policy.dry_run,
            "run started"
        );
        self.aggregator.run_started(batches.len());

        let cancel = self.aggregator.cancellation();
        let halt = cancel.child_token();
        let timed_out = Arc::new(AtomicBool::new(false));
        let watchdog = policy.timeout.map(|limit| {
            let halt = halt.clone();
            let timed_out = Arc::clone(&timed_out);
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(limit) => {
                        warn!(timeout = ?limit, "run timeout exceeded");
                        timed_out.store(true, Ordering::SeqCst);
                        halt.cancel();
                    }
                    _ = halt.cancelled() => {}
                }
            })
        });

        let pool = Arc::new(Semaphore::new(policy.forks.max(1)));
        let mut failed = 0usize;
        let mut processed = 0usize;
        let mut abort: Option<AbortReason> = None;
        // Set only when the halt token cut work short
        let mut interrupted = false;

        for (number, batch) in batches.iter().enumerate() {
            if halt.is_cancelled() {
                interrupted = true;
                break;
            }
            info!(batch = number + 1, size = batch.len(), "starting batch");

            let statuses = self.run_batch(number, batch, &hosts, &pool, &halt).await;
            let batch_failed = statuses.iter().filter(|s| **s == HostStatus::Failed).count();
            // Hosts only end skipped when halted mid-list
            if statuses.contains(&HostStatus::Skipped) {
                interrupted = true;
            }
            failed += batch_failed;
            processed += batch.len();
            self.aggregator.batch_completed(number, failed, processed);
            info!(batch = number + 1, batch_failed, failed, processed, "batch completed");

            if policy.strategy == RollingStrategy::Canary && number == 0 && batch_failed > 0 {
                error!(failed = batch_failed, "canary batch failed, aborting run");
                abort = Some(AbortReason::CanaryFailed);
                break;
            }
            if let Some(max) = policy.max_failures {
                if max.exceeded(failed, processed) {
                    error!(failed, processed, threshold = %max, "failure threshold exceeded, aborting run");
                    abort = Some(AbortReason::FailureThreshold { failed, processed });
                    break;
                }
            }

            if number + 1 < batches.len() && !policy.batch_delay.is_zero() {
                info!(delay = ?policy.batch_delay, "soaking before next batch");
                tokio::select! {
                    _ = tokio::time::sleep(policy.batch_delay) => {}
                    _ = halt.cancelled() => {
                        interrupted = true;
                        break;
                    }
                }
            }
        }

        // A late cancel or timeout after the last host finished changes nothing
        if interrupted && cancel.is_cancelled() {
            abort = Some(AbortReason::Cancelled);
        } else if interrupted && timed_out.load(Ordering::SeqCst) && abort.is_none() {
            abort = Some(AbortReason::Timeout);
        }
        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }

        if let Some(reason) = &abort {
            let reason = reason.to_string();
            self.aggregator
                .skip_unstarted(|why| self.plan.skipped_results(why), &reason);
        }
        let run = self.aggregator.finish(abort);
        info!(status = %run.status, "run finished");
        run
    }

    /// Run one batch to completion and return each host's terminal state
    async fn run_batch(
        &self,
        number: usize,
        batch: &[usize],
        hosts: &[Host],
        pool: &Arc<Semaphore>,
        halt: &CancellationToken,
    ) -> Vec<HostStatus> {
        let handles: Vec<_> = batch
            .iter()
            .map(|&index| {
                let runner = HostRunner::new(
                    Arc::clone(&self.engine),
                    Arc::clone(&self.plan),
                    Arc::clone(&self.aggregator),
                    index,
                    hosts[index].clone(),
                    number,
                    halt.clone(),
                );
                let pool = Arc::clone(pool);
                tokio::spawn(async move {
                    // Closed only if the pool is dropped, which outlives the batch
                    let _permit = pool.acquire_owned().await.ok();
                    runner.run().await
                })
            })
            .collect();

        join_all(handles)
            .await
            .into_iter()
            .zip(batch)
            .map(|(joined, &index)| match joined {
                Ok(status) => status,
                Err(e) => {
                    error!(host = %hosts[index].name, error = %e, "host worker aborted");
                    self.aggregator.record(
                        index,
                        HostUpdate::Finished {
                            status: HostStatus::Failed,
                            error: Some(format!("host worker aborted: {}", e)),
                            rollback: None,
                        },
                    );
                    HostStatus::Failed
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditManager, AuditResult, AuditSink};
    use crate::checkpoint::TarCheckpointer;
    use crate::connection::{
        CommandResult, ConnectionResult, Connector, ExecuteOptions, Session, TransferOptions,
    };
    use crate::events::RunEvent;
    use crate::inventory::{AuthMaterial, MockAuthResolver};
    use crate::modules::ModuleRegistry;
    use crate::playbook::{Phase, Playbook, Task};
    use crate::run::{RunId, RunStatus};
    use crate::strategy::CountOrPercent;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use std::path::Path;
    use std::time::Duration;

    fn hosts(n: usize) -> Vec<Host> {
        (0..n).map(|i| Host::new(format!("h{}", i))).collect()
    }

    fn policy(strategy: RollingStrategy, batch_size: usize) -> ExecutionPolicy {
        ExecutionPolicy {
            strategy,
            batch_size,
            ..ExecutionPolicy::default()
        }
    }

    #[test]
    fn test_simple_partition() {
        let batches = partition(&hosts(5), &policy(RollingStrategy::Simple, 2));
        assert_eq!(batches, vec![vec![0, 1], vec![2, 3], vec![4]]);
    }

    #[test]
    fn test_canary_partition() {
        let mut p = policy(RollingStrategy::Canary, 3);
        p.canary = CountOrPercent::Count(1);
        assert_eq!(
            partition(&hosts(4), &p),
            vec![vec![0], vec![1, 2, 3]]
        );

        p.canary = CountOrPercent::Percent(50.0);
        assert_eq!(partition(&hosts(5), &p), vec![vec![0, 1, 2], vec![3, 4]]);

        p.canary = CountOrPercent::Count(10);
        assert_eq!(partition(&hosts(2), &p), vec![vec![0, 1]]);
    }

    #[test]
    fn test_indexers_last_partition() {
        let mut list = hosts(5);
        list[0] = Host::new("idx1").in_group("indexers");
        list[3] = Host::new("idx2").with_fact("splunk_type", "indexer");
        let batches = partition(&list, &policy(RollingStrategy::IndexersLast, 2));
        assert_eq!(batches, vec![vec![1, 2], vec![4], vec![0, 3]]);
    }

    proptest! {
        #[test]
        fn prop_partition_covers_every_host_once(
            n in 0usize..60,
            size in 1usize..12,
            strategy in prop_oneof![
                Just(RollingStrategy::Simple),
                Just(RollingStrategy::Canary),
                Just(RollingStrategy::IndexersLast),
            ],
            canary in 1usize..5,
        ) {
            let mut list = hosts(n);
            for (i, host) in list.iter_mut().enumerate() {
                if i % 3 == 0 {
                    *host = host.clone().in_group("indexers");
                }
            }
            let mut p = policy(strategy, size);
            p.canary = CountOrPercent::Count(canary);

            let batches = partition(&list, &p);
            let mut seen: Vec<usize> = batches.iter().flatten().copied().collect();
            prop_assert!(batches.iter().all(|b| !b.is_empty() && b.len() <= size));
            seen.sort_unstable();
            prop_assert_eq!(seen, (0..n).collect::<Vec<_>>());
        }
    }

    struct OkSession;

    #[async_trait]
    impl Session for OkSession {
        fn identifier(&self) -> &str {
            "ok"
        }

        async fn is_alive(&self) -> bool {
            true
        }

        async fn execute(
            &self,
            _command: &str,
            _options: Option<ExecuteOptions>,
        ) -> ConnectionResult<CommandResult> {
            Ok(CommandResult::success(String::new(), String::new()))
        }

        async fn put_file(
            &self,
            _content: &[u8],
            _remote_path: &Path,
            _options: Option<TransferOptions>,
        ) -> ConnectionResult<()> {
            Ok(())
        }

        async fn close(&self) -> ConnectionResult<()> {
            Ok(())
        }
    }

    struct OkConnector;

    #[async_trait]
    impl Connector for OkConnector {
        async fn open(
            &self,
            _host: &Host,
            _auth: &AuthMaterial,
            _connect_timeout: Duration,
        ) -> ConnectionResult<Box<dyn Session>> {
            Ok(Box::new(OkSession))
        }
    }

    /// Fires the run's cancellation token when the given batch completes
    struct CancelAfterBatch {
        batch: usize,
        token: Mutex<Option<CancellationToken>>,
    }

    impl AuditSink for CancelAfterBatch {
        fn name(&self) -> &str {
            "cancel-after-batch"
        }

        fn record(&self, event: &RunEvent) -> AuditResult<()> {
            if let RunEvent::BatchCompleted { batch, .. } = event {
                if *batch == self.batch {
                    if let Some(token) = self.token.lock().as_ref() {
                        token.cancel();
                    }
                }
            }
            Ok(())
        }
    }

    async fn run_with_cancel_after(batch: usize, targets: usize) -> Run {
        let mut auth = MockAuthResolver::new();
        auth.expect_resolve_auth()
            .returning(|_| Ok(AuthMaterial::user("root")));
        let checkpointer = Arc::new(TarCheckpointer::default());
        let engine = Arc::new(Engine::new(
            ModuleRegistry::with_builtins(&Default::default(), checkpointer.clone()),
            Arc::new(OkConnector),
            Arc::new(auth),
            checkpointer,
        ));
        let playbook = Playbook::new(
            "test",
            vec![Phase::new(
                "main",
                vec![Task::new("noop", "command").arg("cmd", "true")],
            )],
        );
        let policy = ExecutionPolicy {
            batch_delay: Duration::ZERO,
            ..policy(RollingStrategy::Simple, 1)
        };
        let plan = Arc::new(engine.prepare(playbook, policy).unwrap());

        let sink = Arc::new(CancelAfterBatch {
            batch,
            token: Mutex::new(None),
        });
        let aggregator = Aggregator::new(
            Run::new(RunId::new_v4(), &plan.playbook, hosts(targets), plan.policy.clone()),
            AuditManager::new().with_sink(sink.clone()),
        );
        *sink.token.lock() = Some(aggregator.cancellation());

        Scheduler::new(engine, plan, aggregator).run().await
    }

    #[tokio::test]
    async fn test_cancel_after_last_batch_keeps_completed() {
        let run = run_with_cancel_after(1, 2).await;
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.abort_reason, None);
    }

    #[tokio::test]
    async fn test_cancel_between_batches_stops_run() {
        let run = run_with_cancel_after(0, 3).await;
        assert_eq!(run.status, RunStatus::Cancelled);
        assert_eq!(run.abort_reason, Some(AbortReason::Cancelled));
        assert_eq!(run.host_results[0].status, HostStatus::Success);
        assert_eq!(run.host_results[1].status, HostStatus::Skipped);
        assert_eq!(run.host_results[2].status, HostStatus::Skipped);
    }
}
