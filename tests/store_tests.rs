//! Run store: submission, status, cancellation and event streams

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::*;
use futures::StreamExt;
use pretty_assertions::assert_eq;
use siemply::audit::{AuditError, AuditManager, AuditResult, AuditSink, JsonLinesSink, RunArchive};
use siemply::error::Error;
use siemply::events::RunEvent;
use siemply::playbook::Task;
use siemply::run::{AbortReason, HostStatus, Run, RunStatus, TaskStatus};
use uuid::Uuid;

#[tokio::test]
async fn test_submit_rejects_bad_input_before_touching_hosts() {
    let connector = MockConnector::new();
    let store = store(&connector);

    let unknown = playbook(vec![Task::new("mystery", "teleport")]);
    let err = store
        .submit(unknown, hosts(&["a"]), policy(1))
        .unwrap_err();
    assert!(matches!(err, Error::UnknownTaskType { .. }));

    let err = store
        .submit(playbook(vec![command("x", "echo x")]), Vec::new(), policy(1))
        .unwrap_err();
    assert!(matches!(err, Error::NoHosts));

    let err = store
        .submit(playbook(vec![command("x", "echo x")]), hosts(&["a"]), policy(0))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidPolicy(_)));

    let err = store
        .submit(playbook(vec![Task::new("no cmd", "command")]), hosts(&["a"]), policy(1))
        .unwrap_err();
    assert!(matches!(err, Error::PlaybookValidation(_)));

    assert!(store.list().is_empty());
    assert_eq!(connector.total_opens(), 0);
}

#[tokio::test]
async fn test_unknown_run_id() {
    let store = store(&MockConnector::new());
    let id = Uuid::new_v4();

    assert!(matches!(store.get_status(id), Err(Error::RunNotFound(_))));
    assert!(matches!(store.cancel(id), Err(Error::RunNotFound(_))));
    assert!(store.stream_events(id).is_err());
}

#[tokio::test]
async fn test_status_snapshot_after_completion() {
    let connector = MockConnector::new();
    let store = store(&connector);
    let pb = playbook(vec![command("one", "echo one")]);

    let id = store.submit(pb.clone(), hosts(&["a", "b"]), policy(2)).unwrap();
    let run = store.wait(id).await.unwrap();
    let status = store.get_status(id).unwrap();

    assert_eq!(run, status);
    assert_eq!(status.id, id);
    assert_eq!(status.playbook, "test");
    assert_eq!(status.status, RunStatus::Completed);
    assert_eq!(status.policy, policy(2));
    assert!(status.started_at.is_some());
    assert!(status.finished_at >= status.started_at);
    assert_eq!(status.host_results.len(), 2);

    // Cancelling a finished run is a no-op
    store.cancel(id).unwrap();
    assert_eq!(store.get_status(id).unwrap().status, RunStatus::Completed);
}

#[tokio::test]
async fn test_event_stream_order() {
    let connector = MockConnector::new();
    let store = store(&connector);
    let pb = playbook(vec![command("one", "echo one"), command("two", "echo two")]);

    let (id, events) = store
        .submit_streaming(pb, hosts(&["a", "b", "c"]), policy(2))
        .unwrap();
    let events: Vec<RunEvent> = events.collect().await;

    assert!(events.iter().all(|e| e.run_id() == id));
    assert_eq!(events.first().map(RunEvent::kind), Some("run_started"));
    assert_eq!(events.last().map(RunEvent::kind), Some("run_completed"));
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);

    let count = |kind: &str| events.iter().filter(|e| e.kind() == kind).count();
    assert_eq!(count("host_started"), 3);
    assert_eq!(count("task_completed"), 6);
    assert_eq!(count("host_completed"), 3);
    assert_eq!(count("batch_completed"), 2);

    // Per host: started, its tasks in order, completed
    for host in ["a", "b", "c"] {
        let kinds: Vec<&str> = events
            .iter()
            .filter(|e| e.host() == Some(host))
            .map(RunEvent::kind)
            .collect();
        assert_eq!(
            kinds,
            vec!["host_started", "task_completed", "task_completed", "host_completed"]
        );
    }

    // Batch 1 completes before any host of batch 2 starts
    let first_batch_done = events
        .iter()
        .position(|e| matches!(e, RunEvent::BatchCompleted { batch: 0, .. }))
        .unwrap();
    let c_started = events
        .iter()
        .position(|e| matches!(e, RunEvent::HostStarted { host, .. } if host == "c"))
        .unwrap();
    assert!(first_batch_done < c_started);
}

#[tokio::test]
async fn test_late_subscriber_gets_replay() {
    let connector = MockConnector::new();
    let store = store(&connector);
    let pb = playbook(vec![command("one", "echo one"), command("two", "exit 1")]);

    let id = store.submit(pb, hosts(&["a", "b"]), policy(1)).unwrap();
    store.wait(id).await.unwrap();

    let replay: Vec<RunEvent> = store.stream_events(id).unwrap().collect().await;
    assert_eq!(replay.first().map(RunEvent::kind), Some("run_started"));
    match replay.last() {
        Some(RunEvent::RunCompleted { status, summary, .. }) => {
            assert_eq!(*status, RunStatus::Failed);
            assert_eq!(summary.hosts_failed, 2);
            assert_eq!(summary.tasks_ok, 2);
        }
        other => panic!("expected run_completed, got {:?}", other),
    }
    let tasks = replay.iter().filter(|e| e.kind() == "task_completed").count();
    assert_eq!(tasks, 4);

    // Replays are repeatable
    let again: Vec<RunEvent> = store.stream_events(id).unwrap().collect().await;
    assert_eq!(again.len(), replay.len());
}

#[tokio::test]
async fn test_cancel_during_second_batch() {
    let connector = MockConnector::new();
    connector.set_delay(Duration::from_millis(100));
    let store = Arc::new(store(&connector));
    let pb = playbook(vec![command("one", "echo one"), command("two", "echo two")]);
    let targets = hosts(&["a1", "a2", "b1", "b2", "c1", "c2"]);

    let (id, mut events) = store.submit_streaming(pb.clone(), targets, policy(2)).unwrap();
    while let Some(event) = events.next().await {
        if matches!(event, RunEvent::HostStarted { batch: 1, .. }) {
            store.cancel(id).unwrap();
            break;
        }
    }
    let run = store.wait(id).await.unwrap();

    assert_eq!(run.status, RunStatus::Cancelled);
    assert_eq!(run.abort_reason, Some(AbortReason::Cancelled));
    assert_task_order(&run, &pb);
    for name in ["a1", "a2"] {
        assert_eq!(run.host(name).unwrap().status, HostStatus::Success);
    }
    for name in ["b1", "b2"] {
        // In-flight commands finish; later tasks are skipped
        let host = run.host(name).unwrap();
        assert_eq!(host.status, HostStatus::Skipped);
        assert_eq!(host.tasks[1].status, TaskStatus::Skipped);
    }
    for name in ["c1", "c2"] {
        let host = run.host(name).unwrap();
        assert_eq!(host.status, HostStatus::Skipped);
        assert!(host.tasks.iter().all(|t| t.status == TaskStatus::Skipped));
        assert_eq!(connector.opens(name), 0);
    }
    assert_eq!(connector.active(), 0);
}

#[tokio::test]
async fn test_cancel_interrupts_soak() {
    let connector = MockConnector::new();
    let store = Arc::new(store(&connector));
    let mut policy = policy(1);
    policy.batch_delay = Duration::from_secs(600);

    let (id, mut events) = store
        .submit_streaming(
            playbook(vec![command("one", "echo one")]),
            hosts(&["a", "b"]),
            policy,
        )
        .unwrap();
    while let Some(event) = events.next().await {
        if matches!(event, RunEvent::BatchCompleted { batch: 0, .. }) {
            store.cancel(id).unwrap();
            break;
        }
    }

    let run = tokio::time::timeout(Duration::from_secs(5), store.wait(id))
        .await
        .expect("cancel must end the soak")
        .unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
    assert_eq!(run.host("b").unwrap().status, HostStatus::Skipped);
}

#[tokio::test]
async fn test_audit_sinks_receive_trail_and_archive() {
    let dir = tempfile::tempdir().unwrap();
    let trail = dir.path().join("audit.jsonl");
    let archive_dir = dir.path().join("runs");
    let recording = Arc::new(RecordingSink::default());

    let audit = AuditManager::new()
        .with_sink(recording.clone())
        .with_sink(Arc::new(JsonLinesSink::new(&trail).unwrap()))
        .with_sink(Arc::new(RunArchive::new(&archive_dir).unwrap()));

    let connector = MockConnector::new();
    let store = store_with_audit(&connector, audit);
    let run = store
        .execute(
            playbook(vec![command("one", "echo one")]),
            hosts(&["a"]),
            policy(1),
        )
        .await
        .unwrap();

    assert_eq!(
        recording.kinds(),
        vec![
            "run_started",
            "host_started",
            "task_completed",
            "host_completed",
            "batch_completed",
            "run_completed"
        ]
    );
    assert_eq!(recording.archived.lock().len(), 1);

    let lines: Vec<RunEvent> = std::fs::read_to_string(&trail)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(lines.len(), 6);
    assert!(lines.last().unwrap().is_terminal());

    let archived = RunArchive::new(&archive_dir)
        .unwrap()
        .load(&run.id.to_string())
        .unwrap();
    assert_eq!(archived, run);
}

#[tokio::test]
async fn test_list_returns_every_run() {
    let connector = MockConnector::new();
    let store = store(&connector);
    let pb = playbook(vec![command("one", "echo one")]);

    let first = store.execute(pb.clone(), hosts(&["a"]), policy(1)).await.unwrap();
    let second = store.execute(pb, hosts(&["b"]), policy(1)).await.unwrap();

    let ids: Vec<_> = store.list().into_iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![first.id, second.id]);
}

/// Archive sink that fails until `healthy` is set
#[derive(Default)]
struct FlakyArchive {
    healthy: AtomicBool,
    archived: AtomicUsize,
}

impl AuditSink for FlakyArchive {
    fn name(&self) -> &str {
        "flaky"
    }

    fn record(&self, _event: &RunEvent) -> AuditResult<()> {
        Ok(())
    }

    fn archive(&self, _run: &Run) -> AuditResult<()> {
        if !self.healthy.load(Ordering::SeqCst) {
            return Err(AuditError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )));
        }
        self.archived.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_archive_evicts_finished_run() {
    let connector = MockConnector::new();
    connector.set_delay(Duration::from_millis(100));
    let recording = Arc::new(RecordingSink::default());
    let store = store_with_audit(&connector, AuditManager::new().with_sink(recording.clone()));
    let pb = playbook(vec![command("one", "echo one")]);

    let id = store.submit(pb, hosts(&["a"]), policy(1)).unwrap();
    assert!(matches!(store.archive(id), Err(Error::RunActive(_))));
    assert_eq!(store.list().len(), 1);

    let finished = store.wait(id).await.unwrap();
    let evicted = store.archive(id).unwrap();

    assert_eq!(evicted, finished);
    assert_eq!(recording.archived.lock().len(), 1);
    assert!(matches!(store.get_status(id), Err(Error::RunNotFound(_))));
    assert!(matches!(store.archive(id), Err(Error::RunNotFound(_))));
    assert!(store.list().is_empty());
}

#[tokio::test]
async fn test_failed_archive_keeps_run_until_retry() {
    let sink = Arc::new(FlakyArchive::default());
    let mut audit = AuditManager::new().with_sink(sink.clone());
    audit.set_fail_closed(true);
    let connector = MockConnector::new();
    let store = store_with_audit(&connector, audit);
    let pb = playbook(vec![command("one", "echo one")]);

    let first = store.execute(pb.clone(), hosts(&["a"]), policy(1)).await.unwrap();
    assert_eq!(first.status, RunStatus::Completed);

    assert!(matches!(store.archive(first.id), Err(Error::Audit(_))));
    assert_eq!(store.prune(), 0);
    assert_eq!(store.get_status(first.id).unwrap(), first);

    sink.healthy.store(true, Ordering::SeqCst);
    let second = store.execute(pb, hosts(&["b"]), policy(1)).await.unwrap();
    assert_eq!(sink.archived.load(Ordering::SeqCst), 1);

    // The retry covers the first run; the second was archived on finish
    assert_eq!(store.prune(), 2);
    assert_eq!(sink.archived.load(Ordering::SeqCst), 2);
    assert!(store.list().is_empty());
    assert!(matches!(store.get_status(second.id), Err(Error::RunNotFound(_))));
}
