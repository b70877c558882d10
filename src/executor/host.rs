//! Host Run State Machine
//!
//! One [`HostRunner`] drives one host through the flattened task list:
//! `Pending -> Running(task) -> {Success, Failed, Skipped}`. It owns the
//! host's session and fact table for its whole lifetime. Host-scoped errors
//! never escape it; they end up in the host's task results.

use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::{Aggregator, Engine, HostUpdate, Plan};
use crate::checkpoint::{CheckpointRef, LAST_CHECKPOINT};
use crate::connection::{ConnectionError, Session};
use crate::inventory::{AuthMaterial, Host, HostFacts};
use crate::modules::{Module, ModuleContext, ModuleError, ModuleOutput, ModuleParams, ModuleStatus};
use crate::playbook::{Phase, Task};
use crate::run::{excerpt, HostStatus, RollbackRecord, TaskResult, TaskStatus};
use crate::template::TemplateEngine;

/// Per-host controller
pub struct HostRunner {
    engine: Arc<Engine>,
    plan: Arc<Plan>,
    aggregator: Arc<Aggregator>,
    index: usize,
    host: Host,
    batch: usize,
    halt: CancellationToken,
    auth: Option<AuthMaterial>,
    session: Option<Box<dyn Session>>,
    facts: HostFacts,
}

/// Why the task loop stopped early
enum Stop {
    Failed(String),
    Halted,
}

impl HostRunner {
    /// Prepare the runner for the host at `index` of the run's target list
    pub fn new(
        engine: Arc<Engine>,
        plan: Arc<Plan>,
        aggregator: Arc<Aggregator>,
        index: usize,
        host: Host,
        batch: usize,
        halt: CancellationToken,
    ) -> Self {
        let facts = host.facts.clone();
        Self {
            engine,
            plan,
            aggregator,
            index,
            host,
            batch,
            halt,
            auth: None,
            session: None,
            facts,
        }
    }

    /// Run every task and report the host's terminal state
    #[instrument(skip(self), fields(host = %self.host.name, batch = self.batch))]
    pub async fn run(mut self) -> HostStatus {
        self.aggregator
            .record(self.index, HostUpdate::Started { batch: self.batch });
        debug!("host started");

        let plan = Arc::clone(&self.plan);
        let mut stop: Option<Stop> = None;
        let mut rollback = None;

        for ((phase, task), module) in plan.playbook.tasks().zip(plan.modules.iter()) {
            if stop.is_none() && self.halt.is_cancelled() {
                info!("run halted, skipping remaining tasks");
                stop = Some(Stop::Halted);
            }
            let result = match &stop {
                Some(Stop::Failed(_)) => {
                    TaskResult::skipped(&phase.name, &task.name, &task.task_type, "previous task failed")
                }
                Some(Stop::Halted) => {
                    TaskResult::skipped(&phase.name, &task.name, &task.task_type, "run halted")
                }
                None => self.run_task(phase, task, module.as_ref()).await,
            };

            if let Some(name) = &task.register {
                self.register(name, &result);
            }
            let fatal = result.status.is_failure() && !result.ignored;
            let message = result.message.clone();
            self.aggregator.record(self.index, HostUpdate::Task(result));

            if fatal {
                warn!(task = %task.name, error = %message, "task failed, halting host");
                stop = Some(Stop::Failed(format!("task '{}' failed: {}", task.name, message)));
                if task.critical {
                    rollback = Some(self.rollback().await);
                }
            }
        }

        self.close_session().await;

        let (status, error) = match stop {
            None => (HostStatus::Success, None),
            Some(Stop::Failed(error)) => (HostStatus::Failed, Some(error)),
            Some(Stop::Halted) => (HostStatus::Skipped, Some("run halted".to_string())),
        };
        info!(%status, "host finished");
        self.aggregator.record(
            self.index,
            HostUpdate::Finished {
                status,
                error,
                rollback,
            },
        );
        status
    }

    /// Evaluate filters, render parameters and execute with retries
    async fn run_task(&mut self, phase: &Phase, task: &Task, module: &dyn Module) -> TaskResult {
        let policy = &self.plan.policy;
        if !policy.selects(task) {
            return TaskResult::skipped(&phase.name, &task.name, &task.task_type, "excluded by tags");
        }

        let templates: &TemplateEngine = &self.engine.templates;
        let ctx = TemplateEngine::context(&self.plan.playbook.vars, &self.facts, &self.host);
        if let Some(condition) = &task.when {
            match templates.evaluate(condition, &ctx) {
                Ok(true) => {}
                Ok(false) => {
                    return TaskResult::skipped(
                        &phase.name,
                        &task.name,
                        &task.task_type,
                        format!("condition '{}' is false", condition),
                    )
                }
                Err(e) => {
                    return failed_result(phase, task, TaskStatus::Failed, &ModuleError::from(e), 0, Duration::ZERO)
                }
            }
        }
        let params = match templates.render_params(&task.args, &ctx) {
            Ok(params) => params,
            Err(e) => {
                return failed_result(phase, task, TaskStatus::Failed, &ModuleError::from(e), 0, Duration::ZERO)
            }
        };

        let max_retries = task.retries.unwrap_or(policy.retries);
        let retry_delay = task.retry_delay.unwrap_or(policy.retry_delay);
        let timeout = task.timeout.unwrap_or(policy.task_timeout);
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            let err = match self.attempt(module, &params, timeout).await {
                Ok(output) => return output_result(phase, task, output, attempt, started.elapsed()),
                Err(err) => err,
            };

            if invalidates_session(&err) {
                self.close_session().await;
            }
            let retryable = err.is_transient() || task.retry_on_failure;
            if retryable && attempt < max_retries && !self.halt.is_cancelled() {
                attempt += 1;
                let backoff = retry_delay * attempt;
                warn!(
                    task = %task.name,
                    attempt,
                    max_retries,
                    error = %err,
                    "task attempt failed, retrying in {:?}",
                    backoff
                );
                let halted = tokio::select! {
                    _ = tokio::time::sleep(backoff) => false,
                    _ = self.halt.cancelled() => true,
                };
                if !halted {
                    continue;
                }
            }

            let status = if err.is_unreachable() {
                TaskStatus::Unreachable
            } else {
                TaskStatus::Failed
            };
            return failed_result(phase, task, status, &err, attempt, started.elapsed());
        }
    }

    /// One executor call bounded by the task timeout
    async fn attempt(
        &mut self,
        module: &dyn Module,
        params: &ModuleParams,
        timeout: Duration,
    ) -> Result<ModuleOutput, ModuleError> {
        self.ensure_session().await?;
        let Some(session) = self.session.as_deref() else {
            return Err(ConnectionError::ConnectionClosed.into());
        };
        let mut context = ModuleContext {
            host: &self.host,
            session,
            facts: &mut self.facts,
            vars: &self.plan.playbook.vars,
            dry_run: self.plan.policy.dry_run,
            timeout,
        };
        match tokio::time::timeout(timeout, module.execute(params, &mut context)).await {
            Ok(result) => result,
            Err(_) => Err(ModuleError::Timeout(timeout)),
        }
    }

    /// Open the session on first use, or after a dropped one
    async fn ensure_session(&mut self) -> Result<(), ConnectionError> {
        if self.session.is_some() {
            return Ok(());
        }
        if self.auth.is_none() {
            let auth = self
                .engine
                .auth
                .resolve_auth(&self.host)
                .map_err(|e| ConnectionError::InvalidConfig(e.to_string()))?;
            self.auth = Some(auth);
        }
        let Some(auth) = self.auth.as_ref() else {
            return Err(ConnectionError::InvalidConfig("no credentials".into()));
        };
        let session = self
            .engine
            .connector
            .open(&self.host, auth, self.plan.policy.connect_timeout)
            .await?;
        debug!(session = session.identifier(), "session opened");
        self.session = Some(session);
        Ok(())
    }

    async fn close_session(&mut self) {
        if let Some(session) = self.session.take() {
            if let Err(e) = session.close().await {
                debug!(error = %e, "error closing session");
            }
        }
    }

    /// Restore the last checkpoint after a critical failure
    async fn rollback(&mut self) -> RollbackRecord {
        let record = |checkpoint: Option<String>, success: bool, message: String| RollbackRecord {
            checkpoint,
            success,
            message,
            timestamp: Utc::now(),
        };

        let Some(checkpoint) = self.facts.get(LAST_CHECKPOINT).and_then(CheckpointRef::from_fact) else {
            warn!("critical task failed but no checkpoint was recorded");
            return record(None, false, "no checkpoint recorded".into());
        };
        let label = Some(checkpoint.label.clone());
        if self.plan.policy.dry_run {
            return record(label, true, format!("would roll back to '{}'", checkpoint.label));
        }

        if let Err(e) = self.ensure_session().await {
            return record(label, false, format!("rollback failed: {}", e));
        }
        let Some(session) = self.session.as_deref() else {
            return record(label, false, "rollback failed: no session".into());
        };
        match self
            .engine
            .checkpointer
            .rollback(session, &self.host, &checkpoint)
            .await
        {
            Ok(()) => {
                info!(checkpoint = %checkpoint.label, "rolled back");
                record(label, true, format!("rolled back to '{}'", checkpoint.label))
            }
            Err(e) => {
                warn!(checkpoint = %checkpoint.label, error = %e, "rollback failed");
                record(label, false, e.to_string())
            }
        }
    }

    /// Store a task outcome in the fact table
    fn register(&mut self, name: &str, result: &TaskResult) {
        self.facts.insert(
            name.to_string(),
            serde_json::json!({
                "status": result.status,
                "changed": result.status == TaskStatus::Changed,
                "failed": result.status.is_failure(),
                "skipped": result.status == TaskStatus::Skipped,
                "stdout": result.stdout.clone().unwrap_or_default(),
                "stderr": result.stderr.clone().unwrap_or_default(),
                "rc": result.rc,
                "msg": result.message,
            }),
        );
    }
}

/// Whether the session must be reopened before another attempt
fn invalidates_session(err: &ModuleError) -> bool {
    match err {
        ModuleError::Connection(e) => e.invalidates_session(),
        // The timed out command may still hold the channel
        ModuleError::Timeout(_) => true,
        _ => false,
    }
}

fn output_result(
    phase: &Phase,
    task: &Task,
    output: ModuleOutput,
    retries: u32,
    duration: Duration,
) -> TaskResult {
    let status = match output.status {
        ModuleStatus::Changed => TaskStatus::Changed,
        ModuleStatus::Ok => TaskStatus::Ok,
        ModuleStatus::Skipped => TaskStatus::Skipped,
        ModuleStatus::Failed => TaskStatus::Failed,
    };
    TaskResult {
        task: task.name.clone(),
        phase: phase.name.clone(),
        task_type: task.task_type.clone(),
        status,
        message: output.msg,
        stdout: output.stdout.as_deref().map(excerpt),
        stderr: output.stderr.as_deref().map(excerpt),
        rc: output.rc,
        duration,
        retries,
        ignored: status == TaskStatus::Failed && task.ignore_errors,
        timestamp: Utc::now(),
    }
}

fn failed_result(
    phase: &Phase,
    task: &Task,
    status: TaskStatus,
    err: &ModuleError,
    retries: u32,
    duration: Duration,
) -> TaskResult {
    let (rc, stderr) = match err {
        ModuleError::CommandFailed { code, message } => (Some(*code), Some(excerpt(message))),
        _ => (None, None),
    };
    TaskResult {
        task: task.name.clone(),
        phase: phase.name.clone(),
        task_type: task.task_type.clone(),
        status,
        message: err.to_string(),
        stdout: None,
        stderr,
        rc,
        duration,
        retries,
        ignored: task.ignore_errors,
        timestamp: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{CommandResult, ConnectionResult, Connector, ExecuteOptions, TransferOptions};
    use crate::inventory::MockAuthResolver;
    use crate::checkpoint::TarCheckpointer;
    use crate::modules::ModuleRegistry;
    use crate::playbook::{ExecutionPolicy, Playbook};
    use crate::run::{Run, RunId};
    use crate::audit::AuditManager;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::path::Path;

    /// Session answering `exit N` with exit code N and anything else with success
    struct ExitSession {
        commands: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Session for ExitSession {
        fn identifier(&self) -> &str {
            "exit-session"
        }

        async fn is_alive(&self) -> bool {
            true
        }

        async fn execute(
            &self,
            command: &str,
            _options: Option<ExecuteOptions>,
        ) -> ConnectionResult<CommandResult> {
            self.commands.lock().push(command.to_string());
            match command.strip_prefix("exit ").and_then(|c| c.trim().parse().ok()) {
                Some(code) if code != 0 => Ok(CommandResult::failure(code, String::new(), "boom".into())),
                _ => Ok(CommandResult::success("ok".into(), String::new())),
            }
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

    struct ExitConnector {
        commands: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Connector for ExitConnector {
        async fn open(
            &self,
            _host: &Host,
            _auth: &AuthMaterial,
            _connect_timeout: Duration,
        ) -> ConnectionResult<Box<dyn Session>> {
            Ok(Box::new(ExitSession {
                commands: Arc::clone(&self.commands),
            }))
        }
    }

    fn setup(
        tasks: Vec<Task>,
        auth: MockAuthResolver,
    ) -> (HostRunner, Arc<Aggregator>, Arc<Mutex<Vec<String>>>) {
        let commands = Arc::new(Mutex::new(Vec::new()));
        let checkpointer = Arc::new(TarCheckpointer::default());
        let engine = Arc::new(Engine::new(
            ModuleRegistry::with_builtins(&Default::default(), checkpointer.clone()),
            Arc::new(ExitConnector {
                commands: Arc::clone(&commands),
            }),
            Arc::new(auth),
            checkpointer,
        ));
        let playbook = Playbook::new("test", vec![Phase::new("main", tasks)]);
        let policy = ExecutionPolicy {
            retry_delay: Duration::from_millis(1),
            ..ExecutionPolicy::default()
        };
        let plan = Arc::new(engine.prepare(playbook, policy).unwrap());
        let host = Host::new("uf1");
        let aggregator = Aggregator::new(
            Run::new(RunId::new_v4(), &plan.playbook, vec![host.clone()], plan.policy.clone()),
            AuditManager::new(),
        );
        let runner = HostRunner::new(
            engine,
            plan,
            Arc::clone(&aggregator),
            0,
            host,
            0,
            CancellationToken::new(),
        );
        (runner, aggregator, commands)
    }

    fn resolver() -> MockAuthResolver {
        let mut auth = MockAuthResolver::new();
        auth.expect_resolve_auth()
            .times(1)
            .returning(|_| Ok(AuthMaterial::user("root")));
        auth
    }

    #[tokio::test]
    async fn test_failure_skips_remaining_tasks() {
        let (runner, aggregator, commands) = setup(
            vec![
                Task::new("first", "command").arg("cmd", "echo ok"),
                Task::new("second", "command").arg("cmd", "exit 1"),
                Task::new("third", "command").arg("cmd", "echo never"),
            ],
            resolver(),
        );

        assert_eq!(runner.run().await, HostStatus::Failed);
        let host = aggregator.snapshot().host_results[0].clone();
        assert_eq!(
            host.statuses(),
            vec![TaskStatus::Ok, TaskStatus::Failed, TaskStatus::Skipped]
        );
        assert_eq!(host.tasks[1].rc, Some(1));
        assert_eq!(host.tasks[1].retries, 0);
        assert!(host.error.unwrap().contains("second"));
        assert!(!commands.lock().iter().any(|c| c.contains("never")));
    }

    #[tokio::test]
    async fn test_ignored_failure_continues() {
        let (runner, aggregator, _) = setup(
            vec![
                Task::new("tolerated", "command").arg("cmd", "exit 3").ignore_errors(true),
                Task::new("after", "command").arg("cmd", "echo ok"),
            ],
            resolver(),
        );

        assert_eq!(runner.run().await, HostStatus::Success);
        let host = aggregator.snapshot().host_results[0].clone();
        assert_eq!(host.statuses(), vec![TaskStatus::Failed, TaskStatus::Ok]);
        assert!(host.tasks[0].ignored);
    }

    #[tokio::test]
    async fn test_plain_command_is_ok_unless_declared_changed() {
        let (runner, aggregator, _) = setup(
            vec![
                Task::new("read", "command").arg("cmd", "echo ok"),
                Task::new("write", "command")
                    .arg("cmd", "echo done")
                    .arg("changed_when", true),
            ],
            resolver(),
        );

        assert_eq!(runner.run().await, HostStatus::Success);
        let host = aggregator.snapshot().host_results[0].clone();
        assert_eq!(host.statuses(), vec![TaskStatus::Ok, TaskStatus::Changed]);
    }

    #[tokio::test]
    async fn test_when_register_and_templating() {
        let (runner, aggregator, commands) = setup(
            vec![
                Task::new("lookup", "command")
                    .arg("cmd", "echo lookup")
                    .register("lookup"),
                Task::new("conditional", "command")
                    .arg("cmd", "echo {{ inventory_hostname }} {{ lookup.rc }}")
                    .when("lookup.rc == 0"),
                Task::new("never", "command")
                    .arg("cmd", "echo no")
                    .when("lookup.rc != 0"),
            ],
            resolver(),
        );

        assert_eq!(runner.run().await, HostStatus::Success);
        let host = aggregator.snapshot().host_results[0].clone();
        assert_eq!(
            host.statuses(),
            vec![TaskStatus::Ok, TaskStatus::Ok, TaskStatus::Skipped]
        );
        assert!(commands.lock().iter().any(|c| c == "echo uf1 0"));
    }

    #[tokio::test]
    async fn test_secret_not_found_fails_without_retry() {
        let mut auth = MockAuthResolver::new();
        auth.expect_resolve_auth()
            .times(1)
            .returning(|host| Err(crate::error::Error::secret_not_found(&host.name, "no key")));
        let (runner, aggregator, commands) = setup(
            vec![Task::new("echo", "command").arg("cmd", "echo ok")],
            auth,
        );

        assert_eq!(runner.run().await, HostStatus::Failed);
        let host = aggregator.snapshot().host_results[0].clone();
        assert_eq!(host.statuses(), vec![TaskStatus::Failed]);
        assert_eq!(host.tasks[0].retries, 0);
        assert!(commands.lock().is_empty());
    }

    #[tokio::test]
    async fn test_halted_before_start() {
        let (runner, aggregator, commands) = setup(
            vec![Task::new("echo", "command").arg("cmd", "echo ok")],
            MockAuthResolver::new(),
        );
        runner.halt.cancel();

        assert_eq!(runner.run().await, HostStatus::Skipped);
        let host = aggregator.snapshot().host_results[0].clone();
        assert_eq!(host.statuses(), vec![TaskStatus::Skipped]);
        assert!(commands.lock().is_empty());
    }
}
