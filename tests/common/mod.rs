//! Shared test utilities for the siemply test suite.
//!
//! This module provides:
//! - A scripted [`MockConnector`] / [`MockSession`] pair standing in for SSH
//! - A tiny per-host virtual filesystem so state-checking executors behave
//!   idempotently across runs
//! - Builders for engines, stores, hosts, policies and playbooks
//! - A recording audit sink
//!
//! # Usage
//!
//! ```rust,ignore
//! mod common;
//! use common::*;
//! ```

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};

use siemply::audit::{AuditManager, AuditResult, AuditSink};
use siemply::checkpoint::TarCheckpointer;
use siemply::config::SplunkSettings;
use siemply::connection::{
    CommandResult, ConnectionError, ConnectionResult, Connector, ExecuteOptions, Session,
    TransferOptions,
};
use siemply::events::RunEvent;
use siemply::executor::Engine;
use siemply::inventory::{AuthMaterial, AuthResolver, Host};
use siemply::modules::ModuleRegistry;
use siemply::playbook::{ExecutionPolicy, Phase, Playbook, Task};
use siemply::run::{Run, TaskStatus};
use siemply::store::RunStore;

// ============================================================================
// Mock connection
// ============================================================================

/// What a scripted command answers
#[derive(Debug, Clone)]
pub enum Reply {
    /// Return this result
    Result(CommandResult),
    /// Drop the session mid-command
    Drop,
}

#[derive(Debug, Clone)]
struct Rule {
    host: Option<String>,
    pattern: String,
    reply: Reply,
    /// Remaining uses; `None` never runs out
    remaining: Option<usize>,
}

#[derive(Debug, Clone)]
struct VirtualFile {
    content: Vec<u8>,
    dir: bool,
}

#[derive(Debug, Default)]
struct MockState {
    rules: RwLock<Vec<Rule>>,
    unreachable: RwLock<HashSet<String>>,
    delay: RwLock<Option<Duration>>,
    opens: RwLock<HashMap<String, usize>>,
    commands: RwLock<Vec<(String, String)>>,
    uploads: RwLock<Vec<(String, String, Vec<u8>)>>,
    files: RwLock<HashMap<(String, String), VirtualFile>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    closes: AtomicUsize,
}

/// A scripted connector shared by every host of a test.
///
/// Commands are answered, in order of precedence, by the latest matching
/// rule, by the virtual filesystem (`test -e`, `stat`, `sha256sum`, `touch`,
/// `mkdir -p`, `rm -rf`), by `exit N` / `echo ...`, and finally by an empty
/// success.
///
/// # Example
///
/// ```rust,ignore
/// let connector = MockConnector::new();
/// connector.on_host("web2", "exit 1", Reply::Result(CommandResult::failure(1, "".into(), "".into())));
/// connector.unreachable("web3");
/// ```
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    state: Arc<MockState>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands containing `pattern` on every host
    pub fn on(&self, pattern: impl Into<String>, reply: Reply) {
        self.push_rule(None, pattern.into(), reply, None);
    }

    /// Answer commands containing `pattern` on one host
    pub fn on_host(&self, host: impl Into<String>, pattern: impl Into<String>, reply: Reply) {
        self.push_rule(Some(host.into()), pattern.into(), reply, None);
    }

    /// Like [`on_host`](Self::on_host) for the next `times` matching commands only
    pub fn on_host_times(
        &self,
        host: impl Into<String>,
        pattern: impl Into<String>,
        reply: Reply,
        times: usize,
    ) {
        self.push_rule(Some(host.into()), pattern.into(), reply, Some(times));
    }

    /// Fail `pattern` with exit code 1 on one host
    pub fn fail_on(&self, host: impl Into<String>, pattern: impl Into<String>) {
        self.on_host(
            host,
            pattern,
            Reply::Result(CommandResult::failure(1, String::new(), "scripted failure".into())),
        );
    }

    fn push_rule(&self, host: Option<String>, pattern: String, reply: Reply, remaining: Option<usize>) {
        self.state.rules.write().push(Rule {
            host,
            pattern,
            reply,
            remaining,
        });
    }

    /// Refuse connections to `host`
    pub fn unreachable(&self, host: impl Into<String>) {
        self.state.unreachable.write().insert(host.into());
    }

    /// Delay every command by `delay`
    pub fn set_delay(&self, delay: Duration) {
        *self.state.delay.write() = Some(delay);
    }

    /// Seed a file in a host's virtual filesystem
    pub fn add_file(&self, host: &str, path: &str, content: impl Into<Vec<u8>>) {
        self.state.files.write().insert(
            (host.to_string(), path.to_string()),
            VirtualFile {
                content: content.into(),
                dir: false,
            },
        );
    }

    /// Whether a path exists in a host's virtual filesystem
    pub fn file_exists(&self, host: &str, path: &str) -> bool {
        self.state
            .files
            .read()
            .contains_key(&(host.to_string(), path.to_string()))
    }

    /// Content of a file in a host's virtual filesystem
    pub fn file_content(&self, host: &str, path: &str) -> Option<Vec<u8>> {
        self.state
            .files
            .read()
            .get(&(host.to_string(), path.to_string()))
            .map(|f| f.content.clone())
    }

    /// Sessions opened to `host`
    pub fn opens(&self, host: &str) -> usize {
        self.state.opens.read().get(host).copied().unwrap_or(0)
    }

    /// Sessions opened across all hosts
    pub fn total_opens(&self) -> usize {
        self.state.opens.read().values().sum()
    }

    /// Sessions released so far
    pub fn closes(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    /// Sessions currently open
    pub fn active(&self) -> usize {
        self.state.active.load(Ordering::SeqCst)
    }

    /// Highest number of sessions open at once
    pub fn max_active(&self) -> usize {
        self.state.max_active.load(Ordering::SeqCst)
    }

    /// Every command executed, as (host, command) in execution order
    pub fn commands(&self) -> Vec<(String, String)> {
        self.state.commands.read().clone()
    }

    /// Commands executed on one host
    pub fn commands_on(&self, host: &str) -> Vec<String> {
        self.state
            .commands
            .read()
            .iter()
            .filter(|(h, _)| h == host)
            .map(|(_, c)| c.clone())
            .collect()
    }

    /// Every upload, as (host, remote path, content)
    pub fn uploads(&self) -> Vec<(String, String, Vec<u8>)> {
        self.state.uploads.read().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(
        &self,
        host: &Host,
        _auth: &AuthMaterial,
        _connect_timeout: Duration,
    ) -> ConnectionResult<Box<dyn Session>> {
        *self.state.opens.write().entry(host.name.clone()).or_insert(0) += 1;
        if self.state.unreachable.read().contains(&host.name) {
            return Err(ConnectionError::ConnectionFailed(format!(
                "{}: no route to host",
                host.address
            )));
        }

        let active = self.state.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_active.fetch_max(active, Ordering::SeqCst);
        Ok(Box::new(MockSession {
            host: host.name.clone(),
            state: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        }))
    }
}

/// Session handed out by [`MockConnector`]
#[derive(Debug)]
pub struct MockSession {
    host: String,
    state: Arc<MockState>,
    closed: AtomicBool,
}

impl MockSession {
    /// A standalone session for driving executors directly
    pub fn standalone(connector: &MockConnector, host: &str) -> Self {
        let active = connector.state.active.fetch_add(1, Ordering::SeqCst) + 1;
        connector.state.max_active.fetch_max(active, Ordering::SeqCst);
        Self {
            host: host.to_string(),
            state: Arc::clone(&connector.state),
            closed: AtomicBool::new(false),
        }
    }

    fn release(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.active.fetch_sub(1, Ordering::SeqCst);
            self.state.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn scripted(&self, command: &str) -> Option<Reply> {
        let mut rules = self.state.rules.write();
        let rule = rules.iter_mut().rev().find(|rule| {
            rule.remaining != Some(0)
                && rule.host.as_deref().map_or(true, |h| h == self.host)
                && command.contains(&rule.pattern)
        })?;
        if let Some(remaining) = rule.remaining.as_mut() {
            *remaining -= 1;
        }
        Some(rule.reply.clone())
    }

    fn filesystem(&self, command: &str) -> Option<CommandResult> {
        let verb = command.split_whitespace().next()?;
        let path = path_argument(command)?;
        let key = (self.host.clone(), path.clone());
        let mut files = self.state.files.write();
        let result = match verb {
            "test" => {
                if files.contains_key(&key) {
                    ok("")
                } else {
                    CommandResult::failure(1, String::new(), String::new())
                }
            }
            "stat" => match files.get(&key) {
                Some(f) if f.dir => ok("directory|755|root|root"),
                Some(_) => ok("regular file|644|root|root"),
                None => CommandResult::failure(1, String::new(), String::new()),
            },
            "sha256sum" => match files.get(&key) {
                Some(f) if !f.dir => ok(&format!("{}  {}", hex(&f.content), path)),
                _ => CommandResult::failure(1, String::new(), String::new()),
            },
            "touch" => {
                files.entry(key).or_insert(VirtualFile {
                    content: Vec::new(),
                    dir: false,
                });
                ok("")
            }
            "mkdir" => {
                files.insert(
                    key,
                    VirtualFile {
                        content: Vec::new(),
                        dir: true,
                    },
                );
                ok("")
            }
            "rm" => {
                files.remove(&key);
                ok("")
            }
            _ => return None,
        };
        Some(result)
    }
}

impl Drop for MockSession {
    fn drop(&mut self) {
        self.release();
    }
}

#[async_trait]
impl Session for MockSession {
    fn identifier(&self) -> &str {
        &self.host
    }

    async fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn execute(
        &self,
        command: &str,
        _options: Option<ExecuteOptions>,
    ) -> ConnectionResult<CommandResult> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConnectionError::ConnectionClosed);
        }
        self.state
            .commands
            .write()
            .push((self.host.clone(), command.to_string()));

        let delay = *self.state.delay.read();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        match self.scripted(command) {
            Some(Reply::Result(result)) => return Ok(result),
            Some(Reply::Drop) => return Err(ConnectionError::ConnectionClosed),
            None => {}
        }
        if let Some(result) = self.filesystem(command) {
            return Ok(result);
        }

        let trimmed = command.trim();
        if let Some(code) = trimmed.strip_prefix("exit ") {
            let code: i32 = code.trim().parse().unwrap_or(1);
            return Ok(if code == 0 {
                ok("")
            } else {
                CommandResult::failure(code, String::new(), String::new())
            });
        }
        if let Some(text) = trimmed.strip_prefix("echo ") {
            return Ok(ok(&format!("{}\n", text)));
        }
        Ok(ok(""))
    }

    async fn put_file(
        &self,
        content: &[u8],
        remote_path: &Path,
        _options: Option<TransferOptions>,
    ) -> ConnectionResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConnectionError::ConnectionClosed);
        }
        let path = remote_path.to_string_lossy().into_owned();
        self.state
            .uploads
            .write()
            .push((self.host.clone(), path.clone(), content.to_vec()));
        self.state.files.write().insert(
            (self.host.clone(), path),
            VirtualFile {
                content: content.to_vec(),
                dir: false,
            },
        );
        Ok(())
    }

    async fn close(&self) -> ConnectionResult<()> {
        self.release();
        Ok(())
    }
}

fn ok(stdout: &str) -> CommandResult {
    CommandResult::success(stdout.to_string(), String::new())
}

fn hex(content: &[u8]) -> String {
    Sha256::digest(content)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Last single-quoted argument, or the last bare word
fn path_argument(command: &str) -> Option<String> {
    let quoted: Vec<&str> = command.split('\'').skip(1).step_by(2).collect();
    match quoted.last() {
        Some(path) => Some((*path).to_string()),
        None => command.split_whitespace().last().map(str::to_string),
    }
}

// ============================================================================
// Engine fixtures
// ============================================================================

/// Hands every host the same credentials
#[derive(Debug, Default)]
pub struct StaticAuth;

impl AuthResolver for StaticAuth {
    fn resolve_auth(&self, _host: &Host) -> siemply::error::Result<AuthMaterial> {
        Ok(AuthMaterial::user("root"))
    }
}

/// Built-in executors with default Splunk settings
pub fn registry() -> ModuleRegistry {
    ModuleRegistry::with_builtins(
        &SplunkSettings::default(),
        Arc::new(TarCheckpointer::default()),
    )
}

pub fn engine(connector: &MockConnector) -> Arc<Engine> {
    Arc::new(Engine::new(
        registry(),
        Arc::new(connector.clone()),
        Arc::new(StaticAuth),
        Arc::new(TarCheckpointer::default()),
    ))
}

pub fn store(connector: &MockConnector) -> RunStore {
    RunStore::new(engine(connector), AuditManager::new())
}

pub fn store_with_audit(connector: &MockConnector, audit: AuditManager) -> RunStore {
    RunStore::new(engine(connector), audit)
}

/// Hosts with distinct addresses, in the given order
pub fn hosts(names: &[&str]) -> Vec<Host> {
    names
        .iter()
        .enumerate()
        .map(|(i, name)| Host::with_address(*name, format!("10.0.0.{}", i + 1)))
        .collect()
}

/// A policy without soak delays, retries, thresholds or run timeout
pub fn policy(batch_size: usize) -> ExecutionPolicy {
    ExecutionPolicy {
        batch_size,
        forks: 10,
        batch_delay: Duration::ZERO,
        timeout: None,
        max_failures: None,
        retries: 0,
        retry_delay: Duration::from_millis(1),
        task_timeout: Duration::from_secs(5),
        connect_timeout: Duration::from_secs(1),
        ..ExecutionPolicy::default()
    }
}

/// A `command` task
pub fn command(name: &str, cmd: &str) -> Task {
    Task::new(name, "command").arg("cmd", cmd)
}

/// A single-phase playbook
pub fn playbook(tasks: Vec<Task>) -> Playbook {
    Playbook::new("test", vec![Phase::new("main", tasks)])
}

// ============================================================================
// Assertions
// ============================================================================

/// Every host carries the full flattened task list, truncated at the first
/// fatal failure with the rest skipped.
pub fn assert_task_order(run: &Run, playbook: &Playbook) {
    let expected: Vec<&str> = playbook.tasks().map(|(_, t)| t.name.as_str()).collect();
    assert_eq!(run.host_results.len(), run.hosts.len());
    for host in &run.host_results {
        let names: Vec<&str> = host.tasks.iter().map(|t| t.task.as_str()).collect();
        assert_eq!(names, expected, "task order on {}", host.host);

        let fatal = host
            .tasks
            .iter()
            .position(|t| t.status.is_failure() && !t.ignored);
        if let Some(at) = fatal {
            assert!(
                host.tasks[at + 1..]
                    .iter()
                    .all(|t| t.status == TaskStatus::Skipped),
                "tasks after the failure on {} must be skipped",
                host.host
            );
        }
    }
}

// ============================================================================
// Audit
// ============================================================================

/// Keeps everything it is given
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub events: Mutex<Vec<RunEvent>>,
    pub archived: Mutex<Vec<Run>>,
}

impl RecordingSink {
    pub fn kinds(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(RunEvent::kind).collect()
    }
}

impl AuditSink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    fn record(&self, event: &RunEvent) -> AuditResult<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }

    fn archive(&self, run: &Run) -> AuditResult<()> {
        self.archived.lock().push(run.clone());
        Ok(())
    }
}
