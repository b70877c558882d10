//! Task executors for siemply
//!
//! This module provides the [`Module`] trait, the output and parameter types
//! shared by all executors, and the [`ModuleRegistry`] that maps task-type
//! names to executors. Executors run against one host through a borrowed
//! [`Session`] and read and write that host's fact table.
//!
//! Every executor honours dry-run: it may run inspection commands but never
//! mutates remote state, and reports `changed` for what it would do.

pub mod archive;
pub mod checkpoint;
pub mod command;
pub mod file;
pub mod package;
pub mod script;
pub mod service;
pub mod splunk;
pub mod template;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::checkpoint::{CheckpointError, Checkpointer};
use crate::config::SplunkSettings;
use crate::connection::{
    CommandResult, ConnectionError, ExecuteOptions, Session, TransferOptions,
};
use crate::error::{Error, Result};
use crate::inventory::{Host, HostFacts};
use crate::playbook::{Playbook, Vars};

/// Errors that can occur during task execution
#[derive(Error, Debug)]
pub enum ModuleError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Missing required parameter: {0}")]
    MissingParameter(String),

    #[error("Command failed with exit code {code}: {message}")]
    CommandFailed { code: i32, message: String },

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("Task timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ModuleError {
    /// Failures worth retrying: connectivity problems and timeouts.
    pub fn is_transient(&self) -> bool {
        match self {
            ModuleError::Connection(e) => e.is_transient(),
            ModuleError::Timeout(_) => true,
            _ => false,
        }
    }

    /// Whether the host could not be reached at all
    pub fn is_unreachable(&self) -> bool {
        matches!(self, ModuleError::Connection(e) if e.is_unreachable())
    }
}

impl From<minijinja::Error> for ModuleError {
    fn from(err: minijinja::Error) -> Self {
        ModuleError::Template(err.to_string())
    }
}

/// Result type for task executors
pub type ModuleResult<T> = std::result::Result<T, ModuleError>;

/// Status reported by an executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleStatus {
    /// Remote state was changed (or would be, in dry-run)
    Changed,
    /// Desired state already held
    Ok,
    /// Executor reported failure
    Failed,
    /// Nothing to do for this host
    Skipped,
}

impl fmt::Display for ModuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleStatus::Changed => write!(f, "changed"),
            ModuleStatus::Ok => write!(f, "ok"),
            ModuleStatus::Failed => write!(f, "failed"),
            ModuleStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Result of an executor run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleOutput {
    /// Whether the executor changed anything
    pub changed: bool,
    /// Human-readable message about what happened
    pub msg: String,
    /// Status of the execution
    pub status: ModuleStatus,
    /// Additional data returned by the executor
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub data: HashMap<String, serde_json::Value>,
    /// Standard output
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    /// Standard error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    /// Return code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rc: Option<i32>,
}

impl ModuleOutput {
    fn with_status(status: ModuleStatus, msg: String) -> Self {
        Self {
            changed: status == ModuleStatus::Changed,
            msg,
            status,
            data: HashMap::new(),
            stdout: None,
            stderr: None,
            rc: None,
        }
    }

    /// Create a new successful output with no changes
    pub fn ok(msg: impl Into<String>) -> Self {
        Self::with_status(ModuleStatus::Ok, msg.into())
    }

    /// Create a new successful output with changes
    pub fn changed(msg: impl Into<String>) -> Self {
        Self::with_status(ModuleStatus::Changed, msg.into())
    }

    /// Create a failed output
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::with_status(ModuleStatus::Failed, msg.into())
    }

    /// Create a skipped output
    pub fn skipped(msg: impl Into<String>) -> Self {
        Self::with_status(ModuleStatus::Skipped, msg.into())
    }

    /// `changed` or `ok` depending on `changed`
    pub fn changed_if(changed: bool, msg: impl Into<String>) -> Self {
        if changed {
            Self::changed(msg)
        } else {
            Self::ok(msg)
        }
    }

    /// Add data to the output
    pub fn with_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Attach the output of a remote command
    pub fn with_command_output(mut self, result: &CommandResult) -> Self {
        self.stdout = Some(result.stdout.clone());
        self.stderr = Some(result.stderr.clone());
        self.rc = Some(result.exit_code);
        self
    }
}

/// Parameters passed to executors
pub type ModuleParams = HashMap<String, serde_json::Value>;

/// Typed access to task parameters
pub trait ParamExt {
    fn get_string(&self, key: &str) -> ModuleResult<Option<String>>;
    fn get_string_required(&self, key: &str) -> ModuleResult<String>;
    fn get_bool(&self, key: &str) -> ModuleResult<Option<bool>>;
    fn get_bool_or(&self, key: &str, default: bool) -> bool;
    fn get_u64(&self, key: &str) -> ModuleResult<Option<u64>>;
    fn get_u32(&self, key: &str) -> ModuleResult<Option<u32>>;
    fn get_vec_string(&self, key: &str) -> ModuleResult<Option<Vec<String>>>;
    fn get_duration(&self, key: &str) -> ModuleResult<Option<Duration>>;
}

impl ParamExt for ModuleParams {
    fn get_string(&self, key: &str) -> ModuleResult<Option<String>> {
        match self.get(key) {
            Some(serde_json::Value::String(s)) => Ok(Some(s.clone())),
            Some(serde_json::Value::Null) | None => Ok(None),
            Some(v) => Ok(Some(v.to_string())),
        }
    }

    fn get_string_required(&self, key: &str) -> ModuleResult<String> {
        self.get_string(key)?
            .ok_or_else(|| ModuleError::MissingParameter(key.to_string()))
    }

    fn get_bool(&self, key: &str) -> ModuleResult<Option<bool>> {
        match self.get(key) {
            Some(serde_json::Value::Bool(b)) => Ok(Some(*b)),
            Some(serde_json::Value::String(s)) => match s.to_lowercase().as_str() {
                "true" | "yes" | "1" | "on" => Ok(Some(true)),
                "false" | "no" | "0" | "off" => Ok(Some(false)),
                _ => Err(ModuleError::InvalidParameter(format!(
                    "{} must be a boolean",
                    key
                ))),
            },
            Some(serde_json::Value::Null) | None => Ok(None),
            Some(_) => Err(ModuleError::InvalidParameter(format!(
                "{} must be a boolean",
                key
            ))),
        }
    }

    fn get_bool_or(&self, key: &str, default: bool) -> bool {
        self.get_bool(key).ok().flatten().unwrap_or(default)
    }

    fn get_u64(&self, key: &str) -> ModuleResult<Option<u64>> {
        let invalid = || ModuleError::InvalidParameter(format!("{} must be a positive integer", key));
        match self.get(key) {
            Some(serde_json::Value::Number(n)) => n.as_u64().map(Some).ok_or_else(invalid),
            Some(serde_json::Value::String(s)) => s.trim().parse().map(Some).map_err(|_| invalid()),
            Some(serde_json::Value::Null) | None => Ok(None),
            Some(_) => Err(invalid()),
        }
    }

    fn get_u32(&self, key: &str) -> ModuleResult<Option<u32>> {
        match self.get_u64(key)? {
            Some(v) => u32::try_from(v).map(Some).map_err(|_| {
                ModuleError::InvalidParameter(format!("{} is out of range", key))
            }),
            None => Ok(None),
        }
    }

    fn get_vec_string(&self, key: &str) -> ModuleResult<Option<Vec<String>>> {
        match self.get(key) {
            Some(serde_json::Value::Array(arr)) => Ok(Some(
                arr.iter()
                    .map(|item| match item {
                        serde_json::Value::String(s) => s.clone(),
                        v => v.to_string(),
                    })
                    .collect(),
            )),
            // Comma-separated string
            Some(serde_json::Value::String(s)) => Ok(Some(
                s.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            )),
            Some(serde_json::Value::Null) | None => Ok(None),
            Some(_) => Err(ModuleError::InvalidParameter(format!(
                "{} must be a list",
                key
            ))),
        }
    }

    fn get_duration(&self, key: &str) -> ModuleResult<Option<Duration>> {
        match self.get(key) {
            Some(serde_json::Value::Number(n)) => n
                .as_u64()
                .map(|secs| Some(Duration::from_secs(secs)))
                .ok_or_else(|| ModuleError::InvalidParameter(format!("{} must be positive", key))),
            Some(serde_json::Value::String(s)) => humantime_serde::re::humantime::parse_duration(s.trim())
                .map(Some)
                .map_err(|e| ModuleError::InvalidParameter(format!("{}: {}", key, e))),
            Some(serde_json::Value::Null) | None => Ok(None),
            Some(_) => Err(ModuleError::InvalidParameter(format!(
                "{} must be a duration",
                key
            ))),
        }
    }
}

/// Per-call execution context handed to executors.
///
/// The fact table belongs to the host run that owns this context; executors
/// may read it and record new facts into it.
pub struct ModuleContext<'a> {
    /// Host being worked on
    pub host: &'a Host,
    /// The host's session
    pub session: &'a dyn Session,
    /// The host's fact table
    pub facts: &'a mut HostFacts,
    /// Playbook variables
    pub vars: &'a Vars,
    /// Report without mutating
    pub dry_run: bool,
    /// Timeout applied to each remote command
    pub timeout: Duration,
}

impl<'a> ModuleContext<'a> {
    fn options(&self) -> ExecuteOptions {
        ExecuteOptions::new().with_timeout(self.timeout)
    }

    /// Run a command and return its result whatever the exit code
    pub async fn run(&self, command: &str) -> ModuleResult<CommandResult> {
        Ok(self.session.execute(command, Some(self.options())).await?)
    }

    /// Run a command, failing on a non-zero exit code
    pub async fn run_checked(&self, command: &str) -> ModuleResult<CommandResult> {
        let result = self.run(command).await?;
        if result.success {
            Ok(result)
        } else {
            let message = if result.stderr.trim().is_empty() {
                result.stdout.trim().to_string()
            } else {
                result.stderr.trim().to_string()
            };
            Err(ModuleError::CommandFailed {
                code: result.exit_code,
                message,
            })
        }
    }

    /// Upload content to the host
    pub async fn upload(
        &self,
        content: &[u8],
        remote_path: &str,
        options: TransferOptions,
    ) -> ModuleResult<()> {
        self.session
            .put_file(content, std::path::Path::new(remote_path), Some(options))
            .await?;
        Ok(())
    }

    /// Look up a fact, then a playbook variable, then a host fact
    pub fn lookup(&self, key: &str) -> Option<&serde_json::Value> {
        self.facts
            .get(key)
            .or_else(|| self.vars.get(key))
            .or_else(|| self.host.facts.get(key))
    }

    /// String form of [`lookup`](Self::lookup)
    pub fn lookup_str(&self, key: &str) -> Option<&str> {
        self.lookup(key).and_then(|v| v.as_str())
    }

    /// Record a fact for later tasks
    pub fn set_fact(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.facts.insert(key.into(), value.into());
    }
}

/// A task executor
#[async_trait]
pub trait Module: Send + Sync {
    /// Task-type name
    fn name(&self) -> &'static str;

    /// One-line description
    fn description(&self) -> &'static str;

    /// Parameters that must be present
    fn required_params(&self) -> &[&'static str] {
        &[]
    }

    /// Static parameter validation, run before execution
    fn validate_params(&self, _params: &ModuleParams) -> ModuleResult<()> {
        Ok(())
    }

    /// Execute against one host
    async fn execute(
        &self,
        params: &ModuleParams,
        context: &mut ModuleContext<'_>,
    ) -> ModuleResult<ModuleOutput>;
}

/// Registry for looking up executors by task-type name
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    modules: HashMap<String, Arc<dyn Module>>,
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = self.names();
        names.sort_unstable();
        f.debug_struct("ModuleRegistry").field("modules", &names).finish()
    }
}

impl ModuleRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with all built-in executors
    pub fn with_builtins(splunk: &SplunkSettings, checkpointer: Arc<dyn Checkpointer>) -> Self {
        let mut registry = Self::new();

        // Core executors
        registry.register(Arc::new(command::CommandModule));
        registry.register(Arc::new(file::FileModule));
        registry.register(Arc::new(package::PackageModule));
        registry.register(Arc::new(service::ServiceModule));
        registry.register(Arc::new(template::TemplateModule::default()));
        registry.register(Arc::new(script::ScriptModule));
        registry.register(Arc::new(archive::ArchiveModule));
        registry.register(Arc::new(checkpoint::CheckpointModule::new(checkpointer)));

        splunk::register_all(&mut registry, splunk);
        registry
    }

    /// Register an executor under its own name
    pub fn register(&mut self, module: Arc<dyn Module>) {
        self.modules.insert(module.name().to_string(), module);
    }

    /// Register an executor under another name
    pub fn register_as(&mut self, name: impl Into<String>, module: Arc<dyn Module>) {
        self.modules.insert(name.into(), module);
    }

    /// Get an executor by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn Module>> {
        self.modules.get(name).cloned()
    }

    /// Check if an executor exists
    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    /// All registered names
    pub fn names(&self) -> Vec<&str> {
        self.modules.keys().map(|s| s.as_str()).collect()
    }

    /// Resolve a task type, failing with `UnknownTaskType`
    pub fn resolve(&self, task: &str, task_type: &str) -> Result<Arc<dyn Module>> {
        self.get(task_type)
            .ok_or_else(|| Error::unknown_task_type(task, task_type))
    }

    /// Resolve every task of a playbook before any host is touched.
    ///
    /// Also checks required parameters and static validation, so a
    /// malformed task is reported as a configuration error.
    pub fn resolve_playbook(&self, playbook: &Playbook) -> Result<Vec<Arc<dyn Module>>> {
        playbook
            .tasks()
            .map(|(phase, task)| {
                let module = self.resolve(&task.name, &task.task_type)?;
                for param in module.required_params() {
                    if !task.args.contains_key(*param) {
                        return Err(Error::PlaybookValidation(format!(
                            "task '{}' in phase '{}' is missing required parameter '{}'",
                            task.name, phase.name, param
                        )));
                    }
                }
                module.validate_params(&task.args).map_err(|e| {
                    Error::PlaybookValidation(format!("task '{}': {}", task.name, e))
                })?;
                Ok(module)
            })
            .collect()
    }
}
