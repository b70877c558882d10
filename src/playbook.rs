//! Playbook definitions and execution policy.
//!
//! A playbook is an ordered list of phases, each an ordered list of tasks.
//! Tasks run on a host strictly in the flattened phase/task order.
//!
//! Two YAML shapes are accepted: a `phases:` list, or a flat `tasks:` list
//! which becomes a single phase named `main`.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::modules::ModuleParams;
use crate::strategy::{CanarySize, MaxFailures, RollingStrategy};

/// Playbook variable bindings used for parameter templating
pub type Vars = IndexMap<String, serde_json::Value>;

/// A single task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Task name
    pub name: String,

    /// Registered task type (e.g. `command`, `splunk_backup`)
    #[serde(rename = "task", alias = "type")]
    pub task_type: String,

    /// Declared parameters
    #[serde(default, alias = "params")]
    pub args: ModuleParams,

    /// Record a failure but continue with the next task
    #[serde(default)]
    pub ignore_errors: bool,

    /// Per-task timeout (falls back to the policy's task timeout)
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,

    /// Retries on transient failure (falls back to the policy's retries)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,

    /// Base delay for linear retry backoff
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub retry_delay: Option<Duration>,

    /// Also retry non-transient failures
    #[serde(default)]
    pub retry_on_failure: bool,

    /// Tags used by run-level tag filters
    #[serde(default)]
    pub tags: BTreeSet<String>,

    /// Condition expression; the task is skipped when it renders falsy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,

    /// Failure of this task rolls the host back to its last checkpoint
    #[serde(default)]
    pub critical: bool,

    /// Store the task outcome in the host fact table under this name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub register: Option<String>,
}

impl Task {
    /// Create a task with default policy
    pub fn new(name: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            task_type: task_type.into(),
            args: ModuleParams::new(),
            ignore_errors: false,
            timeout: None,
            retries: None,
            retry_delay: None,
            retry_on_failure: false,
            tags: BTreeSet::new(),
            when: None,
            critical: false,
            register: None,
        }
    }

    /// Builder: set a parameter
    pub fn arg(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }

    /// Builder: set ignore_errors
    pub fn ignore_errors(mut self, ignore: bool) -> Self {
        self.ignore_errors = ignore;
        self
    }

    /// Builder: set retries
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    /// Builder: set timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Builder: add a tag
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Builder: set a `when` condition
    pub fn when(mut self, condition: impl Into<String>) -> Self {
        self.when = Some(condition.into());
        self
    }

    /// Builder: mark as critical
    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    /// Builder: register the outcome as a fact
    pub fn register(mut self, name: impl Into<String>) -> Self {
        self.register = Some(name.into());
        self
    }
}

/// An ordered group of tasks (pre-upgrade, upgrade, post-upgrade, ...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    /// Phase name
    pub name: String,
    /// Tasks in execution order
    pub tasks: Vec<Task>,
}

impl Phase {
    /// Create a phase
    pub fn new(name: impl Into<String>, tasks: Vec<Task>) -> Self {
        Self {
            name: name.into(),
            tasks,
        }
    }
}

/// Execution defaults declared by a playbook. Unset fields fall back to
/// configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybookExecution {
    /// Rolling strategy
    #[serde(alias = "rolling_strategy", skip_serializing_if = "Option::is_none")]
    pub strategy: Option<RollingStrategy>,
    /// Hosts per batch
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    /// Soak time between batches
    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub batch_delay: Option<Duration>,
    /// Run-wide concurrency ceiling
    #[serde(alias = "max_forks", skip_serializing_if = "Option::is_none")]
    pub forks: Option<usize>,
    /// Failure threshold
    #[serde(alias = "max_failures_percent", skip_serializing_if = "Option::is_none")]
    pub max_failures: Option<MaxFailures>,
    /// Canary batch size
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canary: Option<CanarySize>,
}

/// A resolved playbook
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Playbook {
    /// Playbook name
    pub name: String,
    /// Playbook version
    #[serde(default = "default_version")]
    pub version: String,
    /// Description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Ordered phases
    pub phases: Vec<Phase>,
    /// Default execution policy
    #[serde(default)]
    pub execution: PlaybookExecution,
    /// Variable bindings for templating
    #[serde(default)]
    pub vars: Vars,
}

fn default_version() -> String {
    "1.0".to_string()
}

#[derive(Debug, Deserialize)]
struct RawPlaybook {
    name: String,
    #[serde(default = "default_version")]
    version: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    phases: Vec<Phase>,
    #[serde(default)]
    tasks: Vec<Task>,
    #[serde(default)]
    execution: PlaybookExecution,
    #[serde(default)]
    vars: Vars,
}

impl Playbook {
    /// Create a playbook with the given phases
    pub fn new(name: impl Into<String>, phases: Vec<Phase>) -> Self {
        Self {
            name: name.into(),
            version: default_version(),
            description: None,
            phases,
            execution: PlaybookExecution::default(),
            vars: Vars::new(),
        }
    }

    /// Loads a playbook from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| Error::PlaybookParse {
            path: path.to_path_buf(),
            message: format!("Failed to read file: {}", e),
        })?;
        Self::from_yaml(&content).map_err(|e| match e {
            Error::YamlParse(inner) => Error::PlaybookParse {
                path: path.to_path_buf(),
                message: inner.to_string(),
            },
            other => other,
        })
    }

    /// Parses a playbook from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let raw: RawPlaybook = serde_yaml::from_str(yaml)?;

        let mut phases = raw.phases;
        if !raw.tasks.is_empty() {
            if !phases.is_empty() {
                return Err(Error::PlaybookValidation(
                    "use either 'phases' or 'tasks', not both".into(),
                ));
            }
            phases.push(Phase::new("main", raw.tasks));
        }

        let playbook = Self {
            name: raw.name,
            version: raw.version,
            description: raw.description,
            phases,
            execution: raw.execution,
            vars: raw.vars,
        };
        playbook.validate()?;
        Ok(playbook)
    }

    /// Structural checks that do not need the task registry
    pub fn validate(&self) -> Result<()> {
        if self.phases.is_empty() || self.phases.iter().all(|p| p.tasks.is_empty()) {
            return Err(Error::PlaybookValidation(format!(
                "playbook '{}' has no tasks",
                self.name
            )));
        }
        for (phase, task) in self.tasks() {
            if task.name.trim().is_empty() {
                return Err(Error::PlaybookValidation(format!(
                    "unnamed task in phase '{}'",
                    phase.name
                )));
            }
        }
        Ok(())
    }

    /// Tasks in flattened phase/task order
    pub fn tasks(&self) -> impl Iterator<Item = (&Phase, &Task)> {
        self.phases
            .iter()
            .flat_map(|phase| phase.tasks.iter().map(move |task| (phase, task)))
    }

    /// Number of tasks across all phases
    pub fn task_count(&self) -> usize {
        self.phases.iter().map(|p| p.tasks.len()).sum()
    }
}

/// The execution policy resolved for one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPolicy {
    /// Max concurrent hosts across the whole run
    pub forks: usize,
    /// Max hosts per batch
    pub batch_size: usize,
    /// Soak time between batches
    #[serde(with = "humantime_serde")]
    pub batch_delay: Duration,
    /// Whole-run ceiling
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
    /// Failure threshold aborting remaining batches
    #[serde(default)]
    pub max_failures: Option<MaxFailures>,
    /// Rolling strategy
    pub strategy: RollingStrategy,
    /// Canary batch size (canary strategy only)
    pub canary: CanarySize,
    /// Report actions without mutating remote state
    pub dry_run: bool,
    /// Default retries for transient failures
    pub retries: u32,
    /// Default base delay for linear retry backoff
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    /// Default per-task timeout
    #[serde(with = "humantime_serde")]
    pub task_timeout: Duration,
    /// Session connect timeout
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Only run tasks carrying one of these tags
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Never run tasks carrying one of these tags
    #[serde(default)]
    pub skip_tags: BTreeSet<String>,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            forks: 10,
            batch_size: 10,
            batch_delay: Duration::from_secs(300),
            timeout: Some(Duration::from_secs(3600)),
            max_failures: Some(MaxFailures::Count(3)),
            strategy: RollingStrategy::Simple,
            canary: CanarySize::Count(1),
            dry_run: false,
            retries: 3,
            retry_delay: Duration::from_secs(30),
            task_timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(10),
            tags: BTreeSet::new(),
            skip_tags: BTreeSet::new(),
        }
    }
}

impl ExecutionPolicy {
    /// Layer a playbook's declared defaults over this policy
    pub fn with_playbook_defaults(mut self, execution: &PlaybookExecution) -> Self {
        if let Some(strategy) = execution.strategy {
            self.strategy = strategy;
        }
        if let Some(batch_size) = execution.batch_size {
            self.batch_size = batch_size;
        }
        if let Some(delay) = execution.batch_delay {
            self.batch_delay = delay;
        }
        if let Some(forks) = execution.forks {
            self.forks = forks;
        }
        if let Some(max) = execution.max_failures {
            self.max_failures = Some(max);
        }
        if let Some(canary) = execution.canary {
            self.canary = canary;
        }
        self
    }

    /// Reject malformed policies
    pub fn validate(&self) -> Result<()> {
        if self.forks == 0 {
            return Err(Error::InvalidPolicy("forks must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(Error::InvalidPolicy("batch_size must be at least 1".into()));
        }
        if let Some(max) = &self.max_failures {
            if !max.is_valid() {
                return Err(Error::InvalidPolicy(format!("invalid max_failures {}", max)));
            }
        }
        if !self.canary.is_valid() || self.canary == CanarySize::Count(0) {
            return Err(Error::InvalidPolicy(format!(
                "invalid canary size {}",
                self.canary
            )));
        }
        if self.task_timeout.is_zero() {
            return Err(Error::InvalidPolicy("task timeout must be positive".into()));
        }
        if let Some(overlap) = self.tags.intersection(&self.skip_tags).next() {
            return Err(Error::InvalidPolicy(format!(
                "tag '{}' is both selected and skipped",
                overlap
            )));
        }
        Ok(())
    }

    /// Whether the tag filters let `task` run
    pub fn selects(&self, task: &Task) -> bool {
        if !self.tags.is_empty() && self.tags.is_disjoint(&task.tags) {
            return false;
        }
        self.skip_tags.is_disjoint(&task.tags)
    }
}
