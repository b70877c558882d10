//! Core execution engine for siemply
//!
//! - [`scheduler`] partitions the target hosts into batches and drives them
//!   through a bounded worker pool, applying soak delays, failure thresholds
//!   and the run-wide timeout.
//! - [`host`] is the per-host state machine sequencing the playbook's tasks
//!   over one lazily opened session.
//! - [`aggregator`] is the single writer of the run record and the source of
//!   run events.
//!
//! [`Engine`] bundles the collaborators all of them share.

pub mod aggregator;
pub mod host;
pub mod scheduler;

pub use aggregator::{Aggregator, HostUpdate};
pub use host::HostRunner;
pub use scheduler::{partition, Scheduler};

use std::sync::Arc;

use crate::checkpoint::Checkpointer;
use crate::connection::Connector;
use crate::error::Result;
use crate::inventory::AuthResolver;
use crate::modules::{Module, ModuleRegistry};
use crate::playbook::{ExecutionPolicy, Playbook};
use crate::run::TaskResult;
use crate::template::TemplateEngine;

/// Shared collaborators of the engine
pub struct Engine {
    registry: ModuleRegistry,
    connector: Arc<dyn Connector>,
    auth: Arc<dyn AuthResolver>,
    checkpointer: Arc<dyn Checkpointer>,
    templates: TemplateEngine,
}

impl Engine {
    /// Create an engine
    pub fn new(
        registry: ModuleRegistry,
        connector: Arc<dyn Connector>,
        auth: Arc<dyn AuthResolver>,
        checkpointer: Arc<dyn Checkpointer>,
    ) -> Self {
        Self {
            registry,
            connector,
            auth,
            checkpointer,
            templates: TemplateEngine::new(),
        }
    }

    /// The task registry
    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    /// Validate the policy and resolve every task type of the playbook.
    ///
    /// Fails with a configuration error before any host is touched.
    pub fn prepare(&self, playbook: Playbook, policy: ExecutionPolicy) -> Result<Plan> {
        policy.validate()?;
        playbook.validate()?;
        let modules = self.registry.resolve_playbook(&playbook)?;
        Ok(Plan {
            playbook,
            modules,
            policy,
        })
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

/// A playbook whose tasks are resolved to executors, plus the run policy
pub struct Plan {
    /// The playbook
    pub playbook: Playbook,
    /// One executor per task, in flattened phase/task order
    pub modules: Vec<Arc<dyn Module>>,
    /// Resolved execution policy
    pub policy: ExecutionPolicy,
}

impl Plan {
    /// Skipped results for every task, used for hosts that never ran
    pub fn skipped_results(&self, reason: &str) -> Vec<TaskResult> {
        self.playbook
            .tasks()
            .map(|(phase, task)| TaskResult::skipped(&phase.name, &task.name, &task.task_type, reason))
            .collect()
    }
}

impl std::fmt::Debug for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plan")
            .field("playbook", &self.playbook.name)
            .field("tasks", &self.modules.len())
            .field("policy", &self.policy)
            .finish()
    }
}
