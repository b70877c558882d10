//! # Siemply - Rolling Splunk Operations over SSH
//!
//! Siemply executes playbooks of Splunk maintenance tasks (prechecks,
//! backups, package installs, upgrades, health checks) against fleets of
//! hosts reached over SSH. Hosts are processed in ordered batches with a
//! bounded worker pool, soak delays between batches, failure thresholds and
//! an optional canary gate. Every outcome is aggregated into a single run
//! record that can be queried, streamed and archived.
//!
//! ## Architecture Overview
//!
//! ```text
//!            submit / get_status / cancel / stream_events
//!                              │
//!                              ▼
//! ┌───────────────────────────────────────────────────────────┐
//! │                         RunStore                          │
//! └───────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌───────────────────────────────────────────────────────────┐
//! │              Batch Scheduler (forks pool)                 │
//! └───────────────────────────────────────────────────────────┘
//!          │                   │                   │
//!          ▼                   ▼                   ▼
//! ┌─────────────────┐ ┌─────────────────┐ ┌─────────────────┐
//! │ Host run state  │ │ Host run state  │ │ Host run state  │
//! │    machine      │ │    machine      │ │    machine      │
//! └─────────────────┘ └─────────────────┘ └─────────────────┘
//!          │  tasks via ModuleRegistry, one Session per host
//!          ▼
//! ┌───────────────────────────────────────────────────────────┐
//! │    Run Aggregator ──▶ RunEvents ──▶ audit sinks / archive │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Example
//!
//! ```rust,ignore
//! use siemply::prelude::*;
//!
//! let engine = Arc::new(Engine::new(registry, connector, auth, checkpointer));
//! let store = RunStore::new(engine, AuditManager::new().with_sink(Arc::new(TracingSink)));
//!
//! let id = store.submit(playbook, hosts, ExecutionPolicy::default())?;
//! let run = store.wait(id).await?;
//! println!("{}: {:?}", run.status, run.summary());
//! ```

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod prelude {
    //! Convenient re-exports of the types most callers need.

    pub use std::sync::Arc;

    #[cfg(feature = "russh")]
    pub use crate::connection::russh::SshConnector;
    pub use crate::connection::{
        CommandResult, ConnectionError, ConnectionResult, Connector, ExecuteOptions, Session,
        TransferOptions,
    };

    pub use crate::audit::{AuditManager, AuditSink, JsonLinesSink, RunArchive, TracingSink};
    pub use crate::checkpoint::{Checkpointer, TarCheckpointer};
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::events::RunEvent;
    pub use crate::executor::Engine;
    pub use crate::inventory::{AuthMaterial, AuthResolver, Host, HostResolver, Inventory};
    pub use crate::modules::{Module, ModuleRegistry};
    pub use crate::playbook::{ExecutionPolicy, Phase, Playbook, Task};
    pub use crate::run::{HostStatus, Run, RunId, RunStatus, TaskStatus};
    pub use crate::store::RunStore;
    pub use crate::strategy::{CountOrPercent, RollingStrategy};
}

/// Error types and result aliases.
pub mod error;

/// Layered configuration: defaults, files, environment.
pub mod config;

/// Remote sessions: the `Session`/`Connector` seam and the russh backend.
pub mod connection;

/// Hosts, groups, target resolution and authentication material.
pub mod inventory;

/// Playbooks and the per-run execution policy.
pub mod playbook;

pub mod strategy;

/// Parameter templating and `when` conditions.
pub mod template;

/// Task executors and their registry.
pub mod modules;

/// Remote snapshots used for rollback of critical tasks.
pub mod checkpoint;

pub mod run;

pub mod events;

/// Audit sinks fed with every run event.
pub mod audit;

pub mod executor;

pub mod store;

/// Returns the current version of Siemply.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
