//! Error types for siemply.
//!
//! Host-scoped failures (connectivity, task logic) never surface through this
//! type: they are captured into the run record by the host state machine.
//! What reaches callers is configuration trouble, collaborator failures
//! (inventory, secrets) and run-store lookups.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for siemply operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for siemply.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// A task references a type that no executor is registered for.
    #[error("Unknown task type '{task_type}' in task '{task}'")]
    UnknownTaskType {
        /// Task name
        task: String,
        /// Requested task type
        task_type: String,
    },

    /// Execution policy is malformed.
    #[error("Invalid execution policy: {0}")]
    InvalidPolicy(String),

    /// Playbook structure is unusable (empty, duplicate names, bad params).
    #[error("Playbook validation failed: {0}")]
    PlaybookValidation(String),

    /// Error parsing a playbook file.
    #[error("Failed to parse playbook '{path}': {message}")]
    PlaybookParse {
        /// Path to the playbook file
        path: PathBuf,
        /// Error message
        message: String,
    },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    // ========================================================================
    // Inventory / Secrets Errors
    // ========================================================================
    /// Host not found in inventory.
    #[error("Host '{0}' not found in inventory")]
    UnknownHost(String),

    /// A group resolved to zero hosts.
    #[error("Group '{0}' contains no hosts")]
    EmptyGroup(String),

    /// The target resolved to no hosts at all.
    #[error("No target hosts resolved")]
    NoHosts,

    /// Error loading inventory.
    #[error("Failed to load inventory from '{path}': {message}")]
    InventoryLoad {
        /// Path to inventory
        path: PathBuf,
        /// Error message
        message: String,
    },

    /// Auth material could not be resolved for a host.
    #[error("Secret not found for host '{host}': {message}")]
    SecretNotFound {
        /// Target host
        host: String,
        /// Error message
        message: String,
    },

    // ========================================================================
    // Run Store Errors
    // ========================================================================
    /// No run with the given id.
    #[error("Run '{0}' not found")]
    RunNotFound(String),

    /// The run has not reached a terminal status yet.
    #[error("Run '{0}' is still active")]
    RunActive(String),

    /// Archiving a finished run failed.
    #[error("Audit error: {0}")]
    Audit(#[from] crate::audit::AuditError),

    // ========================================================================
    // IO / Serialization Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error.
    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    /// JSON parsing error.
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// Template error.
    #[error("Template error: {0}")]
    Template(#[from] minijinja::Error),

    // ========================================================================
    // Other Errors
    // ========================================================================
    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Creates a new unknown task type error.
    pub fn unknown_task_type(task: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self::UnknownTaskType {
            task: task.into(),
            task_type: task_type.into(),
        }
    }

    /// Creates a new secret lookup error.
    pub fn secret_not_found(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SecretNotFound {
            host: host.into(),
            message: message.into(),
        }
    }

    /// Returns true for errors that must stop a run before any host is touched.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::UnknownTaskType { .. }
                | Error::InvalidPolicy(_)
                | Error::PlaybookValidation(_)
                | Error::PlaybookParse { .. }
                | Error::Config(_)
        )
    }

    /// Returns the error code for CLI exit status.
    pub fn exit_code(&self) -> i32 {
        match self {
            e if e.is_configuration() => 78,
            Error::UnknownHost(_)
            | Error::EmptyGroup(_)
            | Error::NoHosts
            | Error::InventoryLoad { .. } => 66,
            Error::SecretNotFound { .. } => 77,
            _ => 1,
        }
    }
}
