//! Connection layer for remote host communication.
//!
//! A [`Connector`] opens an authenticated [`Session`] to one host. The
//! session offers command execution and file transfer, nothing more; every
//! executor talks to its host exclusively through it.
//!
//! Sessions are owned by exactly one host state machine for their whole
//! lifetime and are never shared across concurrent task executions. There is
//! no automatic reconnection: a dropped session surfaces as a
//! [`ConnectionError`] and the task retry policy decides whether a fresh
//! session gets opened.
//!
//! # Example
//!
//! ```rust,ignore
//! use siemply::connection::{Connector, ExecuteOptions};
//! use siemply::connection::russh::SshConnector;
//!
//! let connector = SshConnector::new(ssh_config);
//! let session = connector.open(&host, &auth, Duration::from_secs(10)).await?;
//!
//! let opts = ExecuteOptions::new().with_timeout(Duration::from_secs(30));
//! let result = session.execute("uname -a", Some(opts)).await?;
//! println!("Output: {}", result.stdout);
//!
//! session.close().await?;
//! ```

/// Pure Rust SSH implementation using russh.
#[cfg(feature = "russh")]
pub mod russh;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::inventory::{AuthMaterial, Host};

/// Error type of the russh client handler
#[cfg(feature = "russh")]
#[derive(Debug, Error)]
#[error("ssh transport: {0}")]
pub struct RusshError(#[from] pub ::russh::Error);

#[cfg(feature = "russh")]
impl From<::russh::Error> for ConnectionError {
    fn from(err: ::russh::Error) -> Self {
        ConnectionError::SshError(err.to_string())
    }
}

#[cfg(feature = "russh")]
impl From<russh_sftp::client::error::Error> for ConnectionError {
    fn from(e: russh_sftp::client::error::Error) -> Self {
        ConnectionError::TransferFailed(format!("SFTP error: {}", e))
    }
}

/// Connection-layer failures, classified for the retry policy
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// Failed to establish the network connection or SSH handshake.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Authentication was rejected by the remote host.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Connecting took longer than the connect timeout.
    #[error("Connection timeout after {0:?}")]
    Timeout(Duration),

    /// A remote command did not finish within its timeout.
    #[error("Command timed out after {0:?}")]
    CommandTimeout(Duration),

    /// The command never ran; a non-zero exit is not an error here.
    #[error("Command execution failed: {0}")]
    ExecutionFailed(String),

    /// File upload failed.
    #[error("File transfer failed: {0}")]
    TransferFailed(String),

    /// Protocol error from the SSH backend
    #[error("SSH error: {0}")]
    SshError(String),

    /// Socket or local file I/O
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// The session was closed or dropped by the peer.
    #[error("Session closed")]
    ConnectionClosed,

    /// Connection parameters are invalid or incomplete.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ConnectionError {
    /// Whether a retry with a fresh attempt may succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, ConnectionError::InvalidConfig(_))
    }

    /// Whether the host itself could not be reached (as opposed to a slow command).
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            ConnectionError::ConnectionFailed(_)
                | ConnectionError::AuthenticationFailed(_)
                | ConnectionError::Timeout(_)
                | ConnectionError::ConnectionClosed
                | ConnectionError::SshError(_)
                | ConnectionError::IoError(_)
        )
    }

    /// Whether the session should be discarded before the next attempt.
    pub fn invalidates_session(&self) -> bool {
        !matches!(
            self,
            ConnectionError::CommandTimeout(_)
                | ConnectionError::TransferFailed(_)
                | ConnectionError::InvalidConfig(_)
        )
    }
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Exit status and captured output of one remote command.
///
/// ```rust
/// use siemply::connection::CommandResult;
///
/// let status = CommandResult::success("splunkd is running\n".into(), String::new());
/// assert!(status.success);
///
/// let missing = CommandResult::failure(127, String::new(), "splunk: not found".into());
/// assert_eq!(missing.exit_code, 127);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// `exit_code == 0`
    pub success: bool,
}

impl CommandResult {
    pub fn success(stdout: String, stderr: String) -> Self {
        Self {
            exit_code: 0,
            stdout,
            stderr,
            success: true,
        }
    }

    pub fn failure(exit_code: i32, stdout: String, stderr: String) -> Self {
        Self {
            exit_code,
            stdout,
            stderr,
            success: false,
        }
    }

    /// stdout and stderr joined by a newline, skipping an empty side
    pub fn combined_output(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

/// How a command is launched on the remote shell
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Directory to `cd` into first
    pub cwd: Option<String>,
    /// Variables prefixed to the command line, sorted for stable output
    pub env: BTreeMap<String, String>,
    /// Upper bound on the command's run time
    pub timeout: Option<Duration>,
}

impl ExecuteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The command line actually sent to the host
    pub fn wrap_command(&self, command: &str) -> String {
        let assignments: String = self
            .env
            .iter()
            .map(|(key, value)| format!("{}={} ", key, escape_shell_arg(value)))
            .collect();
        let line = format!("{}{}", assignments, command);
        match &self.cwd {
            Some(cwd) => format!("cd {} && {}", escape_shell_arg(cwd), line),
            None => line,
        }
    }
}

/// Attributes applied to an uploaded file
#[derive(Debug, Clone, Default)]
pub struct TransferOptions {
    /// Octal permission bits
    pub mode: Option<u32>,
    pub owner: Option<String>,
    pub group: Option<String>,
    /// `mkdir -p` the parent directory before writing
    pub create_dirs: bool,
}

impl TransferOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_create_dirs(mut self) -> Self {
        self.create_dirs = true;
        self
    }
}

/// An authenticated remote-shell session to one host.
#[async_trait]
pub trait Session: Send + Sync {
    /// Host name this session belongs to
    fn identifier(&self) -> &str;

    /// Check if the session is still usable
    async fn is_alive(&self) -> bool;

    /// Run `command` through the remote shell
    async fn execute(
        &self,
        command: &str,
        options: Option<ExecuteOptions>,
    ) -> ConnectionResult<CommandResult>;

    /// Write content to a remote file
    async fn put_file(
        &self,
        content: &[u8],
        remote_path: &Path,
        options: Option<TransferOptions>,
    ) -> ConnectionResult<()>;

    /// Release the session. Safe to call more than once.
    async fn close(&self) -> ConnectionResult<()>;

    /// `test -e` on the remote path
    async fn path_exists(&self, path: &Path) -> ConnectionResult<bool> {
        let cmd = format!("test -e {}", escape_shell_arg(&path.to_string_lossy()));
        Ok(self.execute(&cmd, None).await?.success)
    }
}

/// Opens sessions to hosts.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open an authenticated session, failing after `connect_timeout`.
    async fn open(
        &self,
        host: &Host,
        auth: &AuthMaterial,
        connect_timeout: Duration,
    ) -> ConnectionResult<Box<dyn Session>>;
}

/// Quote `s` as one POSIX shell word.
pub fn escape_shell_arg(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}
