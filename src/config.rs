//! Configuration module for siemply
//!
//! Handles loading and merging configuration from multiple sources:
//! - Default values
//! - System configuration (/etc/siemply/siemply.toml)
//! - User configuration (~/.siemply/config.toml)
//! - Project configuration (./siemply.toml)
//! - Environment variables
//!
//! Command-line flags are applied on top by the CLI.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::playbook::ExecutionPolicy;
use crate::strategy::{MaxFailures, RollingStrategy};

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default run settings
    pub defaults: Defaults,

    /// SSH settings
    pub ssh: SshConfig,

    /// Splunk installation layout
    pub splunk: SplunkSettings,

    /// Audit trail and run archive
    pub audit: AuditConfig,

    /// Logging settings
    pub logging: LoggingConfig,
}

/// Default run settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Defaults {
    /// Default inventory path
    pub inventory: Option<PathBuf>,

    /// Directory searched for playbooks given by bare name
    pub playbook_dir: Option<PathBuf>,

    /// Default remote user
    pub remote_user: String,

    /// Run-wide concurrency ceiling
    pub forks: usize,

    /// Hosts per batch
    pub batch_size: usize,

    /// Soak time between batches
    #[serde(with = "humantime_serde")]
    pub batch_delay: Duration,

    /// Whole-run timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Option<Duration>,

    /// Per-task timeout
    #[serde(with = "humantime_serde")]
    pub task_timeout: Duration,

    /// Retries for transient task failures
    pub retries: u32,

    /// Base delay between retries
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,

    /// Failure threshold
    pub max_failures: Option<MaxFailures>,

    /// Rolling strategy
    pub strategy: RollingStrategy,
}

impl Default for Defaults {
    fn default() -> Self {
        let policy = ExecutionPolicy::default();
        Self {
            inventory: None,
            playbook_dir: None,
            remote_user: "root".to_string(),
            forks: policy.forks,
            batch_size: policy.batch_size,
            batch_delay: policy.batch_delay,
            timeout: policy.timeout,
            task_timeout: policy.task_timeout,
            retries: policy.retries,
            retry_delay: policy.retry_delay,
            max_failures: policy.max_failures,
            strategy: policy.strategy,
        }
    }
}

/// SSH configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    /// Default port
    pub port: u16,

    /// Session connect timeout
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Private key used when a host declares none
    pub private_key_file: Option<PathBuf>,

    /// Try the SSH agent before key files
    pub use_agent: bool,

    /// Accept host keys not present in known_hosts
    pub accept_unknown_hosts: bool,

    /// Close idle sessions after this long
    #[serde(with = "humantime_serde")]
    pub inactivity_timeout: Option<Duration>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            port: 22,
            connect_timeout: Duration::from_secs(10),
            private_key_file: None,
            use_agent: true,
            accept_unknown_hosts: true,
            inactivity_timeout: Some(Duration::from_secs(300)),
        }
    }
}

/// Where Splunk lives on managed hosts. Hosts and tasks may override any of
/// these through facts, vars or parameters of the same name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplunkSettings {
    pub splunk_home: String,
    pub splunk_user: String,
    pub splunk_group: String,
    /// Where downloaded packages are cached on the host
    pub package_cache_dir: String,
    pub backup_dir: String,
    /// Remote directory for checkpoint archives
    pub checkpoint_dir: String,
    /// Base URL packages are fetched from
    pub download_url: String,
}

impl Default for SplunkSettings {
    fn default() -> Self {
        Self {
            splunk_home: "/opt/splunk".to_string(),
            splunk_user: "splunk".to_string(),
            splunk_group: "splunk".to_string(),
            package_cache_dir: "/tmp/splunk_packages".to_string(),
            backup_dir: "/opt/splunk_backups".to_string(),
            checkpoint_dir: "/opt/siemply/checkpoints".to_string(),
            download_url: "https://download.splunk.com/products".to_string(),
        }
    }
}

/// Audit trail settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Record run events at all
    pub enabled: bool,

    /// JSON-lines event log
    pub log_path: Option<PathBuf>,

    /// Directory receiving one JSON document per finished run
    pub archive_dir: Option<PathBuf>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_path: None,
            archive_dir: None,
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Level used when neither RUST_LOG nor -v is given
    pub level: String,

    /// "text" or "json"
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            format: "text".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from all sources
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut config = Config::default();

        for path in Self::config_paths(config_path) {
            if path.exists() {
                config = Self::from_file(&path)?;
            }
        }

        config.apply_env_overrides();
        Ok(config)
    }

    /// Configuration files in increasing precedence. Each file is a complete
    /// document over the defaults, so the last one found wins.
    fn config_paths(explicit_path: Option<&Path>) -> Vec<PathBuf> {
        if let Some(path) = explicit_path {
            return vec![path.to_path_buf()];
        }
        if let Ok(env_config) = std::env::var("SIEMPLY_CONFIG") {
            return vec![PathBuf::from(env_config)];
        }

        let mut paths = vec![PathBuf::from("/etc/siemply/siemply.toml")];
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".siemply/config.toml"));
        }
        paths.push(PathBuf::from("siemply.toml"));
        paths
    }

    /// Load a single configuration file over the defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let config = match extension {
            "yml" | "yaml" => serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?,
            "json" => serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?,
            _ => toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?,
        };
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        fn var(name: &str) -> Option<String> {
            std::env::var(name).ok().filter(|v| !v.is_empty())
        }
        fn duration(name: &str) -> Option<Duration> {
            var(name).and_then(|v| humantime_serde::re::humantime::parse_duration(&v).ok())
        }

        if let Some(n) = var("SIEMPLY_FORKS").and_then(|v| v.parse().ok()) {
            self.defaults.forks = n;
        }
        if let Some(n) = var("SIEMPLY_BATCH_SIZE").and_then(|v| v.parse().ok()) {
            self.defaults.batch_size = n;
        }
        if let Some(d) = duration("SIEMPLY_BATCH_DELAY") {
            self.defaults.batch_delay = d;
        }
        if let Some(d) = duration("SIEMPLY_TIMEOUT") {
            self.defaults.timeout = Some(d);
        }
        if let Some(user) = var("SIEMPLY_REMOTE_USER") {
            self.defaults.remote_user = user;
        }
        if let Some(file) = var("SIEMPLY_PRIVATE_KEY_FILE") {
            self.ssh.private_key_file = Some(PathBuf::from(file));
        }
        if let Some(home) = var("SIEMPLY_SPLUNK_HOME") {
            self.splunk.splunk_home = home;
        }
        if let Some(path) = var("SIEMPLY_AUDIT_LOG") {
            self.audit.log_path = Some(PathBuf::from(path));
        }
    }

    /// Execution policy built from the configured defaults
    pub fn default_policy(&self) -> ExecutionPolicy {
        ExecutionPolicy {
            forks: self.defaults.forks,
            batch_size: self.defaults.batch_size,
            batch_delay: self.defaults.batch_delay,
            timeout: self.defaults.timeout,
            max_failures: self.defaults.max_failures,
            strategy: self.defaults.strategy,
            retries: self.defaults.retries,
            retry_delay: self.defaults.retry_delay,
            task_timeout: self.defaults.task_timeout,
            connect_timeout: self.ssh.connect_timeout,
            ..ExecutionPolicy::default()
        }
    }

    /// Get the effective inventory path
    pub fn inventory_path(&self) -> Option<&PathBuf> {
        self.defaults.inventory.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::CountOrPercent;
    use pretty_assertions::assert_eq;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.defaults.forks, 10);
        assert_eq!(config.defaults.batch_delay, Duration::from_secs(300));
        assert_eq!(config.ssh.port, 22);
        assert_eq!(config.splunk.splunk_home, "/opt/splunk");
        assert_eq!(config.default_policy(), ExecutionPolicy::default());
    }

    #[test]
    fn test_load_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[defaults]
forks = 4
batch_delay = "30s"
max_failures = "25%"
strategy = "canary"

[splunk]
splunk_home = "/opt/splunkforwarder"
"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.defaults.forks, 4);
        assert_eq!(config.defaults.batch_size, 10);
        assert_eq!(config.splunk.splunk_home, "/opt/splunkforwarder");
        assert_eq!(config.splunk.splunk_user, "splunk");

        let policy = config.default_policy();
        assert_eq!(policy.batch_delay, Duration::from_secs(30));
        assert_eq!(policy.max_failures, Some(CountOrPercent::Percent(25.0)));
        assert_eq!(policy.strategy, RollingStrategy::Canary);
    }

    #[test]
    fn test_load_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yml").tempfile().unwrap();
        writeln!(file, "ssh:\n  port: 2222\n  connect_timeout: 5s\n").unwrap();
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.ssh.port, 2222);
        assert_eq!(config.default_policy().connect_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_file_reports_path() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "defaults = [").unwrap();
        let err = Config::from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    #[serial]
    fn test_env_override() {
        std::env::set_var("SIEMPLY_FORKS", "20");
        std::env::set_var("SIEMPLY_BATCH_DELAY", "1m");
        std::env::set_var("SIEMPLY_SPLUNK_HOME", "/srv/splunk");
        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.defaults.forks, 20);
        assert_eq!(config.defaults.batch_delay, Duration::from_secs(60));
        assert_eq!(config.splunk.splunk_home, "/srv/splunk");
        std::env::remove_var("SIEMPLY_FORKS");
        std::env::remove_var("SIEMPLY_BATCH_DELAY");
        std::env::remove_var("SIEMPLY_SPLUNK_HOME");
    }
}
