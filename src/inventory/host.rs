//! Host definition for the siemply inventory.
//!
//! A `Host` is immutable for the duration of a run: the engine receives it by
//! value and never writes back. Anything a task learns about a host lives in
//! the per-host fact table owned by the host state machine instead.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

/// Free-form host facts (OS family, arch, declared software version, ...)
pub type HostFacts = BTreeMap<String, serde_json::Value>;

/// Well-known fact keys.
pub mod facts {
    /// Operating system family ("RedHat", "Debian", ...)
    pub const OS_FAMILY: &str = "os_family";
    /// Operating system version
    pub const OS_VERSION: &str = "os_version";
    /// CPU architecture ("x86_64", "aarch64")
    pub const CPU_ARCH: &str = "cpu_arch";
    /// Splunk role ("forwarder", "indexer", "search_head", ...)
    pub const SPLUNK_TYPE: &str = "splunk_type";
    /// Installed Splunk version
    pub const SPLUNK_VERSION: &str = "splunk_version";
}

/// How a host authenticates. Only references are kept here; the secret
/// material itself is produced by an [`AuthResolver`](super::AuthResolver).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthDescriptor {
    /// Private key file for public key authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_file: Option<PathBuf>,

    /// Environment variable holding the password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,

    /// Environment variable holding the key passphrase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase_env: Option<String>,
}

/// Resolved authentication material for one host.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct AuthMaterial {
    /// Remote user
    pub user: String,
    /// Private key file to try
    pub private_key_file: Option<PathBuf>,
    /// Passphrase for the private key
    pub passphrase: Option<String>,
    /// Password for password authentication
    pub password: Option<String>,
    /// Whether to try the SSH agent first
    pub use_agent: bool,
}

impl AuthMaterial {
    /// Authentication with only a user name (agent / default keys).
    pub fn user(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            use_agent: true,
            ..Default::default()
        }
    }
}

impl fmt::Debug for AuthMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthMaterial")
            .field("user", &self.user)
            .field("private_key_file", &self.private_key_file)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "***"))
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("use_agent", &self.use_agent)
            .finish()
    }
}

/// A managed host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    /// Inventory name
    pub name: String,

    /// Address to connect to
    pub address: String,

    /// SSH port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Remote user, if the inventory specifies one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Authentication references
    #[serde(default)]
    pub auth: AuthDescriptor,

    /// Groups this host belongs to
    #[serde(default)]
    pub groups: BTreeSet<String>,

    /// Declared facts
    #[serde(default)]
    pub facts: HostFacts,
}

fn default_port() -> u16 {
    22
}

impl Host {
    /// Create a host whose address equals its name
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::with_address(name.clone(), name)
    }

    /// Create a host with an explicit address
    pub fn with_address(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            port: default_port(),
            user: None,
            auth: AuthDescriptor::default(),
            groups: BTreeSet::new(),
            facts: HostFacts::new(),
        }
    }

    /// Builder: add a group membership
    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.groups.insert(group.into());
        self
    }

    /// Builder: set a fact
    pub fn with_fact(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.facts.insert(key.into(), value.into());
        self
    }

    /// Whether the host is a member of `group`
    pub fn is_member_of(&self, group: &str) -> bool {
        self.groups.contains(group)
    }

    /// A fact rendered as a string
    pub fn fact_str(&self, key: &str) -> Option<&str> {
        self.facts.get(key).and_then(|v| v.as_str())
    }

    /// Whether the host carries the indexer designation, either through a
    /// group name or its declared `splunk_type`.
    pub fn is_indexer(&self) -> bool {
        let by_group = self
            .groups
            .iter()
            .any(|g| g.to_ascii_lowercase().contains("indexer"));
        let by_type = self
            .fact_str(facts::SPLUNK_TYPE)
            .map(|t| t.eq_ignore_ascii_case("indexer"))
            .unwrap_or(false);
        by_group || by_type
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_builder() {
        let host = Host::with_address("idx1", "10.0.0.5")
            .in_group("indexers")
            .with_fact(facts::OS_FAMILY, "RedHat");

        assert_eq!(host.address, "10.0.0.5");
        assert_eq!(host.port, 22);
        assert!(host.is_member_of("indexers"));
        assert_eq!(host.fact_str(facts::OS_FAMILY), Some("RedHat"));
    }

    #[test]
    fn test_indexer_designation() {
        assert!(Host::new("a").in_group("prod_indexers").is_indexer());
        assert!(Host::new("b")
            .with_fact(facts::SPLUNK_TYPE, "Indexer")
            .is_indexer());
        assert!(!Host::new("c")
            .with_fact(facts::SPLUNK_TYPE, "forwarder")
            .in_group("forwarders")
            .is_indexer());
    }

    #[test]
    fn test_auth_material_debug_redacts() {
        let auth = AuthMaterial {
            password: Some("hunter2".into()),
            ..AuthMaterial::user("root")
        };
        let debug = format!("{:?}", auth);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("***"));
    }
}
