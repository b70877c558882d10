//! Inventory and secrets collaborators.
//!
//! The engine consumes two narrow interfaces from here:
//!
//! - [`HostResolver::resolve_hosts`] turns group names / host names into a
//!   concrete, deduplicated host list, failing loudly instead of silently
//!   returning zero hosts.
//! - [`AuthResolver::resolve_auth`] produces authentication material for a
//!   host, failing with `SecretNotFound`.
//!
//! [`Inventory`] is the in-memory implementation, loadable from the usual
//! `all: { hosts, children, vars }` YAML layout.

mod host;

pub use host::{facts, AuthDescriptor, AuthMaterial, Host, HostFacts};

use indexmap::IndexMap;
use serde_yaml::Value as YamlValue;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Resolves target patterns into hosts.
pub trait HostResolver: Send + Sync {
    /// Resolve group names, host names or `all` into hosts.
    fn resolve_hosts(&self, patterns: &[String]) -> Result<Vec<Host>>;
}

/// Resolves authentication material for a host.
#[cfg_attr(test, mockall::automock)]
pub trait AuthResolver: Send + Sync {
    /// Produce the credentials used to open a session to `host`.
    fn resolve_auth(&self, host: &Host) -> Result<AuthMaterial>;
}

/// A named group of hosts
#[derive(Debug, Clone, Default)]
pub struct Group {
    /// Group name
    pub name: String,
    /// Host names directly in this group
    pub hosts: Vec<String>,
    /// Child group names
    pub children: Vec<String>,
}

/// In-memory inventory
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    hosts: IndexMap<String, Host>,
    groups: IndexMap<String, Group>,
}

const CONNECTION_KEYS: &[&str] = &[
    "ansible_host",
    "address",
    "ansible_user",
    "user",
    "ansible_port",
    "port",
    "ansible_ssh_private_key_file",
    "private_key_file",
    "password_env",
    "passphrase_env",
];

impl Inventory {
    /// Create an empty inventory
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a host, registering it with each of its groups
    pub fn add_host(&mut self, host: Host) {
        for group in &host.groups {
            let entry = self
                .groups
                .entry(group.clone())
                .or_insert_with(|| Group {
                    name: group.clone(),
                    ..Default::default()
                });
            if !entry.hosts.contains(&host.name) {
                entry.hosts.push(host.name.clone());
            }
        }
        self.hosts.insert(host.name.clone(), host);
    }

    /// Add an (initially empty) group, optionally as a child of `parent`
    pub fn add_group(&mut self, name: impl Into<String>, parent: Option<&str>) {
        let name = name.into();
        self.groups.entry(name.clone()).or_insert_with(|| Group {
            name: name.clone(),
            ..Default::default()
        });
        if let Some(parent) = parent {
            let parent = self
                .groups
                .entry(parent.to_string())
                .or_insert_with(|| Group {
                    name: parent.to_string(),
                    ..Default::default()
                });
            if !parent.children.contains(&name) {
                parent.children.push(name);
            }
        }
    }

    /// Look up a host by name
    pub fn host(&self, name: &str) -> Option<&Host> {
        self.hosts.get(name)
    }

    /// Look up a group by name
    pub fn group(&self, name: &str) -> Option<&Group> {
        self.groups.get(name)
    }

    /// All hosts in insertion order
    pub fn hosts(&self) -> impl Iterator<Item = &Host> {
        self.hosts.values()
    }

    /// Number of hosts
    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    /// Whether the inventory has no hosts
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Hosts of a group including all of its descendants
    pub fn group_hosts(&self, name: &str) -> Vec<&Host> {
        let mut seen_groups = HashSet::new();
        let mut names = Vec::new();
        self.collect_group_hosts(name, &mut seen_groups, &mut names);
        names.iter().filter_map(|n| self.hosts.get(n)).collect()
    }

    fn collect_group_hosts(
        &self,
        name: &str,
        seen_groups: &mut HashSet<String>,
        out: &mut Vec<String>,
    ) {
        if !seen_groups.insert(name.to_string()) {
            return;
        }
        if let Some(group) = self.groups.get(name) {
            for host in &group.hosts {
                if !out.contains(host) {
                    out.push(host.clone());
                }
            }
            for child in &group.children {
                self.collect_group_hosts(child, seen_groups, out);
            }
        }
    }

    /// Load an inventory YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| Error::InventoryLoad {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::from_yaml_str(&content).map_err(|e| Error::InventoryLoad {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Parse an inventory from YAML
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let doc: YamlValue = serde_yaml::from_str(content)?;
        let mut inventory = Inventory::new();

        let root = doc.get("all").cloned().unwrap_or(doc);
        inventory.parse_group("all", &root, None, &IndexMap::new())?;

        debug!(
            hosts = inventory.hosts.len(),
            groups = inventory.groups.len(),
            "Inventory loaded"
        );
        Ok(inventory)
    }

    fn parse_group(
        &mut self,
        name: &str,
        data: &YamlValue,
        parent: Option<&str>,
        inherited_vars: &IndexMap<String, YamlValue>,
    ) -> Result<()> {
        self.add_group(name, parent);

        let mut vars = inherited_vars.clone();
        if let Some(YamlValue::Mapping(map)) = data.get("vars") {
            for (k, v) in map {
                if let Some(key) = k.as_str() {
                    vars.insert(key.to_string(), v.clone());
                }
            }
        }

        if let Some(YamlValue::Mapping(hosts)) = data.get("hosts") {
            for (host_name, host_data) in hosts {
                let host_name = host_name
                    .as_str()
                    .ok_or_else(|| Error::Config("host names must be strings".into()))?;
                self.merge_host(host_name, name, host_data, &vars)?;
            }
        }

        if let Some(YamlValue::Mapping(children)) = data.get("children") {
            for (child_name, child_data) in children {
                let child_name = child_name
                    .as_str()
                    .ok_or_else(|| Error::Config("group names must be strings".into()))?;
                self.parse_group(child_name, child_data, Some(name), &vars)?;
            }
        }

        Ok(())
    }

    fn merge_host(
        &mut self,
        name: &str,
        group: &str,
        data: &YamlValue,
        group_vars: &IndexMap<String, YamlValue>,
    ) -> Result<()> {
        if let Some(existing) = self.hosts.get_mut(name) {
            existing.groups.insert(group.to_string());
            if let Some(g) = self.groups.get_mut(group) {
                if !g.hosts.iter().any(|h| h == name) {
                    g.hosts.push(name.to_string());
                }
            }
            return Ok(());
        }

        let text = |keys: &[&str]| -> Option<String> {
            keys.iter()
                .find_map(|k| data.get(*k))
                .and_then(|v| v.as_str().map(String::from))
        };

        let mut host = Host::with_address(
            name,
            text(&["ansible_host", "address"]).unwrap_or_else(|| name.to_string()),
        );
        host.user = text(&["ansible_user", "user"]);
        if let Some(port) = ["ansible_port", "port"]
            .iter()
            .find_map(|k| data.get(*k))
            .and_then(|v| v.as_u64())
        {
            host.port = u16::try_from(port)
                .map_err(|_| Error::Config(format!("invalid port for host '{}'", name)))?;
        }
        host.auth = AuthDescriptor {
            private_key_file: text(&["ansible_ssh_private_key_file", "private_key_file"])
                .map(PathBuf::from),
            password_env: text(&["password_env"]),
            passphrase_env: text(&["passphrase_env"]),
        };

        for (key, value) in group_vars {
            host.facts.insert(key.clone(), serde_json::to_value(value)?);
        }
        if let YamlValue::Mapping(map) = data {
            for (k, v) in map {
                let Some(key) = k.as_str() else { continue };
                if CONNECTION_KEYS.contains(&key) {
                    continue;
                }
                host.facts.insert(key.to_string(), serde_json::to_value(v)?);
            }
        }

        host.groups.insert(group.to_string());
        self.add_host(host);
        Ok(())
    }
}

impl HostResolver for Inventory {
    fn resolve_hosts(&self, patterns: &[String]) -> Result<Vec<Host>> {
        let mut resolved: Vec<Host> = Vec::new();
        let mut seen_addresses = HashSet::new();

        for pattern in patterns {
            let candidates: Vec<&Host> = if pattern == "all" || pattern == "*" {
                self.hosts.values().collect()
            } else if self.groups.contains_key(pattern.as_str()) {
                let hosts = self.group_hosts(pattern);
                if hosts.is_empty() {
                    return Err(Error::EmptyGroup(pattern.clone()));
                }
                hosts
            } else if let Some(host) = self.hosts.get(pattern.as_str()) {
                vec![host]
            } else {
                return Err(Error::UnknownHost(pattern.clone()));
            };

            for host in candidates {
                let key = format!("{}:{}", host.address, host.port);
                if seen_addresses.insert(key) {
                    resolved.push(host.clone());
                } else {
                    debug!(host = %host.name, address = %host.address, "Skipping duplicate address");
                }
            }
        }

        if resolved.is_empty() {
            return Err(Error::NoHosts);
        }
        Ok(resolved)
    }
}

/// Narrow a resolved host list to the hosts named (or grouped) in `limit`.
pub fn apply_limit(hosts: Vec<Host>, limit: &[String]) -> Result<Vec<Host>> {
    if limit.is_empty() {
        return Ok(hosts);
    }
    let limited: Vec<Host> = hosts
        .into_iter()
        .filter(|h| limit.iter().any(|l| l == &h.name || h.is_member_of(l)))
        .collect();
    if limited.is_empty() {
        warn!(limit = ?limit, "Limit matched no hosts");
        return Err(Error::NoHosts);
    }
    Ok(limited)
}

/// Resolves credentials from inventory references and the environment.
#[derive(Debug, Clone)]
pub struct InventoryAuthResolver {
    default_user: String,
    default_key: Option<PathBuf>,
    use_agent: bool,
}

impl InventoryAuthResolver {
    /// Create a resolver with fallbacks for hosts that declare nothing
    pub fn new(default_user: impl Into<String>, default_key: Option<PathBuf>) -> Self {
        Self {
            default_user: default_user.into(),
            default_key,
            use_agent: true,
        }
    }

    /// Enable or disable SSH agent authentication
    pub fn with_agent(mut self, use_agent: bool) -> Self {
        self.use_agent = use_agent;
        self
    }

    fn read_env(host: &Host, var: &str) -> Result<String> {
        std::env::var(var).map_err(|_| {
            Error::secret_not_found(&host.name, format!("environment variable {} is not set", var))
        })
    }
}

impl AuthResolver for InventoryAuthResolver {
    fn resolve_auth(&self, host: &Host) -> Result<AuthMaterial> {
        let password = match &host.auth.password_env {
            Some(var) => Some(Self::read_env(host, var)?),
            None => None,
        };
        let passphrase = match &host.auth.passphrase_env {
            Some(var) => Some(Self::read_env(host, var)?),
            None => None,
        };
        let private_key_file = host
            .auth
            .private_key_file
            .clone()
            .or_else(|| self.default_key.clone());

        if let Some(key) = &private_key_file {
            if host.auth.private_key_file.is_some() && !key.exists() {
                return Err(Error::secret_not_found(
                    &host.name,
                    format!("key file {} does not exist", key.display()),
                ));
            }
        }

        Ok(AuthMaterial {
            user: host
                .user
                .clone()
                .unwrap_or_else(|| self.default_user.clone()),
            private_key_file,
            passphrase,
            password,
            use_agent: self.use_agent,
        })
    }
}
