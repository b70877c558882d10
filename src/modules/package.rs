//! Package module - install or remove OS packages
//!
//! The package manager is taken from the `manager` parameter, then from the
//! host's `os_family` fact, then detected on the host.

use async_trait::async_trait;

use super::{Module, ModuleContext, ModuleError, ModuleOutput, ModuleParams, ModuleResult, ParamExt};
use crate::connection::escape_shell_arg;
use crate::inventory::facts;

/// Supported package managers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Apt,
    Dnf,
    Yum,
}

impl PackageManager {
    pub fn from_str(s: &str) -> ModuleResult<Self> {
        match s.to_lowercase().as_str() {
            "apt" | "apt-get" => Ok(PackageManager::Apt),
            "dnf" => Ok(PackageManager::Dnf),
            "yum" => Ok(PackageManager::Yum),
            _ => Err(ModuleError::InvalidParameter(format!(
                "Unknown package manager: {}",
                s
            ))),
        }
    }

    /// Manager implied by an OS family fact
    pub fn for_os_family(family: &str) -> Option<Self> {
        match family.to_lowercase().as_str() {
            "redhat" | "rhel" | "centos" | "rocky" | "almalinux" | "amazon" | "fedora" => {
                Some(PackageManager::Yum)
            }
            "debian" | "ubuntu" => Some(PackageManager::Apt),
            _ => None,
        }
    }

    /// Detect the manager on the host
    async fn detect(context: &ModuleContext<'_>) -> ModuleResult<Self> {
        let candidates = [
            ("dnf", PackageManager::Dnf),
            ("yum", PackageManager::Yum),
            ("apt-get", PackageManager::Apt),
        ];
        for (binary, manager) in candidates {
            if context
                .run(&format!("command -v {} >/dev/null 2>&1", binary))
                .await?
                .success
            {
                return Ok(manager);
            }
        }
        Err(ModuleError::PreconditionFailed(
            "no supported package manager found".into(),
        ))
    }

    fn query_cmd(&self, package: &str) -> String {
        match self {
            PackageManager::Apt => format!(
                "dpkg-query -W -f='${{Status}}' {} 2>/dev/null | grep -q 'install ok installed'",
                escape_shell_arg(package)
            ),
            PackageManager::Dnf | PackageManager::Yum => {
                format!("rpm -q {} >/dev/null 2>&1", escape_shell_arg(package))
            }
        }
    }

    fn install_cmd(&self, packages: &[String], latest: bool) -> String {
        let list = packages
            .iter()
            .map(|p| escape_shell_arg(p))
            .collect::<Vec<_>>()
            .join(" ");
        match (self, latest) {
            (PackageManager::Apt, false) => {
                format!("DEBIAN_FRONTEND=noninteractive apt-get install -y {}", list)
            }
            (PackageManager::Apt, true) => format!(
                "DEBIAN_FRONTEND=noninteractive apt-get install -y --only-upgrade {}",
                list
            ),
            (PackageManager::Dnf, false) => format!("dnf install -y {}", list),
            (PackageManager::Dnf, true) => format!("dnf upgrade -y {}", list),
            (PackageManager::Yum, false) => format!("yum install -y {}", list),
            (PackageManager::Yum, true) => format!("yum update -y {}", list),
        }
    }

    fn remove_cmd(&self, packages: &[String]) -> String {
        let list = packages
            .iter()
            .map(|p| escape_shell_arg(p))
            .collect::<Vec<_>>()
            .join(" ");
        match self {
            PackageManager::Apt => {
                format!("DEBIAN_FRONTEND=noninteractive apt-get remove -y {}", list)
            }
            PackageManager::Dnf => format!("dnf remove -y {}", list),
            PackageManager::Yum => format!("yum remove -y {}", list),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PackageState {
    Present,
    Absent,
    Latest,
}

impl PackageState {
    fn from_str(s: &str) -> ModuleResult<Self> {
        match s.to_lowercase().as_str() {
            "present" | "installed" => Ok(PackageState::Present),
            "absent" | "removed" => Ok(PackageState::Absent),
            "latest" => Ok(PackageState::Latest),
            _ => Err(ModuleError::InvalidParameter(format!(
                "Invalid state '{}'. Valid states: present, absent, latest",
                s
            ))),
        }
    }
}

/// Module for package management
pub struct PackageModule;

#[async_trait]
impl Module for PackageModule {
    fn name(&self) -> &'static str {
        "package"
    }

    fn description(&self) -> &'static str {
        "Install or remove packages with the host's package manager"
    }

    fn required_params(&self) -> &[&'static str] {
        &["name"]
    }

    fn validate_params(&self, params: &ModuleParams) -> ModuleResult<()> {
        if let Some(state) = params.get_string("state")? {
            PackageState::from_str(&state)?;
        }
        if let Some(manager) = params.get_string("manager")? {
            PackageManager::from_str(&manager)?;
        }
        Ok(())
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &mut ModuleContext<'_>,
    ) -> ModuleResult<ModuleOutput> {
        let packages = params
            .get_vec_string("name")?
            .filter(|p| !p.is_empty())
            .ok_or_else(|| ModuleError::MissingParameter("name".into()))?;
        let state = match params.get_string("state")? {
            Some(s) => PackageState::from_str(&s)?,
            None => PackageState::Present,
        };

        let manager = match params.get_string("manager")? {
            Some(m) => PackageManager::from_str(&m)?,
            None => match context
                .lookup_str(facts::OS_FAMILY)
                .and_then(PackageManager::for_os_family)
            {
                Some(m) => m,
                None => PackageManager::detect(context).await?,
            },
        };

        let mut installed = Vec::new();
        let mut missing = Vec::new();
        for package in &packages {
            if context.run(&manager.query_cmd(package)).await?.success {
                installed.push(package.clone());
            } else {
                missing.push(package.clone());
            }
        }

        let all_present = missing.is_empty();
        let (command, targets) = match state {
            PackageState::Present if missing.is_empty() => {
                return Ok(ModuleOutput::ok("All packages already installed"));
            }
            PackageState::Present => (manager.install_cmd(&missing, false), missing),
            PackageState::Absent if installed.is_empty() => {
                return Ok(ModuleOutput::ok("All packages already absent"));
            }
            PackageState::Absent => (manager.remove_cmd(&installed), installed),
            PackageState::Latest => (manager.install_cmd(&packages, all_present), packages),
        };

        if context.dry_run {
            return Ok(ModuleOutput::changed(format!("Would run: {}", command))
                .with_data("packages", serde_json::json!(targets)));
        }

        let result = context.run_checked(&command).await?;
        let output = match state {
            PackageState::Latest => {
                // yum/dnf say "Nothing to do", apt says "already the newest version"
                let current = all_present
                    && (result.stdout.contains("Nothing to do")
                        || result.stdout.contains("is already the newest version"));
                ModuleOutput::changed_if(
                    !current,
                    format!("Packages at latest: {}", targets.join(", ")),
                )
            }
            PackageState::Absent => {
                ModuleOutput::changed(format!("Packages removed: {}", targets.join(", ")))
            }
            PackageState::Present => {
                ModuleOutput::changed(format!("Packages installed: {}", targets.join(", ")))
            }
        };
        Ok(output
            .with_data("packages", serde_json::json!(targets))
            .with_command_output(&result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manager_for_os_family() {
        assert_eq!(PackageManager::for_os_family("RedHat"), Some(PackageManager::Yum));
        assert_eq!(PackageManager::for_os_family("Debian"), Some(PackageManager::Apt));
        assert_eq!(PackageManager::for_os_family("Solaris"), None);
    }

    #[test]
    fn test_install_cmd() {
        let pkgs = vec!["curl".to_string(), "tar".to_string()];
        assert_eq!(
            PackageManager::Yum.install_cmd(&pkgs, false),
            "yum install -y 'curl' 'tar'"
        );
        assert!(PackageManager::Apt.remove_cmd(&pkgs).contains("apt-get remove -y"));
    }
}
