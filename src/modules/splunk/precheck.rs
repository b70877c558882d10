//! Pre-upgrade host checks

use async_trait::async_trait;

use super::{is_forwarder, port_listening, splunk_home};
use crate::config::SplunkSettings;
use crate::connection::escape_shell_arg;
use crate::modules::{Module, ModuleContext, ModuleError, ModuleOutput, ModuleParams, ModuleResult, ParamExt};

const MIN_OPEN_FILES: u64 = 8192;

/// Verify disk, memory, ulimits, SELinux, ports and python3 before an upgrade.
///
/// Never mutates the host; failed checks are reported together as one
/// precondition failure.
pub struct SplunkPrecheckModule {
    settings: SplunkSettings,
}

impl SplunkPrecheckModule {
    pub fn new(settings: SplunkSettings) -> Self {
        Self { settings }
    }
}

fn parse_number(stdout: &str) -> Option<u64> {
    stdout
        .trim()
        .trim_end_matches(|c: char| c.is_ascii_alphabetic())
        .parse()
        .ok()
}

#[async_trait]
impl Module for SplunkPrecheckModule {
    fn name(&self) -> &'static str {
        "splunk_precheck"
    }

    fn description(&self) -> &'static str {
        "Check that a host is fit for a Splunk upgrade"
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &mut ModuleContext<'_>,
    ) -> ModuleResult<ModuleOutput> {
        let home = splunk_home(params, context, &self.settings)?;
        let mut failures: Vec<String> = Vec::new();
        let mut passed: Vec<&str> = Vec::new();

        if params.get_bool_or("check_disk_space", true) {
            let min_gb = match params.get_u64("min_disk_gb")? {
                Some(v) => v,
                None => params.get_u64("min_disk_space_gb")?.unwrap_or(10),
            };
            // Walk up to an existing parent when splunk_home does not exist yet
            let cmd = format!(
                "d={}; while [ ! -e \"$d\" ]; do d=$(dirname \"$d\"); done; df -BG --output=avail \"$d\" | tail -1",
                escape_shell_arg(&home)
            );
            let result = context.run(&cmd).await?;
            match parse_number(&result.stdout) {
                Some(avail) if avail < min_gb => {
                    failures.push(format!("disk space {}GB < {}GB", avail, min_gb))
                }
                Some(_) => passed.push("disk"),
                None => failures.push("could not determine free disk space".into()),
            }
        }

        if params.get_bool_or("check_memory", true) {
            let min_gb = params.get_u64("min_memory_gb")?.unwrap_or(2);
            let result = context.run("free -g | awk 'NR==2{print $2}'").await?;
            match parse_number(&result.stdout) {
                Some(total) if total < min_gb => {
                    failures.push(format!("memory {}GB < {}GB", total, min_gb))
                }
                Some(_) => passed.push("memory"),
                None => failures.push("could not determine memory".into()),
            }
        }

        if params.get_bool_or("check_ulimits", true) {
            let min_files = params.get_u64("min_open_files")?.unwrap_or(MIN_OPEN_FILES);
            let result = context.run("ulimit -n").await?;
            let limit = result.stdout.trim();
            if limit != "unlimited" {
                match parse_number(limit) {
                    Some(n) if n < min_files => {
                        failures.push(format!("open file limit {} < {}", n, min_files))
                    }
                    Some(_) => passed.push("ulimits"),
                    None => failures.push("could not determine open file limit".into()),
                }
            } else {
                passed.push("ulimits");
            }
        }

        if params.get_bool_or("check_selinux", true) {
            let result = context
                .run("getenforce 2>/dev/null || echo Disabled")
                .await?;
            if result.stdout.contains("Enforcing") {
                failures.push("SELinux is Enforcing".into());
            } else {
                passed.push("selinux");
            }
        }

        if params.get_bool_or("check_ports", true) {
            let ports: Vec<u64> = match params.get_vec_string("ports")? {
                Some(list) => list
                    .iter()
                    .map(|p| {
                        p.parse().map_err(|_| {
                            ModuleError::InvalidParameter(format!("invalid port '{}'", p))
                        })
                    })
                    .collect::<ModuleResult<_>>()?,
                None if is_forwarder(params, context)? => vec![8089],
                None => vec![8089, 9997],
            };
            let mut all_listening = true;
            for port in ports {
                if !port_listening(context, port).await? {
                    all_listening = false;
                    failures.push(format!("port {} is not listening", port));
                }
            }
            if all_listening {
                passed.push("ports");
            }
        }

        if params.get_bool_or("check_python", true) {
            if context.run("python3 --version").await?.success {
                passed.push("python");
            } else {
                failures.push("python3 not available".into());
            }
        }

        if !failures.is_empty() {
            return Err(ModuleError::PreconditionFailed(failures.join("; ")));
        }
        Ok(ModuleOutput::ok(format!("All pre-checks passed ({})", passed.join(", ")))
            .with_data("checks", serde_json::json!(passed)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number(" 42G\n"), Some(42));
        assert_eq!(parse_number("1024"), Some(1024));
        assert_eq!(parse_number("Avail"), None);
    }
}
