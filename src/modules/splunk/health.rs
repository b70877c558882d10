//! Runtime checks: status, health, version and readiness

use async_trait::async_trait;
use std::time::Duration;

use super::{extract_version, is_forwarder, port_listening, splunk_bin, splunk_home};
use crate::config::SplunkSettings;
use crate::connection::escape_shell_arg;
use crate::inventory::facts;
use crate::modules::{Module, ModuleContext, ModuleError, ModuleOutput, ModuleParams, ModuleResult, ParamExt};

const RUNNING_MARKER: &str = "splunkd is running";

/// Check splunkd, listening ports and recent errors in splunkd.log
pub struct SplunkHealthCheckModule {
    settings: SplunkSettings,
}

impl SplunkHealthCheckModule {
    pub fn new(settings: SplunkSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Module for SplunkHealthCheckModule {
    fn name(&self) -> &'static str {
        "splunk_health_check"
    }

    fn description(&self) -> &'static str {
        "Check that Splunk is running and healthy"
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &mut ModuleContext<'_>,
    ) -> ModuleResult<ModuleOutput> {
        let home = splunk_home(params, context, &self.settings)?;
        let mut problems = Vec::new();

        if params.get_bool_or("check_splunkd", true) {
            let status = context
                .run(&format!("{} status", splunk_bin(&home)))
                .await?;
            if !status.stdout.contains(RUNNING_MARKER) {
                problems.push("splunkd is not running".to_string());
            }
        }

        if params.get_bool_or("check_web", false) {
            let port = params.get_u64("web_port")?.unwrap_or(8000);
            if !port_listening(context, port).await? {
                problems.push(format!("web interface not listening on port {}", port));
            }
        }

        // Receiving port only applies to indexers
        let default_receiver = !is_forwarder(params, context)?;
        if params.get_bool_or("check_forwarder", default_receiver) {
            let port = params.get_u64("forwarder_port")?.unwrap_or(9997);
            if !port_listening(context, port).await? {
                problems.push(format!("receiving port {} is not listening", port));
            }
        }

        if params.get_bool_or("check_connectivity", false) {
            let forward = context
                .run(&format!("{} list forward-server", splunk_bin(&home)))
                .await?;
            if !forward.success {
                problems.push("forward-server check failed".into());
            }
        }

        if params.get_bool_or("check_logs", true) {
            let log = format!("{}/var/log/splunk/splunkd.log", home.trim_end_matches('/'));
            let errors = context
                .run(&format!(
                    "tail -n 500 {} 2>/dev/null | grep -c ' ERROR '",
                    escape_shell_arg(&log)
                ))
                .await?;
            let max_errors = params.get_u64("max_log_errors")?.unwrap_or(0);
            let count: u64 = errors.stdout.trim().parse().unwrap_or(0);
            if count > max_errors {
                problems.push(format!("{} recent errors in splunkd.log", count));
            }
        }

        if !problems.is_empty() {
            return Err(ModuleError::PreconditionFailed(problems.join("; ")));
        }
        Ok(ModuleOutput::ok("All health checks passed"))
    }
}

/// Report `splunk status`
pub struct SplunkStatusCheckModule {
    settings: SplunkSettings,
}

impl SplunkStatusCheckModule {
    pub fn new(settings: SplunkSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Module for SplunkStatusCheckModule {
    fn name(&self) -> &'static str {
        "splunk_status_check"
    }

    fn description(&self) -> &'static str {
        "Report whether splunkd is running"
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &mut ModuleContext<'_>,
    ) -> ModuleResult<ModuleOutput> {
        let home = splunk_home(params, context, &self.settings)?;
        let result = context
            .run(&format!("{} status", splunk_bin(&home)))
            .await?;
        let running = result.stdout.contains(RUNNING_MARKER);
        context.set_fact("splunk_running", running);
        if params.get_bool_or("require_running", false) && !running {
            return Err(ModuleError::PreconditionFailed("splunkd is not running".into()));
        }
        Ok(ModuleOutput::ok(if running {
            "splunkd is running"
        } else {
            "splunkd is not running"
        })
        .with_command_output(&result))
    }
}

/// Compare `splunk version` against an expected version
pub struct SplunkVersionCheckModule {
    settings: SplunkSettings,
}

impl SplunkVersionCheckModule {
    pub fn new(settings: SplunkSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Module for SplunkVersionCheckModule {
    fn name(&self) -> &'static str {
        "splunk_version_check"
    }

    fn description(&self) -> &'static str {
        "Check the installed Splunk version"
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &mut ModuleContext<'_>,
    ) -> ModuleResult<ModuleOutput> {
        let home = splunk_home(params, context, &self.settings)?;
        let expected = params.get_string("expected_version")?;
        let result = context
            .run_checked(&format!("{} version", splunk_bin(&home)))
            .await?;
        let current = extract_version(&result.stdout).ok_or_else(|| {
            ModuleError::ExecutionFailed(format!(
                "cannot parse version from '{}'",
                result.stdout.trim()
            ))
        })?;
        context.set_fact(facts::SPLUNK_VERSION, current.clone());

        if let Some(expected) = expected {
            if current != expected && !current.starts_with(&format!("{}.", expected)) {
                if context.dry_run {
                    return Ok(ModuleOutput::changed(format!(
                        "Version is {}, expected {} after upgrade",
                        current, expected
                    )));
                }
                return Err(ModuleError::PreconditionFailed(format!(
                    "version mismatch: expected {}, got {}",
                    expected, current
                )));
            }
        }
        Ok(ModuleOutput::ok(format!("Splunk version {}", current)))
    }
}

/// Poll the management port until splunkd answers
pub struct SplunkWaitReadyModule;

#[async_trait]
impl Module for SplunkWaitReadyModule {
    fn name(&self) -> &'static str {
        "splunk_wait_ready"
    }

    fn description(&self) -> &'static str {
        "Wait for the Splunk management port to respond"
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &mut ModuleContext<'_>,
    ) -> ModuleResult<ModuleOutput> {
        let port = params.get_u64("mgmt_port")?.unwrap_or(8089);
        let retries = params.get_u32("retries")?.unwrap_or(10).max(1);
        let interval = params
            .get_duration("interval")?
            .unwrap_or(Duration::from_secs(30));

        if context.dry_run {
            return Ok(ModuleOutput::ok(format!(
                "Would wait for port {} ({} attempts)",
                port, retries
            )));
        }

        let check = format!(
            "curl -k -s -o /dev/null --max-time 10 https://localhost:{}/services/server/info",
            port
        );
        for attempt in 1..=retries {
            if context.run(&check).await?.success {
                return Ok(ModuleOutput::ok(format!(
                    "Splunk ready after {} attempt(s)",
                    attempt
                )));
            }
            if attempt < retries {
                tokio::time::sleep(interval).await;
            }
        }
        Err(ModuleError::PreconditionFailed(format!(
            "splunkd not ready on port {} after {} attempts",
            port, retries
        )))
    }
}
