//! Service module - manage systemd services

use async_trait::async_trait;

use super::{Module, ModuleContext, ModuleError, ModuleOutput, ModuleParams, ModuleResult, ParamExt};
use crate::connection::escape_shell_arg;

/// Desired service state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Started,
    Stopped,
    Restarted,
    Reloaded,
}

impl ServiceState {
    fn from_str(s: &str) -> ModuleResult<Self> {
        match s.to_lowercase().as_str() {
            "started" | "running" => Ok(ServiceState::Started),
            "stopped" => Ok(ServiceState::Stopped),
            "restarted" => Ok(ServiceState::Restarted),
            "reloaded" => Ok(ServiceState::Reloaded),
            _ => Err(ModuleError::InvalidParameter(format!(
                "Invalid state '{}'. Valid states: started, stopped, restarted, reloaded",
                s
            ))),
        }
    }
}

/// Module for service management
pub struct ServiceModule;

impl ServiceModule {
    async fn is_active(context: &ModuleContext<'_>, service: &str) -> ModuleResult<bool> {
        let cmd = format!("systemctl is-active --quiet {}", escape_shell_arg(service));
        Ok(context.run(&cmd).await?.success)
    }

    async fn is_enabled(context: &ModuleContext<'_>, service: &str) -> ModuleResult<bool> {
        let cmd = format!("systemctl is-enabled --quiet {}", escape_shell_arg(service));
        Ok(context.run(&cmd).await?.success)
    }
}

#[async_trait]
impl Module for ServiceModule {
    fn name(&self) -> &'static str {
        "service"
    }

    fn description(&self) -> &'static str {
        "Manage systemd services"
    }

    fn required_params(&self) -> &[&'static str] {
        &["name"]
    }

    fn validate_params(&self, params: &ModuleParams) -> ModuleResult<()> {
        if let Some(state) = params.get_string("state")? {
            ServiceState::from_str(&state)?;
        }
        params.get_bool("enabled")?;
        if !params.contains_key("state") && !params.contains_key("enabled") {
            return Err(ModuleError::InvalidParameter(
                "one of 'state' or 'enabled' is required".into(),
            ));
        }
        Ok(())
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &mut ModuleContext<'_>,
    ) -> ModuleResult<ModuleOutput> {
        let service = params.get_string_required("name")?;
        let state = params
            .get_string("state")?
            .map(|s| ServiceState::from_str(&s))
            .transpose()?;
        let enabled = params.get_bool("enabled")?;
        let unit = escape_shell_arg(&service);

        let mut actions = Vec::new();
        if let Some(want_enabled) = enabled {
            if Self::is_enabled(context, &service).await? != want_enabled {
                let verb = if want_enabled { "enable" } else { "disable" };
                actions.push(format!("systemctl {} {}", verb, unit));
            }
        }
        match state {
            Some(ServiceState::Started) => {
                if !Self::is_active(context, &service).await? {
                    actions.push(format!("systemctl start {}", unit));
                }
            }
            Some(ServiceState::Stopped) => {
                if Self::is_active(context, &service).await? {
                    actions.push(format!("systemctl stop {}", unit));
                }
            }
            Some(ServiceState::Restarted) => actions.push(format!("systemctl restart {}", unit)),
            Some(ServiceState::Reloaded) => actions.push(format!("systemctl reload {}", unit)),
            None => {}
        }

        if actions.is_empty() {
            return Ok(ModuleOutput::ok(format!("Service {} is in the desired state", service)));
        }
        if context.dry_run {
            return Ok(ModuleOutput::changed(format!("Would run: {}", actions.join("; "))));
        }
        for action in &actions {
            context.run_checked(action).await?;
        }
        Ok(ModuleOutput::changed(format!("Service {} updated", service)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validate_params() {
        let module = ServiceModule;
        let mut params = ModuleParams::new();
        params.insert("name".into(), json!("splunk"));
        assert!(module.validate_params(&params).is_err());

        params.insert("state".into(), json!("bouncing"));
        assert!(module.validate_params(&params).is_err());

        params.insert("state".into(), json!("restarted"));
        assert!(module.validate_params(&params).is_ok());
    }
}
