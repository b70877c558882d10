//! Command module - run a shell command on the host
//!
//! A plain command reports `ok`: nothing is known about what it touched.
//! With `creates` or `removes` the command is guarded by a state check, so
//! running it reports `changed`. `changed_when` overrides either default.

use async_trait::async_trait;

use super::{Module, ModuleContext, ModuleError, ModuleOutput, ModuleParams, ModuleResult, ParamExt};
use crate::connection::{escape_shell_arg, ExecuteOptions};

/// Module for executing commands
pub struct CommandModule;

impl CommandModule {
    fn build_options(params: &ModuleParams, context: &ModuleContext<'_>) -> ModuleResult<ExecuteOptions> {
        let mut options = ExecuteOptions::new().with_timeout(context.timeout);
        if let Some(chdir) = params.get_string("chdir")? {
            options = options.with_cwd(chdir);
        }
        match params.get("env") {
            Some(serde_json::Value::Object(env)) => {
                for (key, value) in env {
                    let value = match value {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    options = options.with_env(key.clone(), value);
                }
            }
            Some(serde_json::Value::Null) | None => {}
            Some(_) => {
                return Err(ModuleError::InvalidParameter("env must be a mapping".into()));
            }
        }
        Ok(options)
    }

    /// Short-circuit on `creates`/`removes`
    async fn check_creates_removes(
        params: &ModuleParams,
        context: &ModuleContext<'_>,
    ) -> ModuleResult<Option<ModuleOutput>> {
        if let Some(creates) = params.get_string("creates")? {
            let exists = context
                .run(&format!("test -e {}", escape_shell_arg(&creates)))
                .await?
                .success;
            if exists {
                return Ok(Some(ModuleOutput::ok(format!("Skipped, '{}' exists", creates))));
            }
        }
        if let Some(removes) = params.get_string("removes")? {
            let exists = context
                .run(&format!("test -e {}", escape_shell_arg(&removes)))
                .await?
                .success;
            if !exists {
                return Ok(Some(ModuleOutput::ok(format!(
                    "Skipped, '{}' does not exist",
                    removes
                ))));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl Module for CommandModule {
    fn name(&self) -> &'static str {
        "command"
    }

    fn description(&self) -> &'static str {
        "Execute a shell command"
    }

    fn required_params(&self) -> &[&'static str] {
        &["cmd"]
    }

    fn validate_params(&self, params: &ModuleParams) -> ModuleResult<()> {
        if params.get_string("cmd")?.is_some_and(|c| c.trim().is_empty()) {
            return Err(ModuleError::InvalidParameter("cmd cannot be empty".into()));
        }
        params.get_bool("changed_when")?;
        Ok(())
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &mut ModuleContext<'_>,
    ) -> ModuleResult<ModuleOutput> {
        let cmd = params.get_string_required("cmd")?;
        let guarded = params.contains_key("creates") || params.contains_key("removes");
        let reports_change = params.get_bool("changed_when")?.unwrap_or(guarded);

        if let Some(output) = Self::check_creates_removes(params, context).await? {
            return Ok(output);
        }

        if context.dry_run {
            return Ok(ModuleOutput::changed_if(
                reports_change,
                format!("Would execute: {}", cmd),
            ));
        }

        let options = Self::build_options(params, context)?;
        let result = context.session.execute(&cmd, Some(options)).await?;
        if !result.success {
            let message = if result.stderr.trim().is_empty() {
                result.stdout.trim().to_string()
            } else {
                result.stderr.trim().to_string()
            };
            return Err(ModuleError::CommandFailed {
                code: result.exit_code,
                message,
            });
        }

        Ok(ModuleOutput::changed_if(reports_change, "Command executed").with_command_output(&result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validate_params() {
        let module = CommandModule;
        let mut params = ModuleParams::new();
        params.insert("cmd".into(), json!("   "));
        assert!(module.validate_params(&params).is_err());

        params.insert("cmd".into(), json!("echo ok"));
        params.insert("changed_when".into(), json!("maybe"));
        assert!(module.validate_params(&params).is_err());

        params.insert("changed_when".into(), json!(false));
        assert!(module.validate_params(&params).is_ok());
    }
}
