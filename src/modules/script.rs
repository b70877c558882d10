//! Script module - upload a local script and run it on the host

use async_trait::async_trait;
use uuid::Uuid;

use super::{Module, ModuleContext, ModuleError, ModuleOutput, ModuleParams, ModuleResult, ParamExt};
use crate::connection::{escape_shell_arg, ExecuteOptions, TransferOptions};

/// Module for running scripts
pub struct ScriptModule;

#[async_trait]
impl Module for ScriptModule {
    fn name(&self) -> &'static str {
        "script"
    }

    fn description(&self) -> &'static str {
        "Transfer a local script to the host and execute it"
    }

    fn validate_params(&self, params: &ModuleParams) -> ModuleResult<()> {
        if !params.contains_key("src") && !params.contains_key("content") {
            return Err(ModuleError::MissingParameter("src".into()));
        }
        Ok(())
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &mut ModuleContext<'_>,
    ) -> ModuleResult<ModuleOutput> {
        let args = params.get_vec_string("args")?.unwrap_or_default();
        let interpreter = params
            .get_string("interpreter")?
            .unwrap_or_else(|| "/bin/sh".to_string());

        if let Some(creates) = params.get_string("creates")? {
            let check = format!("test -e {}", escape_shell_arg(&creates));
            if context.run(&check).await?.success {
                return Ok(ModuleOutput::ok(format!("Skipped, '{}' exists", creates)));
            }
        }

        let (script, label) = match params.get_string("content")? {
            Some(content) => (content, "inline script".to_string()),
            None => {
                let src = params.get_string_required("src")?;
                let body = tokio::fs::read_to_string(&src).await.map_err(|e| {
                    ModuleError::ExecutionFailed(format!("cannot read script {}: {}", src, e))
                })?;
                (body, src)
            }
        };

        if context.dry_run {
            return Ok(ModuleOutput::changed(format!("Would run {}", label)));
        }

        let remote = format!("/tmp/siemply-script-{}.sh", Uuid::new_v4().simple());
        context
            .upload(script.as_bytes(), &remote, TransferOptions::new().with_mode(0o700))
            .await?;

        let mut command = format!("{} {}", interpreter, escape_shell_arg(&remote));
        for arg in &args {
            command.push(' ');
            command.push_str(&escape_shell_arg(arg));
        }
        let mut options = ExecuteOptions::new().with_timeout(context.timeout);
        if let Some(chdir) = params.get_string("chdir")? {
            options = options.with_cwd(chdir);
        }
        let result = context.session.execute(&command, Some(options)).await;
        // Remove the script whatever happened
        let _ = context
            .run(&format!("rm -f {}", escape_shell_arg(&remote)))
            .await;
        let result = result?;

        if !result.success {
            return Err(ModuleError::CommandFailed {
                code: result.exit_code,
                message: result.stderr.trim().to_string(),
            });
        }
        Ok(ModuleOutput::changed(format!("Ran {}", label)).with_command_output(&result))
    }
}
