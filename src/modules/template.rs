//! Template module - render a template and push it to the host
//!
//! The template comes from a local `src` file or inline `content` and is
//! rendered with the same variables as task parameters. The remote file is
//! only rewritten when its SHA-256 differs from the rendered output.

use async_trait::async_trait;

use super::file::{attribute_commands, parse_mode, remote_sha256, sha256_hex, stat};
use super::{Module, ModuleContext, ModuleError, ModuleOutput, ModuleParams, ModuleResult, ParamExt};
use crate::connection::TransferOptions;
use crate::template::TemplateEngine;

/// Module for rendering templates
#[derive(Debug, Default)]
pub struct TemplateModule {
    engine: TemplateEngine,
}

impl TemplateModule {
    async fn source(params: &ModuleParams) -> ModuleResult<String> {
        if let Some(content) = params.get_string("content")? {
            return Ok(content);
        }
        let src = params.get_string_required("src")?;
        tokio::fs::read_to_string(&src).await.map_err(|e| {
            ModuleError::ExecutionFailed(format!("cannot read template {}: {}", src, e))
        })
    }
}

#[async_trait]
impl Module for TemplateModule {
    fn name(&self) -> &'static str {
        "template"
    }

    fn description(&self) -> &'static str {
        "Render a template and copy it to the host"
    }

    fn required_params(&self) -> &[&'static str] {
        &["dest"]
    }

    fn validate_params(&self, params: &ModuleParams) -> ModuleResult<()> {
        match (params.contains_key("src"), params.contains_key("content")) {
            (true, true) => Err(ModuleError::InvalidParameter(
                "'src' and 'content' are mutually exclusive".into(),
            )),
            (false, false) => Err(ModuleError::MissingParameter("src".into())),
            _ => parse_mode(params).map(|_| ()),
        }
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &mut ModuleContext<'_>,
    ) -> ModuleResult<ModuleOutput> {
        let dest = params.get_string_required("dest")?;
        let mode = parse_mode(params)?;
        let owner = params.get_string("owner")?;
        let group = params.get_string("group")?;

        let template = Self::source(params).await?;
        let vars = TemplateEngine::context(context.vars, context.facts, context.host);
        let rendered = self.engine.render_str(&template, &vars)?;

        let wanted = sha256_hex(rendered.as_bytes());
        let content_changed = remote_sha256(context, &dest).await?.as_deref() != Some(wanted.as_str());
        let current = if content_changed {
            None
        } else {
            stat(context, &dest).await?
        };
        let attrs = attribute_commands(&dest, current.as_ref(), mode, owner.as_deref(), group.as_deref());
        // Uploads already carry the mode
        let attrs: Vec<String> = if content_changed {
            attrs.into_iter().filter(|c| !c.starts_with("chmod")).collect()
        } else {
            attrs
        };

        if !content_changed && attrs.is_empty() {
            return Ok(ModuleOutput::ok(format!("{} is up to date", dest))
                .with_data("checksum", serde_json::json!(wanted)));
        }

        if context.dry_run {
            let msg = if content_changed {
                format!("Would render template to {}", dest)
            } else {
                format!("Would update attributes of {}", dest)
            };
            return Ok(ModuleOutput::changed(msg).with_data("checksum", serde_json::json!(wanted)));
        }

        if content_changed {
            let mut options = TransferOptions::new().with_create_dirs();
            if let Some(mode) = mode {
                options = options.with_mode(mode);
            }
            context.upload(rendered.as_bytes(), &dest, options).await?;
        }
        for command in &attrs {
            context.run_checked(command).await?;
        }
        Ok(ModuleOutput::changed(format!("Rendered template to {}", dest))
            .with_data("checksum", serde_json::json!(wanted)))
    }
}
