//! Checkpoint module - take a named restore point

use async_trait::async_trait;
use std::sync::Arc;

use super::{Module, ModuleContext, ModuleError, ModuleOutput, ModuleParams, ModuleResult, ParamExt};
use crate::checkpoint::{Checkpointer, LAST_CHECKPOINT};

/// Snapshot paths through a [`Checkpointer`] and remember the result as the
/// host's `last_checkpoint` fact.
pub struct CheckpointModule {
    checkpointer: Arc<dyn Checkpointer>,
}

impl CheckpointModule {
    pub fn new(checkpointer: Arc<dyn Checkpointer>) -> Self {
        Self { checkpointer }
    }
}

#[async_trait]
impl Module for CheckpointModule {
    fn name(&self) -> &'static str {
        "checkpoint"
    }

    fn description(&self) -> &'static str {
        "Record a named restore point for later rollback"
    }

    fn required_params(&self) -> &[&'static str] {
        &["label"]
    }

    fn validate_params(&self, params: &ModuleParams) -> ModuleResult<()> {
        if params.get_string("label")?.is_some_and(|l| l.trim().is_empty()) {
            return Err(ModuleError::InvalidParameter("label cannot be empty".into()));
        }
        Ok(())
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &mut ModuleContext<'_>,
    ) -> ModuleResult<ModuleOutput> {
        let label = params.get_string_required("label")?;
        let paths = match params.get_vec_string("paths")? {
            Some(paths) if !paths.is_empty() => paths,
            _ => self.checkpointer.default_paths().to_vec(),
        };

        if context.dry_run {
            return Ok(ModuleOutput::changed(format!(
                "Would checkpoint {} as '{}'",
                paths.join(", "),
                label
            )));
        }

        let checkpoint = self
            .checkpointer
            .checkpoint(context.session, context.host, &label, &paths)
            .await?;
        let fact = checkpoint.to_fact();
        context.set_fact(LAST_CHECKPOINT, fact.clone());
        Ok(ModuleOutput::changed(format!(
            "Checkpoint '{}' stored at {}",
            label, checkpoint.location
        ))
        .with_data("checkpoint", fact))
    }
}
