//! Configuration backups and restores

use async_trait::async_trait;
use chrono::Utc;

use super::{setting, splunk_home, BACKUP_PATH};
use crate::config::SplunkSettings;
use crate::connection::escape_shell_arg;
use crate::modules::{Module, ModuleContext, ModuleError, ModuleOutput, ModuleParams, ModuleResult, ParamExt};

fn backup_path(params: &ModuleParams, context: &ModuleContext<'_>) -> ModuleResult<String> {
    match params.get_string(BACKUP_PATH)? {
        Some(path) => Ok(path),
        None => context
            .lookup_str(BACKUP_PATH)
            .map(str::to_string)
            .ok_or_else(|| ModuleError::MissingParameter(BACKUP_PATH.into())),
    }
}

/// Members of `$SPLUNK_HOME` to capture or restore, relative to it
fn members(params: &ModuleParams) -> ModuleResult<Vec<String>> {
    let members = params
        .get_vec_string("include")?
        .unwrap_or_else(|| vec!["etc".to_string()]);
    if let Some(bad) = members.iter().find(|m| m.starts_with('/') || m.contains("..")) {
        return Err(ModuleError::InvalidParameter(format!(
            "backup member '{}' must be relative to splunk_home",
            bad
        )));
    }
    Ok(members)
}

fn quoted_members(members: &[String]) -> String {
    members
        .iter()
        .map(|m| escape_shell_arg(m))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Archive `$SPLUNK_HOME/etc` (or the `include` list) into the backup dir.
///
/// Records the archive path as the `backup_path` fact. With an explicit
/// `backup_name`, an existing archive of that name is kept.
pub struct SplunkBackupModule {
    settings: SplunkSettings,
}

impl SplunkBackupModule {
    pub fn new(settings: SplunkSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Module for SplunkBackupModule {
    fn name(&self) -> &'static str {
        "splunk_backup"
    }

    fn description(&self) -> &'static str {
        "Back up Splunk configuration"
    }

    fn validate_params(&self, params: &ModuleParams) -> ModuleResult<()> {
        members(params).map(|_| ())
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &mut ModuleContext<'_>,
    ) -> ModuleResult<ModuleOutput> {
        let home = splunk_home(params, context, &self.settings)?;
        let dir = setting(params, context, "backup_dir", &self.settings.backup_dir)?;
        let members = members(params)?;
        let named = params.get_string("backup_name")?;
        let name = named
            .clone()
            .unwrap_or_else(|| format!("backup_{}", Utc::now().format("%Y%m%d_%H%M%S")));
        let path = format!("{}/{}.tar.gz", dir.trim_end_matches('/'), name);

        if named.is_some()
            && context
                .run(&format!("test -s {}", escape_shell_arg(&path)))
                .await?
                .success
        {
            context.set_fact(BACKUP_PATH, path.clone());
            return Ok(ModuleOutput::ok(format!("Backup {} already exists", path))
                .with_data(BACKUP_PATH, serde_json::json!(path)));
        }

        let cmd = format!(
            "mkdir -p {} && tar -czf {} -C {} {}",
            escape_shell_arg(&dir),
            escape_shell_arg(&path),
            escape_shell_arg(&home),
            quoted_members(&members)
        );
        if context.dry_run {
            context.set_fact(BACKUP_PATH, path.clone());
            return Ok(ModuleOutput::changed(format!("Would back up {} to {}", home, path))
                .with_data(BACKUP_PATH, serde_json::json!(path)));
        }

        let result = context.run_checked(&cmd).await?;
        context.set_fact(BACKUP_PATH, path.clone());
        Ok(ModuleOutput::changed(format!("Backup created: {}", path))
            .with_data(BACKUP_PATH, serde_json::json!(path))
            .with_command_output(&result))
    }
}

/// Check that a backup exists and is a readable archive
pub struct SplunkVerifyBackupModule;

#[async_trait]
impl Module for SplunkVerifyBackupModule {
    fn name(&self) -> &'static str {
        "splunk_verify_backup"
    }

    fn description(&self) -> &'static str {
        "Verify a Splunk backup archive"
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &mut ModuleContext<'_>,
    ) -> ModuleResult<ModuleOutput> {
        let path = backup_path(params, context)?;
        let quoted = escape_shell_arg(&path);
        if !context.run(&format!("test -s {}", quoted)).await?.success {
            if context.dry_run {
                return Ok(ModuleOutput::ok(format!("Backup {} would be verified", path)));
            }
            return Err(ModuleError::PreconditionFailed(format!(
                "backup not found: {}",
                path
            )));
        }
        let listing = context
            .run(&format!("tar -tzf {} > /dev/null", quoted))
            .await?;
        if !listing.success {
            return Err(ModuleError::PreconditionFailed(format!(
                "backup {} is corrupt: {}",
                path,
                listing.stderr.trim()
            )));
        }
        Ok(ModuleOutput::ok(format!("Backup verified: {}", path)))
    }
}

/// Extract a full backup over `$SPLUNK_HOME`
pub struct SplunkRestoreModule {
    settings: SplunkSettings,
}

impl SplunkRestoreModule {
    pub fn new(settings: SplunkSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Module for SplunkRestoreModule {
    fn name(&self) -> &'static str {
        "splunk_restore"
    }

    fn description(&self) -> &'static str {
        "Restore Splunk from a backup archive"
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &mut ModuleContext<'_>,
    ) -> ModuleResult<ModuleOutput> {
        let path = backup_path(params, context)?;
        let home = splunk_home(params, context, &self.settings)?;
        let cmd = format!(
            "tar -xzf {} -C {}",
            escape_shell_arg(&path),
            escape_shell_arg(&home)
        );
        if context.dry_run {
            return Ok(ModuleOutput::changed(format!("Would restore {} into {}", path, home)));
        }
        let result = context.run_checked(&cmd).await?;
        Ok(ModuleOutput::changed(format!("Backup restored from {}", path)).with_command_output(&result))
    }
}

/// Extract selected members (default `etc`) of a backup
pub struct SplunkRestoreConfigModule {
    settings: SplunkSettings,
}

impl SplunkRestoreConfigModule {
    pub fn new(settings: SplunkSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Module for SplunkRestoreConfigModule {
    fn name(&self) -> &'static str {
        "splunk_restore_config"
    }

    fn description(&self) -> &'static str {
        "Restore Splunk configuration directories from a backup"
    }

    fn validate_params(&self, params: &ModuleParams) -> ModuleResult<()> {
        members(params).map(|_| ())
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &mut ModuleContext<'_>,
    ) -> ModuleResult<ModuleOutput> {
        let path = backup_path(params, context)?;
        let home = splunk_home(params, context, &self.settings)?;
        let members = members(params)?;
        let cmd = format!(
            "tar -xzf {} -C {} {}",
            escape_shell_arg(&path),
            escape_shell_arg(&home),
            quoted_members(&members)
        );
        if context.dry_run {
            return Ok(ModuleOutput::changed(format!(
                "Would restore {} from {}",
                members.join(", "),
                path
            )));
        }
        context.run_checked(&cmd).await?;
        Ok(ModuleOutput::changed(format!(
            "Restored {} from {}",
            members.join(", "),
            path
        )))
    }
}

/// Delete backups older than `retention_days`
pub struct SplunkCleanupBackupsModule {
    settings: SplunkSettings,
}

impl SplunkCleanupBackupsModule {
    pub fn new(settings: SplunkSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Module for SplunkCleanupBackupsModule {
    fn name(&self) -> &'static str {
        "splunk_cleanup_backups"
    }

    fn description(&self) -> &'static str {
        "Remove old Splunk backups"
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &mut ModuleContext<'_>,
    ) -> ModuleResult<ModuleOutput> {
        let dir = setting(params, context, "backup_dir", &self.settings.backup_dir)?;
        let retention = params.get_u64("retention_days")?.unwrap_or(7);
        let find = format!(
            "find {} -maxdepth 1 -name '*.tar.gz' -mtime +{}",
            escape_shell_arg(&dir),
            retention
        );

        let listing = context.run(&format!("{} 2>/dev/null", find)).await?;
        let expired: Vec<&str> = listing
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();
        if expired.is_empty() {
            return Ok(ModuleOutput::ok(format!(
                "No backups older than {} days",
                retention
            )));
        }
        if context.dry_run {
            return Ok(ModuleOutput::changed(format!(
                "Would remove {} backup(s)",
                expired.len()
            ))
            .with_data("removed", serde_json::json!(expired)));
        }
        context.run_checked(&format!("{} -delete", find)).await?;
        Ok(ModuleOutput::changed(format!("Removed {} backup(s)", expired.len()))
            .with_data("removed", serde_json::json!(expired)))
    }
}
