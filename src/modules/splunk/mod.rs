//! Splunk task family
//!
//! Executors for upgrading and operating Splunk Enterprise and Universal
//! Forwarder installations. Locations default to [`SplunkSettings`] and can be
//! overridden per host through facts or vars (`splunk_home`, `splunk_user`,
//! ...) and per task through parameters of the same name.

mod backup;
mod health;
mod install;
mod precheck;
mod upgrade;

pub use backup::{
    SplunkBackupModule, SplunkCleanupBackupsModule, SplunkRestoreConfigModule,
    SplunkRestoreModule, SplunkVerifyBackupModule,
};
pub use health::{
    SplunkHealthCheckModule, SplunkStatusCheckModule, SplunkVersionCheckModule,
    SplunkWaitReadyModule,
};
pub use install::{
    SplunkDownloadModule, SplunkInstallModule, SplunkSetPermissionsModule,
    SplunkVerifyPackageModule,
};
pub use precheck::SplunkPrecheckModule;
pub use upgrade::SplunkValidateUpgradeModule;

use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;

use super::{ModuleContext, ModuleParams, ModuleRegistry, ModuleResult, ParamExt};
use crate::config::SplunkSettings;
use crate::connection::escape_shell_arg;
use crate::inventory::facts;

/// Fact holding the path of the last downloaded package
pub const PACKAGE_PATH: &str = "package_path";
/// Fact holding the path of the last backup
pub const BACKUP_PATH: &str = "backup_path";

static VERSION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+\.\d+(?:\.\d+)?)").expect("static regex"));

/// First dotted version number in `text`
pub(crate) fn extract_version(text: &str) -> Option<String> {
    VERSION_RE
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Register every Splunk executor
pub fn register_all(registry: &mut ModuleRegistry, settings: &SplunkSettings) {
    let settings = settings.clone();
    registry.register(Arc::new(SplunkPrecheckModule::new(settings.clone())));
    registry.register(Arc::new(SplunkDownloadModule::new(settings.clone())));
    registry.register(Arc::new(SplunkVerifyPackageModule));
    registry.register(Arc::new(SplunkInstallModule::new(settings.clone())));
    registry.register(Arc::new(SplunkSetPermissionsModule::new(settings.clone())));
    registry.register(Arc::new(SplunkBackupModule::new(settings.clone())));
    registry.register(Arc::new(SplunkVerifyBackupModule));
    registry.register(Arc::new(SplunkRestoreModule::new(settings.clone())));
    registry.register(Arc::new(SplunkRestoreConfigModule::new(settings.clone())));
    registry.register(Arc::new(SplunkCleanupBackupsModule::new(settings.clone())));
    registry.register(Arc::new(SplunkHealthCheckModule::new(settings.clone())));
    registry.register(Arc::new(SplunkStatusCheckModule::new(settings.clone())));
    registry.register(Arc::new(SplunkVersionCheckModule::new(settings.clone())));
    registry.register(Arc::new(SplunkWaitReadyModule));
    registry.register(Arc::new(SplunkValidateUpgradeModule::new(settings)));
}

/// Resolve a setting: task parameter, then host fact or var, then default
pub(crate) fn setting(
    params: &ModuleParams,
    context: &ModuleContext<'_>,
    key: &str,
    default: &str,
) -> ModuleResult<String> {
    if let Some(value) = params.get_string(key)? {
        return Ok(value);
    }
    Ok(context
        .lookup_str(key)
        .map(str::to_string)
        .unwrap_or_else(|| default.to_string()))
}

/// `$SPLUNK_HOME` for this task
pub(crate) fn splunk_home(
    params: &ModuleParams,
    context: &ModuleContext<'_>,
    settings: &SplunkSettings,
) -> ModuleResult<String> {
    setting(params, context, "splunk_home", &settings.splunk_home)
}

/// Path of the `splunk` binary under a home
pub(crate) fn splunk_bin(home: &str) -> String {
    escape_shell_arg(&format!("{}/bin/splunk", home.trim_end_matches('/')))
}

/// Whether the host is a Universal Forwarder
pub(crate) fn is_forwarder(params: &ModuleParams, context: &ModuleContext<'_>) -> ModuleResult<bool> {
    let kind = match params.get_string("package_type")? {
        Some(kind) => kind,
        None => context
            .lookup_str(facts::SPLUNK_TYPE)
            .unwrap_or("forwarder")
            .to_string(),
    };
    Ok(matches!(
        kind.to_lowercase().as_str(),
        "uf" | "forwarder" | "universal_forwarder" | "splunkforwarder"
    ))
}

/// Installed version read from `etc/splunk.version`
pub(crate) async fn installed_version(
    context: &ModuleContext<'_>,
    home: &str,
) -> ModuleResult<Option<String>> {
    let path = format!("{}/etc/splunk.version", home.trim_end_matches('/'));
    let result = context
        .run(&format!("cat {} 2>/dev/null", escape_shell_arg(&path)))
        .await?;
    if !result.success {
        return Ok(None);
    }
    Ok(result
        .stdout
        .lines()
        .find_map(|line| line.trim().strip_prefix("VERSION="))
        .and_then(extract_version))
}

/// Whether something listens on `port`
pub(crate) async fn port_listening(context: &ModuleContext<'_>, port: u64) -> ModuleResult<bool> {
    let cmd = format!(
        "(ss -ltn 2>/dev/null || netstat -tln 2>/dev/null) | grep -q ':{} '",
        port
    );
    Ok(context.run(&cmd).await?.success)
}
