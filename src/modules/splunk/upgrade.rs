//! Upgrade path validation

use async_trait::async_trait;
use semver::Version;

use super::{installed_version, splunk_home};
use crate::config::SplunkSettings;
use crate::inventory::facts;
use crate::modules::{Module, ModuleContext, ModuleError, ModuleOutput, ModuleParams, ModuleResult, ParamExt};

/// Parse `9`, `9.1` or `9.1.2` into a semver version
pub(crate) fn parse_lenient(raw: &str) -> Option<Version> {
    let raw = raw.trim().trim_start_matches('v');
    let mut parts: Vec<&str> = raw.split('.').take(3).collect();
    if parts.is_empty() || parts.iter().any(|p| p.parse::<u64>().is_err()) {
        return None;
    }
    while parts.len() < 3 {
        parts.push("0");
    }
    Version::parse(&parts.join(".")).ok()
}

/// Why an upgrade path is rejected, if it is
pub(crate) fn check_path(current: &Version, target: &Version) -> Option<String> {
    if target < current {
        return Some(format!("downgrade from {} to {} is not supported", current, target));
    }
    if target.major > current.major + 1 {
        return Some(format!(
            "upgrade from {} to {} skips a major version",
            current, target
        ));
    }
    None
}

/// Reject downgrades and upgrades that jump more than one major version
pub struct SplunkValidateUpgradeModule {
    settings: SplunkSettings,
}

impl SplunkValidateUpgradeModule {
    pub fn new(settings: SplunkSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Module for SplunkValidateUpgradeModule {
    fn name(&self) -> &'static str {
        "splunk_validate_upgrade"
    }

    fn description(&self) -> &'static str {
        "Validate a Splunk upgrade path"
    }

    fn required_params(&self) -> &[&'static str] {
        &["target_version"]
    }

    fn validate_params(&self, params: &ModuleParams) -> ModuleResult<()> {
        // Templated targets are checked at execution time
        if let Some(target) = params.get_string("target_version")? {
            if !target.contains("{{") && parse_lenient(&target).is_none() {
                return Err(ModuleError::InvalidParameter(format!(
                    "invalid target_version '{}'",
                    target
                )));
            }
        }
        Ok(())
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &mut ModuleContext<'_>,
    ) -> ModuleResult<ModuleOutput> {
        let raw_target = params.get_string_required("target_version")?;
        let target = parse_lenient(&raw_target).ok_or_else(|| {
            ModuleError::InvalidParameter(format!("invalid target_version '{}'", raw_target))
        })?;

        let raw_current = match params.get_string("current_version")? {
            Some(v) => Some(v),
            None => match context.lookup_str(facts::SPLUNK_VERSION) {
                Some(v) => Some(v.to_string()),
                None => {
                    let home = splunk_home(params, context, &self.settings)?;
                    installed_version(context, &home).await?
                }
            },
        };
        let raw_current = raw_current.ok_or_else(|| {
            ModuleError::PreconditionFailed("cannot determine the installed Splunk version".into())
        })?;
        let current = parse_lenient(&raw_current).ok_or_else(|| {
            ModuleError::PreconditionFailed(format!("invalid installed version '{}'", raw_current))
        })?;

        if let Some(reason) = check_path(&current, &target) {
            return Err(ModuleError::PreconditionFailed(reason));
        }
        let msg = if current == target {
            format!("Already at {}", target)
        } else {
            format!("Upgrade path {} -> {} is valid", current, target)
        };
        Ok(ModuleOutput::ok(msg)
            .with_data("current_version", serde_json::json!(current.to_string()))
            .with_data("target_version", serde_json::json!(target.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lenient() {
        assert_eq!(parse_lenient("9.1"), Some(Version::new(9, 1, 0)));
        assert_eq!(parse_lenient("v8.2.12"), Some(Version::new(8, 2, 12)));
        assert_eq!(parse_lenient("9"), Some(Version::new(9, 0, 0)));
        assert_eq!(parse_lenient("latest"), None);
    }

    #[test]
    fn test_check_path() {
        let v = |s| parse_lenient(s).unwrap();
        assert!(check_path(&v("8.2.0"), &v("9.1.2")).is_none());
        assert!(check_path(&v("9.1.2"), &v("9.1.2")).is_none());
        assert!(check_path(&v("9.1.2"), &v("8.2.0")).unwrap().contains("downgrade"));
        assert!(check_path(&v("7.3.0"), &v("9.0.0")).unwrap().contains("major"));
    }
}
