//! Package download, verification and installation

use async_trait::async_trait;

use super::{extract_version, installed_version, is_forwarder, setting, splunk_home, PACKAGE_PATH};
use crate::config::SplunkSettings;
use crate::connection::escape_shell_arg;
use crate::inventory::facts;
use crate::modules::{Module, ModuleContext, ModuleError, ModuleOutput, ModuleParams, ModuleResult, ParamExt};

/// Package format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PackageFormat {
    Rpm,
    Deb,
}

impl PackageFormat {
    fn for_host(params: &ModuleParams, context: &ModuleContext<'_>) -> ModuleResult<Self> {
        if let Some(format) = params.get_string("package_format")? {
            return match format.as_str() {
                "rpm" => Ok(PackageFormat::Rpm),
                "deb" => Ok(PackageFormat::Deb),
                other => Err(ModuleError::InvalidParameter(format!(
                    "unsupported package format '{}'",
                    other
                ))),
            };
        }
        let family = context
            .lookup_str(facts::OS_FAMILY)
            .unwrap_or("RedHat")
            .to_lowercase();
        Ok(if family == "debian" || family == "ubuntu" {
            PackageFormat::Deb
        } else {
            PackageFormat::Rpm
        })
    }

    fn from_path(path: &str) -> ModuleResult<Self> {
        if path.ends_with(".rpm") {
            Ok(PackageFormat::Rpm)
        } else if path.ends_with(".deb") {
            Ok(PackageFormat::Deb)
        } else {
            Err(ModuleError::InvalidParameter(format!(
                "unsupported package format: {}",
                path
            )))
        }
    }
}

/// Splunk package file name
pub(crate) fn package_name(
    forwarder: bool,
    version: &str,
    build: Option<&str>,
    arch: &str,
    deb: bool,
) -> String {
    let product = if forwarder { "splunkforwarder" } else { "splunk" };
    let arch = match (deb, arch) {
        (true, "x86_64") => "amd64",
        (true, "aarch64") => "arm64",
        (_, other) => other,
    };
    let build = build.map(|b| format!("-{}", b)).unwrap_or_default();
    let ext = if deb { "deb" } else { "rpm" };
    format!("{}-{}{}-linux-2.6-{}.{}", product, version, build, arch, ext)
}

/// Download a Splunk package into the host's package cache.
///
/// Records the package path as the `package_path` fact. A package already
/// present in the cache is reused.
pub struct SplunkDownloadModule {
    settings: SplunkSettings,
}

impl SplunkDownloadModule {
    pub fn new(settings: SplunkSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Module for SplunkDownloadModule {
    fn name(&self) -> &'static str {
        "splunk_download"
    }

    fn description(&self) -> &'static str {
        "Download a Splunk package onto the host"
    }

    fn required_params(&self) -> &[&'static str] {
        &["version"]
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &mut ModuleContext<'_>,
    ) -> ModuleResult<ModuleOutput> {
        let version = params.get_string_required("version")?;
        let build = params.get_string("build")?;
        let arch = setting(params, context, facts::CPU_ARCH, "x86_64")?;
        let format = PackageFormat::for_host(params, context)?;
        let cache_dir = setting(params, context, "cache_dir", &self.settings.package_cache_dir)?;
        let base_url = setting(params, context, "download_url", &self.settings.download_url)?;

        let name = package_name(
            is_forwarder(params, context)?,
            &version,
            build.as_deref(),
            &arch,
            format == PackageFormat::Deb,
        );
        let path = format!("{}/{}", cache_dir.trim_end_matches('/'), name);
        let url = match params.get_string("url")? {
            Some(url) => url,
            None => format!("{}/{}", base_url.trim_end_matches('/'), name),
        };

        let present = context
            .run(&format!("test -s {}", escape_shell_arg(&path)))
            .await?
            .success;
        if present {
            context.set_fact(PACKAGE_PATH, path.clone());
            return Ok(ModuleOutput::ok(format!("Package already cached: {}", path))
                .with_data(PACKAGE_PATH, serde_json::json!(path)));
        }

        if context.dry_run {
            context.set_fact(PACKAGE_PATH, path.clone());
            return Ok(ModuleOutput::changed(format!("Would download {} to {}", url, path))
                .with_data(PACKAGE_PATH, serde_json::json!(path)));
        }

        let quoted = escape_shell_arg(&path);
        let cmd = format!(
            "mkdir -p {} && (curl -fsSL -o {path} {url} || wget -q -O {path} {url}) || (rm -f {path}; exit 1)",
            escape_shell_arg(&cache_dir),
            path = quoted,
            url = escape_shell_arg(&url)
        );
        let result = context.run_checked(&cmd).await?;
        context.set_fact(PACKAGE_PATH, path.clone());
        Ok(ModuleOutput::changed(format!("Package downloaded: {}", path))
            .with_data(PACKAGE_PATH, serde_json::json!(path))
            .with_command_output(&result))
    }
}

fn package_path(params: &ModuleParams, context: &ModuleContext<'_>) -> ModuleResult<String> {
    match params.get_string(PACKAGE_PATH)? {
        Some(path) => Ok(path),
        None => context
            .lookup_str(PACKAGE_PATH)
            .map(str::to_string)
            .ok_or_else(|| ModuleError::MissingParameter(PACKAGE_PATH.into())),
    }
}

/// Check that a downloaded package exists and, optionally, its checksum
pub struct SplunkVerifyPackageModule;

#[async_trait]
impl Module for SplunkVerifyPackageModule {
    fn name(&self) -> &'static str {
        "splunk_verify_package"
    }

    fn description(&self) -> &'static str {
        "Verify a downloaded Splunk package"
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &mut ModuleContext<'_>,
    ) -> ModuleResult<ModuleOutput> {
        let path = package_path(params, context)?;
        let quoted = escape_shell_arg(&path);

        if !context.run(&format!("test -s {}", quoted)).await?.success {
            if context.dry_run {
                return Ok(ModuleOutput::ok(format!(
                    "Package {} not present yet, would verify after download",
                    path
                )));
            }
            return Err(ModuleError::PreconditionFailed(format!(
                "package not found: {}",
                path
            )));
        }

        if let Some(expected) = params.get_string("sha256")? {
            let result = context.run_checked(&format!("sha256sum {}", quoted)).await?;
            let actual = result.stdout.split_whitespace().next().unwrap_or_default();
            if !actual.eq_ignore_ascii_case(expected.trim()) {
                return Err(ModuleError::PreconditionFailed(format!(
                    "checksum mismatch for {}: expected {}, got {}",
                    path, expected, actual
                )));
            }
        }
        Ok(ModuleOutput::ok(format!("Package verified: {}", path)))
    }
}

/// Install a Splunk package with rpm or dpkg.
///
/// Reports `ok` when `etc/splunk.version` already matches the package version.
pub struct SplunkInstallModule {
    settings: SplunkSettings,
}

impl SplunkInstallModule {
    pub fn new(settings: SplunkSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Module for SplunkInstallModule {
    fn name(&self) -> &'static str {
        "splunk_install"
    }

    fn description(&self) -> &'static str {
        "Install or upgrade a Splunk package"
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &mut ModuleContext<'_>,
    ) -> ModuleResult<ModuleOutput> {
        let path = package_path(params, context)?;
        let format = PackageFormat::from_path(&path)?;
        let home = splunk_home(params, context, &self.settings)?;
        let file_name = path.rsplit('/').next().unwrap_or(path.as_str());
        let target = match params.get_string("version")? {
            Some(v) => Some(v),
            None => extract_version(file_name),
        };

        let current = installed_version(context, &home).await?;
        if let (Some(current), Some(target)) = (&current, &target) {
            if current == target {
                context.set_fact(facts::SPLUNK_VERSION, current.clone());
                return Ok(ModuleOutput::ok(format!("Splunk {} already installed", current)));
            }
        }

        let cmd = match format {
            PackageFormat::Rpm => format!("rpm -Uvh --replacepkgs {}", escape_shell_arg(&path)),
            PackageFormat::Deb => format!("dpkg -i {}", escape_shell_arg(&path)),
        };
        if context.dry_run {
            return Ok(ModuleOutput::changed(format!(
                "Would install {} (installed: {})",
                path,
                current.as_deref().unwrap_or("none")
            )));
        }

        let result = context.run_checked(&cmd).await?;
        if let Some(version) = installed_version(context, &home).await?.or(target) {
            context.set_fact(facts::SPLUNK_VERSION, version);
        }
        Ok(ModuleOutput::changed(format!("Installed {}", path)).with_command_output(&result))
    }
}

/// Hand `$SPLUNK_HOME` to the Splunk service account
pub struct SplunkSetPermissionsModule {
    settings: SplunkSettings,
}

impl SplunkSetPermissionsModule {
    pub fn new(settings: SplunkSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Module for SplunkSetPermissionsModule {
    fn name(&self) -> &'static str {
        "splunk_set_permissions"
    }

    fn description(&self) -> &'static str {
        "Set Splunk ownership on SPLUNK_HOME"
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &mut ModuleContext<'_>,
    ) -> ModuleResult<ModuleOutput> {
        let home = splunk_home(params, context, &self.settings)?;
        let user = setting(params, context, "splunk_user", &self.settings.splunk_user)?;
        let group = setting(params, context, "splunk_group", &self.settings.splunk_group)?;
        let recursive = params.get_bool_or("recursive", true);
        let quoted_home = escape_shell_arg(&home);

        let depth = if recursive { "" } else { "-maxdepth 0 " };
        let drift_check = format!(
            "find {} {}\\( ! -user {user} -o ! -group {group} \\) -print -quit",
            quoted_home,
            depth,
            user = escape_shell_arg(&user),
            group = escape_shell_arg(&group)
        );
        let drift = context.run_checked(&drift_check).await?;
        if drift.stdout.trim().is_empty() {
            return Ok(ModuleOutput::ok(format!("{} already owned by {}:{}", home, user, group)));
        }

        let cmd = format!(
            "chown {}{} {}",
            if recursive { "-R " } else { "" },
            escape_shell_arg(&format!("{}:{}", user, group)),
            quoted_home
        );
        if context.dry_run {
            return Ok(ModuleOutput::changed(format!("Would run: {}", cmd)));
        }
        context.run_checked(&cmd).await?;
        Ok(ModuleOutput::changed(format!("{} now owned by {}:{}", home, user, group)))
    }
}
