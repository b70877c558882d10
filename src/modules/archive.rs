//! Archive module - create or extract tar archives on the host
//!
//! ```yaml
//! - name: Archive apps
//!   task: archive
//!   args:
//!     path: [/opt/splunk/etc/apps]
//!     dest: /opt/splunk_backups/apps.tar.gz
//!     exclude: ["*.log"]
//!
//! - name: Unpack add-on
//!   task: archive
//!   args:
//!     action: extract
//!     src: /tmp/TA-nix.tgz
//!     dest: /opt/splunk/etc/apps
//!     creates: /opt/splunk/etc/apps/TA-nix
//! ```

use async_trait::async_trait;

use super::{Module, ModuleContext, ModuleError, ModuleOutput, ModuleParams, ModuleResult, ParamExt};
use crate::connection::escape_shell_arg;

/// Supported archive formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    /// Plain tar archive
    Tar,
    /// Gzip-compressed tar archive
    TarGz,
}

impl ArchiveFormat {
    fn from_str(s: &str) -> ModuleResult<Self> {
        match s.to_lowercase().as_str() {
            "tar" => Ok(ArchiveFormat::Tar),
            "gz" | "tgz" | "tar.gz" => Ok(ArchiveFormat::TarGz),
            _ => Err(ModuleError::InvalidParameter(format!(
                "Unsupported archive format '{}'. Valid formats: tar, gz",
                s
            ))),
        }
    }

    fn from_path(path: &str) -> Self {
        if path.ends_with(".tar") {
            ArchiveFormat::Tar
        } else {
            ArchiveFormat::TarGz
        }
    }

    fn flag(&self) -> &'static str {
        match self {
            ArchiveFormat::Tar => "",
            ArchiveFormat::TarGz => "z",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveAction {
    Create,
    Extract,
}

/// Module for tar archives
pub struct ArchiveModule;

impl ArchiveModule {
    fn action(params: &ModuleParams) -> ModuleResult<ArchiveAction> {
        match params.get_string("action")?.as_deref() {
            None | Some("create") => Ok(ArchiveAction::Create),
            Some("extract") => Ok(ArchiveAction::Extract),
            Some(other) => Err(ModuleError::InvalidParameter(format!(
                "Invalid action '{}'. Valid actions: create, extract",
                other
            ))),
        }
    }

    fn create_cmd(
        paths: &[String],
        dest: &str,
        format: ArchiveFormat,
        exclude: &[String],
    ) -> String {
        let mut cmd = format!("tar -c{}f {}", format.flag(), escape_shell_arg(dest));
        for pattern in exclude {
            cmd.push_str(&format!(" --exclude={}", escape_shell_arg(pattern)));
        }
        cmd.push_str(" -C /");
        for path in paths {
            cmd.push(' ');
            cmd.push_str(&escape_shell_arg(path.trim_start_matches('/')));
        }
        cmd
    }

    fn extract_cmd(src: &str, dest: &str, format: ArchiveFormat) -> String {
        format!(
            "mkdir -p {dest} && tar -x{}f {} -C {dest}",
            format.flag(),
            escape_shell_arg(src),
            dest = escape_shell_arg(dest)
        )
    }
}

#[async_trait]
impl Module for ArchiveModule {
    fn name(&self) -> &'static str {
        "archive"
    }

    fn description(&self) -> &'static str {
        "Create or extract tar archives on the host"
    }

    fn required_params(&self) -> &[&'static str] {
        &["dest"]
    }

    fn validate_params(&self, params: &ModuleParams) -> ModuleResult<()> {
        if let Some(format) = params.get_string("format")? {
            ArchiveFormat::from_str(&format)?;
        }
        match Self::action(params)? {
            ArchiveAction::Create if !params.contains_key("path") => {
                Err(ModuleError::MissingParameter("path".into()))
            }
            ArchiveAction::Extract if !params.contains_key("src") => {
                Err(ModuleError::MissingParameter("src".into()))
            }
            _ => Ok(()),
        }
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &mut ModuleContext<'_>,
    ) -> ModuleResult<ModuleOutput> {
        let dest = params.get_string_required("dest")?;
        let action = Self::action(params)?;
        let force = params.get_bool_or("force", false);

        let (command, marker) = match action {
            ArchiveAction::Create => {
                let paths = params
                    .get_vec_string("path")?
                    .filter(|p| !p.is_empty())
                    .ok_or_else(|| ModuleError::MissingParameter("path".into()))?;
                if let Some(relative) = paths.iter().find(|p| !p.starts_with('/')) {
                    return Err(ModuleError::InvalidParameter(format!(
                        "path '{}' must be absolute",
                        relative
                    )));
                }
                let format = match params.get_string("format")? {
                    Some(f) => ArchiveFormat::from_str(&f)?,
                    None => ArchiveFormat::from_path(&dest),
                };
                let exclude = params.get_vec_string("exclude")?.unwrap_or_default();
                (Self::create_cmd(&paths, &dest, format, &exclude), dest.clone())
            }
            ArchiveAction::Extract => {
                let src = params.get_string_required("src")?;
                let format = match params.get_string("format")? {
                    Some(f) => ArchiveFormat::from_str(&f)?,
                    None => ArchiveFormat::from_path(&src),
                };
                let marker = params.get_string("creates")?.unwrap_or_default();
                (Self::extract_cmd(&src, &dest, format), marker)
            }
        };

        if !force && !marker.is_empty() {
            let check = format!("test -e {}", escape_shell_arg(&marker));
            if context.run(&check).await?.success {
                return Ok(ModuleOutput::ok(format!("{} already exists", marker)));
            }
        }

        if context.dry_run {
            return Ok(ModuleOutput::changed(format!("Would run: {}", command)));
        }

        let result = context.run_checked(&command).await?;
        let msg = match action {
            ArchiveAction::Create => format!("Created archive {}", dest),
            ArchiveAction::Extract => format!("Extracted into {}", dest),
        };
        Ok(ModuleOutput::changed(msg)
            .with_data("dest", serde_json::json!(dest))
            .with_command_output(&result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_create_cmd() {
        let cmd = ArchiveModule::create_cmd(
            &["/opt/splunk/etc".to_string()],
            "/backups/etc.tar.gz",
            ArchiveFormat::TarGz,
            &["*.log".to_string()],
        );
        assert_eq!(
            cmd,
            "tar -czf '/backups/etc.tar.gz' --exclude='*.log' -C / 'opt/splunk/etc'"
        );
    }

    #[test]
    fn test_format_from_path() {
        assert_eq!(ArchiveFormat::from_path("/x.tar"), ArchiveFormat::Tar);
        assert_eq!(ArchiveFormat::from_path("/x.tgz"), ArchiveFormat::TarGz);
        assert!(ArchiveFormat::from_str("zip").is_err());
    }

    #[test]
    fn test_validate_params() {
        let module = ArchiveModule;
        let mut params = ModuleParams::new();
        params.insert("dest".into(), json!("/tmp/x"));
        params.insert("action".into(), json!("extract"));
        assert!(module.validate_params(&params).is_err());
        params.insert("src".into(), json!("/tmp/x.tgz"));
        assert!(module.validate_params(&params).is_ok());
    }
}
