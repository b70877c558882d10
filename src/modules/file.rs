//! File module - manage files, directories and their attributes

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::{Module, ModuleContext, ModuleError, ModuleOutput, ModuleParams, ModuleResult, ParamExt};
use crate::connection::{escape_shell_arg, TransferOptions};

/// Desired state of a path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    File,
    Directory,
    Absent,
    Touch,
}

impl FileState {
    fn from_str(s: &str) -> ModuleResult<Self> {
        match s.to_lowercase().as_str() {
            "file" | "present" => Ok(FileState::File),
            "directory" => Ok(FileState::Directory),
            "absent" => Ok(FileState::Absent),
            "touch" => Ok(FileState::Touch),
            _ => Err(ModuleError::InvalidParameter(format!(
                "Invalid state '{}'. Valid states: file, directory, absent, touch",
                s
            ))),
        }
    }
}

/// What `stat` reports about a remote path
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RemoteStat {
    pub is_dir: bool,
    pub mode: String,
    pub owner: String,
    pub group: String,
}

/// Stat a remote path; `None` when it does not exist
pub(crate) async fn stat(context: &ModuleContext<'_>, path: &str) -> ModuleResult<Option<RemoteStat>> {
    let result = context
        .run(&format!(
            "stat -c '%F|%a|%U|%G' {} 2>/dev/null",
            escape_shell_arg(path)
        ))
        .await?;
    if !result.success {
        return Ok(None);
    }
    let line = result.stdout.trim();
    let mut parts = line.split('|');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(kind), Some(mode), Some(owner), Some(group)) => Ok(Some(RemoteStat {
            is_dir: kind == "directory",
            mode: mode.to_string(),
            owner: owner.to_string(),
            group: group.to_string(),
        })),
        _ => Err(ModuleError::ExecutionFailed(format!(
            "unexpected stat output for {}: {}",
            path, line
        ))),
    }
}

/// Hex SHA-256 of local content
pub(crate) fn sha256_hex(content: &[u8]) -> String {
    let digest = Sha256::digest(content);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Hex SHA-256 of a remote file; `None` when it cannot be read
pub(crate) async fn remote_sha256(
    context: &ModuleContext<'_>,
    path: &str,
) -> ModuleResult<Option<String>> {
    let result = context
        .run(&format!("sha256sum {} 2>/dev/null", escape_shell_arg(path)))
        .await?;
    if !result.success {
        return Ok(None);
    }
    Ok(result.stdout.split_whitespace().next().map(str::to_string))
}

/// Parse an octal mode given as "0644", "644" or a number
pub(crate) fn parse_mode(params: &ModuleParams) -> ModuleResult<Option<u32>> {
    let raw = match params.get("mode") {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Number(n)) => n.to_string(),
        Some(serde_json::Value::Null) | None => return Ok(None),
        Some(_) => return Err(ModuleError::InvalidParameter("mode must be octal".into())),
    };
    u32::from_str_radix(raw.trim_start_matches("0o"), 8)
        .map(Some)
        .map_err(|_| ModuleError::InvalidParameter(format!("invalid mode '{}'", raw)))
}

/// Attribute commands needed to reach the desired mode/owner/group
pub(crate) fn attribute_commands(
    path: &str,
    current: Option<&RemoteStat>,
    mode: Option<u32>,
    owner: Option<&str>,
    group: Option<&str>,
) -> Vec<String> {
    let quoted = escape_shell_arg(path);
    let mut commands = Vec::new();
    if let Some(mode) = mode {
        let wanted = format!("{:o}", mode);
        if current.map_or(true, |s| s.mode.trim_start_matches('0') != wanted) {
            commands.push(format!("chmod {:o} {}", mode, quoted));
        }
    }
    if let Some(owner) = owner {
        if current.map_or(true, |s| s.owner != owner) {
            commands.push(format!("chown {} {}", escape_shell_arg(owner), quoted));
        }
    }
    if let Some(group) = group {
        if current.map_or(true, |s| s.group != group) {
            commands.push(format!("chgrp {} {}", escape_shell_arg(group), quoted));
        }
    }
    commands
}

/// Module for managing files and directories
pub struct FileModule;

#[async_trait]
impl Module for FileModule {
    fn name(&self) -> &'static str {
        "file"
    }

    fn description(&self) -> &'static str {
        "Manage files, directories and their attributes"
    }

    fn required_params(&self) -> &[&'static str] {
        &["path"]
    }

    fn validate_params(&self, params: &ModuleParams) -> ModuleResult<()> {
        if let Some(state) = params.get_string("state")? {
            FileState::from_str(&state)?;
        }
        parse_mode(params)?;
        Ok(())
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &mut ModuleContext<'_>,
    ) -> ModuleResult<ModuleOutput> {
        let path = params.get_string_required("path")?;
        let state = match params.get_string("state")? {
            Some(s) => FileState::from_str(&s)?,
            None => FileState::File,
        };
        let mode = parse_mode(params)?;
        let owner = params.get_string("owner")?;
        let group = params.get_string("group")?;
        let quoted = escape_shell_arg(&path);

        let current = stat(context, &path).await?;
        let mut actions: Vec<String> = Vec::new();
        let mut upload: Option<String> = None;

        match state {
            FileState::Absent => {
                if current.is_some() {
                    actions.push(format!("rm -rf {}", quoted));
                }
            }
            FileState::Directory => match &current {
                Some(s) if !s.is_dir => {
                    return Err(ModuleError::PreconditionFailed(format!(
                        "{} exists and is not a directory",
                        path
                    )));
                }
                Some(_) => {}
                None => actions.push(format!("mkdir -p {}", quoted)),
            },
            FileState::Touch => {
                if current.is_none() {
                    actions.push(format!("touch {}", quoted));
                }
            }
            FileState::File => {
                if let Some(content) = params.get_string("content")? {
                    let wanted = sha256_hex(content.as_bytes());
                    let existing = remote_sha256(context, &path).await?;
                    if existing.as_deref() != Some(wanted.as_str()) {
                        upload = Some(content);
                    }
                } else if current.is_none() {
                    return Err(ModuleError::PreconditionFailed(format!(
                        "{} does not exist",
                        path
                    )));
                }
            }
        }

        if state != FileState::Absent {
            let attrs = if upload.is_some() || !actions.is_empty() {
                // Freshly created: the new path's attributes are unknown
                attribute_commands(&path, None, mode, owner.as_deref(), group.as_deref())
            } else {
                attribute_commands(&path, current.as_ref(), mode, owner.as_deref(), group.as_deref())
            };
            actions.extend(attrs);
        }

        if actions.is_empty() && upload.is_none() {
            return Ok(ModuleOutput::ok(format!("{} is in the desired state", path)));
        }

        if context.dry_run {
            let mut planned = actions.clone();
            if upload.is_some() {
                planned.insert(0, format!("write content to {}", path));
            }
            return Ok(ModuleOutput::changed(format!("Would run: {}", planned.join("; "))));
        }

        if let Some(content) = upload {
            let mut options = TransferOptions::new().with_create_dirs();
            if let Some(mode) = mode {
                options = options.with_mode(mode);
            }
            context.upload(content.as_bytes(), &path, options).await?;
        }
        for action in &actions {
            context.run_checked(action).await?;
        }
        Ok(ModuleOutput::changed(format!("{} updated", path)))
    }
}
