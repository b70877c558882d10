//! SSH sessions over russh
//!
//! [`SshConnector`] opens one authenticated russh client per host. Every
//! command runs on its own channel; files are written through an SFTP
//! subsystem channel.

use async_trait::async_trait;
use russh::client::{Handle, Handler};
use russh::keys::key::PublicKey;
use russh::keys::load_secret_key;
use russh::ChannelMsg;
use russh_keys::agent::client::AgentClient;
use russh_sftp::client::SftpSession;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, instrument, trace, warn};

use super::{
    escape_shell_arg, CommandResult, ConnectionError, ConnectionResult, Connector, ExecuteOptions,
    RusshError, Session, TransferOptions,
};
use crate::config::SshConfig;
use crate::inventory::{AuthMaterial, Host};

#[derive(Debug, Clone, Copy, PartialEq)]
enum HostKeyStatus {
    Verified,
    Unknown,
    Mismatch,
}

/// A parsed known_hosts line
#[derive(Debug, Clone)]
struct KnownHostEntry {
    patterns: Vec<String>,
    key: PublicKey,
}

/// Client handler doing known_hosts verification
struct ClientHandler {
    host: String,
    port: u16,
    known_hosts: Vec<KnownHostEntry>,
    accept_unknown: bool,
}

impl ClientHandler {
    fn new(host: &str, port: u16, accept_unknown: bool) -> Self {
        Self {
            host: host.to_string(),
            port,
            known_hosts: load_known_hosts(),
            accept_unknown,
        }
    }

    fn verify(&self, server_key: &PublicKey) -> HostKeyStatus {
        let entry = self.known_hosts.iter().find(|entry| {
            entry
                .patterns
                .iter()
                .any(|pattern| pattern_matches(pattern, &self.host, self.port))
        });
        match entry {
            Some(entry) if entry.key.fingerprint() == server_key.fingerprint() => {
                HostKeyStatus::Verified
            }
            Some(_) => HostKeyStatus::Mismatch,
            None => HostKeyStatus::Unknown,
        }
    }
}

#[async_trait]
impl Handler for ClientHandler {
    type Error = RusshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        match self.verify(server_public_key) {
            HostKeyStatus::Verified => {
                debug!(host = %self.host, "host key verified against known_hosts");
                Ok(true)
            }
            HostKeyStatus::Unknown if self.accept_unknown => {
                warn!(host = %self.host, "host not in known_hosts, accepting");
                Ok(true)
            }
            HostKeyStatus::Unknown => {
                warn!(host = %self.host, "host not in known_hosts, rejecting");
                Ok(false)
            }
            HostKeyStatus::Mismatch => {
                warn!(host = %self.host, "HOST KEY MISMATCH against known_hosts, rejecting");
                Ok(false)
            }
        }
    }
}

fn load_known_hosts() -> Vec<KnownHostEntry> {
    let Some(path) = dirs::home_dir().map(|h| h.join(".ssh").join("known_hosts")) else {
        return Vec::new();
    };
    match std::fs::read_to_string(&path) {
        Ok(content) => {
            let entries: Vec<_> = content.lines().filter_map(parse_known_hosts_line).collect();
            debug!(entries = entries.len(), "loaded known_hosts");
            entries
        }
        Err(e) => {
            trace!(path = %path.display(), error = %e, "known_hosts not readable");
            Vec::new()
        }
    }
}

/// `host[,host...] keytype base64key [comment]`
fn parse_known_hosts_line(line: &str) -> Option<KnownHostEntry> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let mut parts = line.split_whitespace();
    let patterns = parts.next()?.split(',').map(str::to_string).collect();
    let _key_type = parts.next()?;
    let encoded = parts.next()?;
    let bytes =
        base64::Engine::decode(&base64::engine::general_purpose::STANDARD, encoded).ok()?;
    let key = russh::keys::key::parse_public_key(&bytes, None).ok()?;
    Some(KnownHostEntry { patterns, key })
}

/// Match a known_hosts pattern (`host`, `[host]:port`, `*`/`?` wildcards)
fn pattern_matches(pattern: &str, host: &str, port: u16) -> bool {
    if let Some(rest) = pattern.strip_prefix('[') {
        if let Some((pattern_host, tail)) = rest.split_once(']') {
            let pattern_port = tail
                .strip_prefix(':')
                .and_then(|p| p.parse::<u16>().ok())
                .unwrap_or(22);
            return pattern_host == host && pattern_port == port;
        }
    }
    if port != 22 {
        return false;
    }
    if pattern.contains('*') || pattern.contains('?') {
        return wildcard_match(pattern.as_bytes(), host.as_bytes());
    }
    pattern == host
}

fn wildcard_match(pattern: &[u8], text: &[u8]) -> bool {
    match pattern.split_first() {
        None => text.is_empty(),
        Some((b'*', rest)) => (0..=text.len()).any(|i| wildcard_match(rest, &text[i..])),
        Some((b'?', rest)) => !text.is_empty() && wildcard_match(rest, &text[1..]),
        Some((c, rest)) => text.first() == Some(c) && wildcard_match(rest, &text[1..]),
    }
}

fn default_identity_files() -> Vec<PathBuf> {
    let Some(ssh_dir) = dirs::home_dir().map(|h| h.join(".ssh")) else {
        return Vec::new();
    };
    ["id_ed25519", "id_ecdsa", "id_rsa"]
        .iter()
        .map(|name| ssh_dir.join(name))
        .filter(|path| path.exists())
        .collect()
}

/// Opens russh sessions
#[derive(Debug, Clone, Default)]
pub struct SshConnector {
    config: SshConfig,
}

impl SshConnector {
    /// Create a connector from the SSH section of the configuration
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    fn client_config(&self) -> Arc<russh::client::Config> {
        let mut config = russh::client::Config::default();
        config.inactivity_timeout = self.config.inactivity_timeout;
        Arc::new(config)
    }

    async fn handshake(
        &self,
        host: &Host,
        auth: &AuthMaterial,
    ) -> ConnectionResult<Handle<ClientHandler>> {
        // Hosts left on the inventory default use the configured port
        let port = if host.port == 22 { self.config.port } else { host.port };
        let addr = format!("{}:{}", host.address, port);
        let socket = tokio::net::TcpStream::connect(&addr).await.map_err(|e| {
            ConnectionError::ConnectionFailed(format!("failed to connect to {}: {}", addr, e))
        })?;
        socket.set_nodelay(true)?;

        let handler = ClientHandler::new(&host.address, port, self.config.accept_unknown_hosts);
        let mut handle = russh::client::connect_stream(self.client_config(), socket, handler)
            .await
            .map_err(|e| ConnectionError::ConnectionFailed(format!("SSH handshake failed: {}", e)))?;

        authenticate(&mut handle, auth).await?;
        Ok(handle)
    }
}

#[async_trait]
impl Connector for SshConnector {
    #[instrument(skip(self, auth), fields(host = %host.name, address = %host.address, user = %auth.user))]
    async fn open(
        &self,
        host: &Host,
        auth: &AuthMaterial,
        connect_timeout: Duration,
    ) -> ConnectionResult<Box<dyn Session>> {
        if auth.user.is_empty() {
            return Err(ConnectionError::InvalidConfig(format!(
                "no remote user for host {}",
                host.name
            )));
        }

        let handle = tokio::time::timeout(connect_timeout, self.handshake(host, auth))
            .await
            .map_err(|_| ConnectionError::Timeout(connect_timeout))??;
        debug!("SSH session established");

        Ok(Box::new(SshSession {
            identifier: host.name.clone(),
            handle: Arc::new(RwLock::new(Some(handle))),
            connected: AtomicBool::new(true),
            created_at: Instant::now(),
            commands_executed: AtomicU64::new(0),
        }))
    }
}

/// Agent first (if allowed), then the configured key, then default keys, then password
async fn authenticate(handle: &mut Handle<ClientHandler>, auth: &AuthMaterial) -> ConnectionResult<()> {
    let user = auth.user.as_str();

    if auth.use_agent {
        match try_agent_auth(handle, user).await {
            Ok(()) => {
                debug!("authenticated using SSH agent");
                return Ok(());
            }
            Err(e) => trace!(error = %e, "agent authentication unavailable"),
        }
    }

    let keys: Vec<PathBuf> = match &auth.private_key_file {
        Some(key) => vec![key.clone()],
        None => default_identity_files(),
    };
    for key in keys {
        match try_key_auth(handle, user, &key, auth.passphrase.as_deref()).await {
            Ok(()) => {
                debug!(key = %key.display(), "authenticated using key");
                return Ok(());
            }
            Err(e) => trace!(key = %key.display(), error = %e, "key rejected"),
        }
    }

    if let Some(password) = &auth.password {
        let accepted = handle
            .authenticate_password(user, password)
            .await
            .map_err(|e| ConnectionError::AuthenticationFailed(format!("password: {}", e)))?;
        if accepted {
            debug!("authenticated using password");
            return Ok(());
        }
    }

    Err(ConnectionError::AuthenticationFailed(format!(
        "all authentication methods failed for user {}",
        user
    )))
}

async fn try_agent_auth(handle: &mut Handle<ClientHandler>, user: &str) -> ConnectionResult<()> {
    let mut agent = AgentClient::connect_env()
        .await
        .map_err(|e| ConnectionError::AuthenticationFailed(format!("SSH agent: {}", e)))?;
    let identities = agent
        .request_identities()
        .await
        .map_err(|e| ConnectionError::AuthenticationFailed(format!("SSH agent: {}", e)))?;

    for identity in identities {
        let (returned, result) = handle.authenticate_future(user, identity, agent).await;
        agent = returned;
        if let Ok(true) = result {
            return Ok(());
        }
    }
    Err(ConnectionError::AuthenticationFailed(
        "no SSH agent identity accepted".to_string(),
    ))
}

async fn try_key_auth(
    handle: &mut Handle<ClientHandler>,
    user: &str,
    key_path: &Path,
    passphrase: Option<&str>,
) -> ConnectionResult<()> {
    let key_pair = load_secret_key(key_path, passphrase).map_err(|e| {
        ConnectionError::AuthenticationFailed(format!("failed to load {}: {}", key_path.display(), e))
    })?;
    let accepted = handle
        .authenticate_publickey(user, Arc::new(key_pair))
        .await
        .map_err(|e| ConnectionError::AuthenticationFailed(e.to_string()))?;
    if accepted {
        Ok(())
    } else {
        Err(ConnectionError::AuthenticationFailed(format!(
            "key {} rejected",
            key_path.display()
        )))
    }
}

/// One open russh client
pub struct SshSession {
    identifier: String,
    /// Read lock to open channels, write lock only to close
    handle: Arc<RwLock<Option<Handle<ClientHandler>>>>,
    connected: AtomicBool,
    created_at: Instant,
    commands_executed: AtomicU64,
}

impl SshSession {
    async fn open_sftp(&self) -> ConnectionResult<SftpSession> {
        let guard = self.handle.read().await;
        let handle = guard.as_ref().ok_or(ConnectionError::ConnectionClosed)?;
        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| ConnectionError::TransferFailed(format!("failed to open channel: {}", e)))?;
        drop(guard);

        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| ConnectionError::TransferFailed(format!("SFTP subsystem: {}", e)))?;
        Ok(SftpSession::new(channel.into_stream()).await?)
    }

    async fn run_channel(&self, command: String) -> ConnectionResult<CommandResult> {
        let guard = self.handle.read().await;
        let handle = guard.as_ref().ok_or(ConnectionError::ConnectionClosed)?;
        let mut channel = handle.channel_open_session().await.map_err(|e| {
            self.connected.store(false, Ordering::SeqCst);
            ConnectionError::ConnectionFailed(format!("failed to open channel: {}", e))
        })?;
        drop(guard);

        channel
            .exec(true, command)
            .await
            .map_err(|e| ConnectionError::ExecutionFailed(e.to_string()))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext: 1 } => stderr.extend_from_slice(data),
                ChannelMsg::ExitStatus { exit_status } => exit_code = Some(exit_status),
                ChannelMsg::Close => break,
                _ => {}
            }
        }

        let Some(exit_code) = exit_code else {
            self.connected.store(false, Ordering::SeqCst);
            return Err(ConnectionError::ConnectionClosed);
        };
        let exit_code = i32::try_from(exit_code).unwrap_or(i32::MAX);
        let stdout = String::from_utf8_lossy(&stdout).into_owned();
        let stderr = String::from_utf8_lossy(&stderr).into_owned();
        trace!(exit_code, "command completed");

        Ok(if exit_code == 0 {
            CommandResult::success(stdout, stderr)
        } else {
            CommandResult::failure(exit_code, stdout, stderr)
        })
    }
}

#[async_trait]
impl Session for SshSession {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn is_alive(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.handle.read().await.is_some()
    }

    async fn execute(
        &self,
        command: &str,
        options: Option<ExecuteOptions>,
    ) -> ConnectionResult<CommandResult> {
        let options = options.unwrap_or_default();
        let command = options.wrap_command(command);
        trace!(host = %self.identifier, command = %command, "executing remote command");
        self.commands_executed.fetch_add(1, Ordering::Relaxed);

        match options.timeout {
            Some(limit) => tokio::time::timeout(limit, self.run_channel(command))
                .await
                .map_err(|_| ConnectionError::CommandTimeout(limit))?,
            None => self.run_channel(command).await,
        }
    }

    async fn put_file(
        &self,
        content: &[u8],
        remote_path: &Path,
        options: Option<TransferOptions>,
    ) -> ConnectionResult<()> {
        let options = options.unwrap_or_default();
        let path = remote_path.to_string_lossy().to_string();
        debug!(host = %self.identifier, path = %path, size = content.len(), "uploading via SFTP");

        let sftp = self.open_sftp().await?;
        if options.create_dirs {
            if let Some(parent) = remote_path.parent() {
                let mut current = PathBuf::new();
                for component in parent.components() {
                    current.push(component);
                    if current.as_os_str() != "/" {
                        // Already existing directories report an error here
                        let _ = sftp.create_dir(current.to_string_lossy().to_string()).await;
                    }
                }
            }
        }

        let mut file = sftp
            .create(&path)
            .await
            .map_err(|e| ConnectionError::TransferFailed(format!("create {}: {}", path, e)))?;
        file.write_all(content)
            .await
            .map_err(|e| ConnectionError::TransferFailed(format!("write {}: {}", path, e)))?;
        file.shutdown()
            .await
            .map_err(|e| ConnectionError::TransferFailed(format!("close {}: {}", path, e)))?;
        drop(file);

        if let Some(mode) = options.mode {
            let attrs = russh_sftp::protocol::FileAttributes {
                permissions: Some(mode),
                ..Default::default()
            };
            sftp.set_metadata(&path, attrs).await?;
        }
        drop(sftp);

        let owner_group = match (&options.owner, &options.group) {
            (Some(owner), Some(group)) => Some(format!("{}:{}", owner, group)),
            (Some(owner), None) => Some(owner.clone()),
            (None, Some(group)) => Some(format!(":{}", group)),
            (None, None) => None,
        };
        if let Some(owner_group) = owner_group {
            let chown = format!("chown {} {}", owner_group, escape_shell_arg(&path));
            let result = self.execute(&chown, None).await?;
            if !result.success {
                return Err(ConnectionError::TransferFailed(format!(
                    "chown {} failed: {}",
                    path,
                    result.stderr.trim()
                )));
            }
        }
        Ok(())
    }

    async fn close(&self) -> ConnectionResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        let handle = self.handle.write().await.take();
        if let Some(handle) = handle {
            debug!(
                host = %self.identifier,
                uptime = ?self.created_at.elapsed(),
                commands = self.commands_executed.load(Ordering::Relaxed),
                "closing SSH session"
            );
            let _ = handle
                .disconnect(russh::Disconnect::ByApplication, "session closed", "en")
                .await;
        }
        Ok(())
    }
}

impl std::fmt::Debug for SshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshSession")
            .field("identifier", &self.identifier)
            .field("connected", &self.connected.load(Ordering::Relaxed))
            .finish()
    }
}
