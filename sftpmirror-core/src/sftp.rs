use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::keys::known_hosts::{known_host_keys_path, learn_known_hosts_path};
use russh::keys::ssh_key;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::{OpenFlags, StatusCode};
use tokio::io::{AsyncRead, AsyncWriteExt};

use crate::remote::{EntryKind, RemoteConnector, RemoteEntry, RemoteError, RemoteSession};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Inactivity timeout for established SSH sessions.
const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct SftpConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub connect_timeout: Duration,
    /// Overrides `~/.ssh/known_hosts`.
    pub known_hosts: Option<PathBuf>,
}

impl SftpConfig {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
            password: password.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            known_hosts: None,
        }
    }
}

/// Dials a fresh SSH connection and opens the SFTP subsystem for every
/// `connect` call. The daemon holds at most one live session at a time.
pub struct SftpConnector {
    config: SftpConfig,
}

impl SftpConnector {
    pub fn new(config: SftpConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl RemoteConnector for SftpConnector {
    type Session = SftpRemote;

    async fn connect(&self) -> Result<SftpRemote, RemoteError> {
        SftpRemote::connect(&self.config).await
    }
}

pub struct SftpRemote {
    sftp: SftpSession,
    // Keep the SSH handle alive so the session isn't dropped.
    ssh: client::Handle<HostKeyHandler>,
}

impl SftpRemote {
    async fn connect(config: &SftpConfig) -> Result<Self, RemoteError> {
        let ssh_config = Arc::new(client::Config {
            inactivity_timeout: Some(INACTIVITY_TIMEOUT),
            ..Default::default()
        });
        let handler = HostKeyHandler {
            host: config.host.clone(),
            port: config.port,
            known_hosts_path: resolve_known_hosts_path(config.known_hosts.as_deref())?,
        };

        let addr = (config.host.as_str(), config.port);
        let mut ssh = tokio::time::timeout(
            config.connect_timeout,
            client::connect(ssh_config, addr, handler),
        )
        .await
        .map_err(|_| RemoteError::ConnectTimeout(config.connect_timeout))??;

        let auth = ssh
            .authenticate_password(&config.user, &config.password)
            .await?;
        if !auth.success() {
            return Err(RemoteError::AuthRejected(config.user.clone()));
        }

        let channel = ssh.channel_open_session().await?;
        channel.request_subsystem(true, "sftp").await?;
        let sftp = SftpSession::new(channel.into_stream()).await?;

        Ok(Self { sftp, ssh })
    }
}

#[async_trait]
impl RemoteSession for SftpRemote {
    async fn noop(&mut self) -> Result<(), RemoteError> {
        self.sftp.metadata("/").await?;
        Ok(())
    }

    async fn list_dir(&mut self, path: &str) -> Result<Vec<RemoteEntry>, RemoteError> {
        let dir = self.sftp.read_dir(path).await?;
        let mut entries = Vec::new();
        for entry in dir {
            let name = entry.file_name();
            if name == "." || name == ".." {
                continue;
            }
            let file_type = entry.metadata().file_type();
            let kind = if file_type.is_dir() {
                EntryKind::Dir
            } else if file_type.is_file() {
                EntryKind::File
            } else {
                EntryKind::Other
            };
            entries.push(RemoteEntry { name, kind });
        }
        Ok(entries)
    }

    async fn make_dir(&mut self, path: &str) -> Result<(), RemoteError> {
        match self.sftp.create_dir(path).await {
            Ok(()) => Ok(()),
            Err(err) => match &err {
                // Servers report an already-existing directory as a generic
                // failure; a stale cache may legitimately race us here.
                russh_sftp::client::error::Error::Status(status)
                    if status.status_code == StatusCode::Failure =>
                {
                    self.sftp.metadata(path).await?;
                    Ok(())
                }
                _ => Err(err.into()),
            },
        }
    }

    async fn store(
        &mut self,
        remote_path: &str,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<(), RemoteError> {
        let mut file = self
            .sftp
            .open_with_flags(
                remote_path,
                OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE,
            )
            .await?;
        tokio::io::copy(source, &mut file).await?;
        file.flush().await?;
        file.shutdown().await?;
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self
            .ssh
            .disconnect(russh::Disconnect::ByApplication, "shutting down", "en")
            .await;
    }
}

/// SSH client handler that enforces known-host checks (TOFU).
struct HostKeyHandler {
    host: String,
    port: u16,
    known_hosts_path: PathBuf,
}

impl client::Handler for HostKeyHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        verify_or_learn_host_key(
            &self.host,
            self.port,
            &self.known_hosts_path,
            server_public_key,
        )
        .map(|_| true)
    }
}

fn verify_or_learn_host_key(
    host: &str,
    port: u16,
    known_hosts_path: &Path,
    server_public_key: &ssh_key::PublicKey,
) -> Result<(), russh::Error> {
    ensure_known_hosts_file(known_hosts_path).map_err(russh::Error::IO)?;

    let known = known_host_keys_path(host, port, known_hosts_path)?;
    if known
        .iter()
        .any(|(_, existing_key)| existing_key == server_public_key)
    {
        return Ok(());
    }

    if known.is_empty() {
        // First contact: trust and record the key.
        learn_known_hosts_path(host, port, server_public_key, known_hosts_path)?;
        return Ok(());
    }

    Err(russh::Error::KeyChanged { line: known[0].0 })
}

fn ensure_known_hosts_file(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if path.exists() {
        return Ok(());
    }

    let mut options = std::fs::OpenOptions::new();
    options.create_new(true).write(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    match options.open(path) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e),
    }
}

fn resolve_known_hosts_path(explicit: Option<&Path>) -> Result<PathBuf, RemoteError> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    let home = dirs::home_dir()
        .ok_or_else(|| RemoteError::Other("cannot determine home directory".into()))?;
    Ok(home.join(".ssh").join("known_hosts"))
}
