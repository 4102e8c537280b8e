use std::io;
use std::time::Duration;

use async_trait::async_trait;
use russh_sftp::protocol::StatusCode;
use thiserror::Error;
use tokio::io::AsyncRead;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("connect timed out after {}s", .0.as_secs())]
    ConnectTimeout(Duration),
    #[error("authentication rejected for user '{0}'")]
    AuthRejected(String),
    #[error("ssh error: {0}")]
    Ssh(#[from] russh::Error),
    #[error("sftp error: {0}")]
    Sftp(#[from] russh_sftp::client::error::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Other(String),
}

impl RemoteError {
    /// Whether the session that produced this error must be discarded.
    /// A session is never reused after a connection-level failure.
    pub fn is_connection_level(&self) -> bool {
        match self {
            Self::ConnectTimeout(_) | Self::AuthRejected(_) | Self::Ssh(_) => true,
            Self::Sftp(err) => is_connection_level_sftp(err),
            Self::Io(err) => is_connection_level_io(err.kind()),
            Self::Other(_) => false,
        }
    }
}

fn is_connection_level_sftp(err: &russh_sftp::client::error::Error) -> bool {
    match err {
        russh_sftp::client::error::Error::Timeout => true,
        russh_sftp::client::error::Error::IO(_) => true,
        russh_sftp::client::error::Error::Limited(_) => true,
        russh_sftp::client::error::Error::UnexpectedPacket => true,
        russh_sftp::client::error::Error::UnexpectedBehavior(_) => true,
        russh_sftp::client::error::Error::Status(status) => matches!(
            status.status_code,
            StatusCode::NoConnection | StatusCode::ConnectionLost | StatusCode::BadMessage
        ),
    }
}

fn is_connection_level_io(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    Other,
}

/// Immediate child of a remote directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub kind: EntryKind,
}

impl RemoteEntry {
    pub fn dir(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::Dir,
        }
    }

    pub fn file(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::File,
        }
    }
}

/// Dials and authenticates a new remote session.
#[async_trait]
pub trait RemoteConnector: Send + Sync + 'static {
    type Session: RemoteSession;

    async fn connect(&self) -> Result<Self::Session, RemoteError>;
}

/// One live session to the remote server. All operations address
/// absolute remote paths.
#[async_trait]
pub trait RemoteSession: Send + 'static {
    /// Liveness probe. Any error means the session is dead.
    async fn noop(&mut self) -> Result<(), RemoteError>;

    async fn list_dir(&mut self, path: &str) -> Result<Vec<RemoteEntry>, RemoteError>;

    /// Creates a single directory component. The parent must exist.
    async fn make_dir(&mut self, path: &str) -> Result<(), RemoteError>;

    async fn store(
        &mut self,
        remote_path: &str,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<(), RemoteError>;

    /// Best-effort disconnect; errors are swallowed.
    async fn close(&mut self);
}
