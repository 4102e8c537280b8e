mod remote;
mod sftp;

pub use remote::{EntryKind, RemoteConnector, RemoteEntry, RemoteError, RemoteSession};
pub use sftp::{SftpConfig, SftpConnector, SftpRemote};
