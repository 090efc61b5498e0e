use std::io;
use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote path not found: {0}")]
    NotFound(String),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("not connected")]
    NotConnected,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid remote path: {0}")]
    InvalidPath(String),
    #[error("remote operation failed: {0}")]
    Other(String),
}

/// Coarse classification the engine uses to pick a recovery policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorClass {
    NotFound,
    Connection,
    Other,
}

impl RemoteError {
    pub fn classification(&self) -> RemoteErrorClass {
        match self {
            RemoteError::NotFound(_) => RemoteErrorClass::NotFound,
            RemoteError::Connection(_) | RemoteError::NotConnected => {
                RemoteErrorClass::Connection
            }
            RemoteError::Io(err) => classify_io_error(err),
            RemoteError::InvalidPath(_) | RemoteError::Other(_) => RemoteErrorClass::Other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.classification() == RemoteErrorClass::NotFound
    }

    pub fn is_connection(&self) -> bool {
        self.classification() == RemoteErrorClass::Connection
    }
}

fn classify_io_error(err: &io::Error) -> RemoteErrorClass {
    match err.kind() {
        io::ErrorKind::NotFound => RemoteErrorClass::NotFound,
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::TimedOut => RemoteErrorClass::Connection,
        _ => RemoteErrorClass::Other,
    }
}

/// One entry of a single-directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub size: u64,
    pub modified: Option<OffsetDateTime>,
    pub is_dir: bool,
}

/// A stateful session over one control connection.
///
/// Paths are absolute POSIX-style remote paths (`/backup/docs/a.txt`).
#[async_trait]
pub trait RemoteClient: Send {
    async fn connect(&mut self) -> Result<(), RemoteError>;

    fn is_connected(&self) -> bool;

    async fn disconnect(&mut self) -> Result<(), RemoteError>;

    async fn list_dir(&mut self, path: &str) -> Result<Vec<RemoteEntry>, RemoteError>;

    /// Transmits the whole local file, overwriting the remote one. Returns bytes sent.
    async fn upload(
        &mut self,
        local: &Path,
        remote: &str,
        buffer_size: usize,
    ) -> Result<u64, RemoteError>;

    /// Writes the remote file to `local`, truncating it. Returns bytes received.
    async fn download(
        &mut self,
        remote: &str,
        local: &Path,
        buffer_size: usize,
    ) -> Result<u64, RemoteError>;

    async fn delete(&mut self, path: &str) -> Result<(), RemoteError>;

    /// Creates one directory level. An already existing directory is not an error.
    async fn mkdir(&mut self, path: &str) -> Result<(), RemoteError>;

    async fn set_modified(
        &mut self,
        path: &str,
        modified: OffsetDateTime,
    ) -> Result<(), RemoteError>;

    async fn ensure_dir(&mut self, path: &str) -> Result<(), RemoteError> {
        let mut current = String::new();
        for part in path.split('/').filter(|part| !part.is_empty()) {
            current.push('/');
            current.push_str(part);
            self.mkdir(&current).await?;
        }
        Ok(())
    }
}

/// Produces fresh, unconnected sessions for one endpoint.
pub trait RemoteConnector: Send + Sync {
    fn session(&self) -> Box<dyn RemoteClient>;

    fn describe(&self) -> String;
}

pub fn join_remote(base: &str, name: &str) -> String {
    let base = base.trim_end_matches('/');
    let name = name.trim_start_matches('/');
    if name.is_empty() {
        return if base.is_empty() { "/".to_string() } else { base.to_string() };
    }
    format!("{base}/{name}")
}

pub fn parent_remote(path: &str) -> Option<String> {
    let trimmed = path.trim_end_matches('/');
    let (parent, _) = trimmed.rsplit_once('/')?;
    if parent.is_empty() {
        Some("/".to_string())
    } else {
        Some(parent.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_remote_paths_without_double_slashes() {
        assert_eq!(join_remote("/", "a.txt"), "/a.txt");
        assert_eq!(join_remote("/backup/", "/docs/a.txt"), "/backup/docs/a.txt");
        assert_eq!(join_remote("/backup", ""), "/backup");
        assert_eq!(join_remote("", ""), "/");
    }

    #[test]
    fn parent_of_top_level_entry_is_root() {
        assert_eq!(parent_remote("/a.txt"), Some("/".to_string()));
        assert_eq!(parent_remote("/docs/a.txt"), Some("/docs".to_string()));
        assert_eq!(parent_remote("a.txt"), None);
    }

    #[test]
    fn classifies_io_errors() {
        let missing = RemoteError::Io(io::Error::from(io::ErrorKind::NotFound));
        assert!(missing.is_not_found());

        let reset = RemoteError::Io(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(reset.is_connection());

        let denied = RemoteError::Io(io::Error::from(io::ErrorKind::PermissionDenied));
        assert_eq!(denied.classification(), RemoteErrorClass::Other);
        assert_eq!(
            RemoteError::NotConnected.classification(),
            RemoteErrorClass::Connection
        );
    }
}
