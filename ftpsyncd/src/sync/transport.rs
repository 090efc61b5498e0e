use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use ftpsync_core::{RemoteClient, RemoteError, join_remote, parent_remote};
use thiserror::Error;
use time::OffsetDateTime;

use super::conflict::FileRecord;
use super::paths::{PathError, PathMapper};

const PARTIAL_SUFFIX: &str = ".ftpsync-partial";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connection(#[source] RemoteError),
    #[error("listing {path} failed: {source}")]
    List {
        path: String,
        #[source]
        source: RemoteError,
    },
    #[error("{op} {path} failed: {source}")]
    Transfer {
        op: &'static str,
        path: String,
        #[source]
        source: RemoteError,
    },
    #[error("local I/O on {} failed: {source}", .path.display())]
    Local {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Path(#[from] PathError),
}

impl TransportError {
    pub fn is_connection(&self) -> bool {
        matches!(self, TransportError::Connection(_))
    }

    fn local(path: &Path, source: io::Error) -> Self {
        TransportError::Local {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// One logical connection to a target's remote endpoint.
pub struct Transport {
    client: Box<dyn RemoteClient>,
    mapper: PathMapper,
    buffer_size: usize,
}

impl Transport {
    pub fn new(client: Box<dyn RemoteClient>, mapper: PathMapper, buffer_size: usize) -> Self {
        Self {
            client,
            mapper,
            buffer_size: buffer_size.max(1),
        }
    }

    pub fn mapper(&self) -> &PathMapper {
        &self.mapper
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    pub async fn connect(&mut self) -> Result<(), TransportError> {
        if self.client.is_connected() {
            return Ok(());
        }
        self.client
            .connect()
            .await
            .map_err(TransportError::Connection)
    }

    pub async fn disconnect(&mut self) {
        if let Err(err) = self.client.disconnect().await {
            tracing::debug!(error = %err, "disconnect failed");
        }
    }

    /// Every file below `root`, keyed by path relative to the mapper's remote
    /// root. A subdirectory that disappears or cannot be read mid-walk is
    /// skipped.
    pub async fn list_recursive(&mut self, root: &str) -> Result<Vec<FileRecord>, TransportError> {
        let mut records = Vec::new();
        let mut pending = vec![root.to_string()];
        while let Some(dir) = pending.pop() {
            let entries = match self.client.list_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.is_connection() => return Err(self.connection_lost(err).await),
                Err(err) if dir == root => {
                    return Err(TransportError::List {
                        path: dir,
                        source: err,
                    });
                }
                Err(err) => {
                    tracing::warn!(path = %dir, error = %err, "skipping unreadable remote directory");
                    continue;
                }
            };
            for entry in entries {
                let full = join_remote(&dir, &entry.name);
                if entry.is_dir {
                    pending.push(full);
                    continue;
                }
                let path = self.mapper.relative_of_remote(&full)?;
                records.push(FileRecord {
                    path,
                    size: entry.size,
                    modified: entry.modified.unwrap_or(OffsetDateTime::UNIX_EPOCH),
                });
            }
        }
        Ok(records)
    }

    /// Uploads `local` to `remote`, creating remote parents, then stamps the
    /// remote copy with the local modification time.
    pub async fn upload(&mut self, local: &Path, remote: &str) -> Result<u64, TransportError> {
        let modified = local_modified(local)
            .await
            .map_err(|err| TransportError::local(local, err))?;
        if let Some(parent) = parent_remote(remote) {
            match self.client.ensure_dir(&parent).await {
                Ok(()) => {}
                Err(err) if err.is_connection() => return Err(self.connection_lost(err).await),
                Err(err) => return Err(Self::transfer("mkdir", &parent, err)),
            }
        }
        let sent = match self.client.upload(local, remote, self.buffer_size).await {
            Ok(sent) => sent,
            Err(err) if err.is_connection() => return Err(self.connection_lost(err).await),
            Err(err) => return Err(Self::transfer("upload", remote, err)),
        };
        if let Err(err) = self.client.set_modified(remote, modified).await {
            tracing::warn!(path = %remote, error = %err, "failed to preserve remote mtime");
        }
        Ok(sent)
    }

    /// Downloads `remote` next to `local` under a hidden partial name, applies
    /// `modified` and renames it into place, so `local` is never half-written.
    pub async fn download(
        &mut self,
        remote: &str,
        local: &Path,
        modified: Option<OffsetDateTime>,
    ) -> Result<u64, TransportError> {
        let partial = partial_path(local)?;
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| TransportError::local(parent, err))?;
        }

        let received = match self.client.download(remote, &partial, self.buffer_size).await {
            Ok(received) => received,
            Err(err) => {
                let _ = tokio::fs::remove_file(&partial).await;
                if err.is_connection() {
                    return Err(self.connection_lost(err).await);
                }
                return Err(Self::transfer("download", remote, err));
            }
        };

        if let Some(modified) = modified
            && let Err(err) = set_local_modified(&partial, modified).await
        {
            tracing::warn!(path = %local.display(), error = %err, "failed to preserve local mtime");
        }
        if let Err(err) = tokio::fs::rename(&partial, local).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(TransportError::local(local, err));
        }
        Ok(received)
    }

    /// Deletes a remote file. A file that is already gone counts as deleted.
    pub async fn remove(&mut self, remote: &str) -> Result<(), TransportError> {
        match self.client.delete(remote).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) if err.is_connection() => Err(self.connection_lost(err).await),
            Err(err) => Err(Self::transfer("delete", remote, err)),
        }
    }

    fn transfer(op: &'static str, path: &str, source: RemoteError) -> TransportError {
        TransportError::Transfer {
            op,
            path: path.to_string(),
            source,
        }
    }

    async fn connection_lost(&mut self, err: RemoteError) -> TransportError {
        self.disconnect().await;
        TransportError::Connection(err)
    }
}

fn partial_path(local: &Path) -> Result<PathBuf, TransportError> {
    let name = local
        .file_name()
        .ok_or_else(|| PathError::UnsupportedComponent(local.display().to_string()))?;
    let partial = format!(".{}{PARTIAL_SUFFIX}", name.to_string_lossy());
    Ok(local.with_file_name(partial))
}

pub async fn local_modified(path: &Path) -> io::Result<OffsetDateTime> {
    let metadata = tokio::fs::metadata(path).await?;
    Ok(OffsetDateTime::from(metadata.modified()?))
}

pub async fn set_local_modified(path: &Path, modified: OffsetDateTime) -> io::Result<()> {
    let path = path.to_path_buf();
    let stamp = SystemTime::from(modified);
    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::options().write(true).open(&path)?;
        file.set_modified(stamp)
    })
    .await
    .map_err(io::Error::other)?
}
