use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};

use crate::client::{RemoteClient, RemoteConnector, RemoteEntry, RemoteError};

/// A remote tree that lives in a directory reachable through the local
/// filesystem (a mounted share, a NAS export, a mirror disk).
pub struct FsRemote {
    base: PathBuf,
    connected: bool,
}

impl FsRemote {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            connected: false,
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn resolve(&self, remote: &str) -> Result<PathBuf, RemoteError> {
        if !self.connected {
            return Err(RemoteError::NotConnected);
        }
        map_under_base(&self.base, remote)
    }
}

fn map_under_base(base: &Path, remote: &str) -> Result<PathBuf, RemoteError> {
    if remote.is_empty() {
        return Err(RemoteError::InvalidPath(remote.to_string()));
    }
    let mut out = base.to_path_buf();
    for component in Path::new(remote).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir | Component::CurDir => continue,
            Component::ParentDir | Component::Prefix(_) => {
                return Err(RemoteError::InvalidPath(remote.to_string()));
            }
        }
    }
    Ok(out)
}

fn not_found_or_io(err: io::Error, remote: &str) -> RemoteError {
    if err.kind() == io::ErrorKind::NotFound {
        RemoteError::NotFound(remote.to_string())
    } else {
        RemoteError::Io(err)
    }
}

#[async_trait]
impl RemoteClient for FsRemote {
    async fn connect(&mut self) -> Result<(), RemoteError> {
        if self.connected {
            return Ok(());
        }
        match tokio::fs::metadata(&self.base).await {
            Ok(meta) if meta.is_dir() => {
                self.connected = true;
                Ok(())
            }
            Ok(_) => Err(RemoteError::Connection(format!(
                "{} is not a directory",
                self.base.display()
            ))),
            Err(err) => Err(RemoteError::Connection(format!(
                "{} is unreachable: {err}",
                self.base.display()
            ))),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn disconnect(&mut self) -> Result<(), RemoteError> {
        self.connected = false;
        Ok(())
    }

    async fn list_dir(&mut self, path: &str) -> Result<Vec<RemoteEntry>, RemoteError> {
        let dir = self.resolve(path)?;
        let mut reader = tokio::fs::read_dir(&dir)
            .await
            .map_err(|err| not_found_or_io(err, path))?;
        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let meta = match entry.metadata().await {
                Ok(meta) => meta,
                // Removed between readdir and stat.
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            entries.push(RemoteEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                size: if meta.is_dir() { 0 } else { meta.len() },
                modified: meta.modified().ok().map(OffsetDateTime::from),
                is_dir: meta.is_dir(),
            });
        }
        Ok(entries)
    }

    async fn upload(
        &mut self,
        local: &Path,
        remote: &str,
        buffer_size: usize,
    ) -> Result<u64, RemoteError> {
        let target = self.resolve(remote)?;
        let source = tokio::fs::File::open(local).await?;
        let mut reader = BufReader::with_capacity(buffer_size.max(1), source);
        let file = tokio::fs::File::create(&target)
            .await
            .map_err(|err| not_found_or_io(err, remote))?;
        let mut writer = BufWriter::with_capacity(buffer_size.max(1), file);
        let copied = tokio::io::copy_buf(&mut reader, &mut writer).await?;
        writer.flush().await?;
        Ok(copied)
    }

    async fn download(
        &mut self,
        remote: &str,
        local: &Path,
        buffer_size: usize,
    ) -> Result<u64, RemoteError> {
        let source_path = self.resolve(remote)?;
        let source = tokio::fs::File::open(&source_path)
            .await
            .map_err(|err| not_found_or_io(err, remote))?;
        let mut reader = BufReader::with_capacity(buffer_size.max(1), source);
        let file = tokio::fs::File::create(local).await?;
        let mut writer = BufWriter::with_capacity(buffer_size.max(1), file);
        let copied = tokio::io::copy_buf(&mut reader, &mut writer).await?;
        writer.flush().await?;
        Ok(copied)
    }

    async fn delete(&mut self, path: &str) -> Result<(), RemoteError> {
        let target = self.resolve(path)?;
        tokio::fs::remove_file(&target)
            .await
            .map_err(|err| not_found_or_io(err, path))
    }

    async fn mkdir(&mut self, path: &str) -> Result<(), RemoteError> {
        let target = self.resolve(path)?;
        match tokio::fs::create_dir(&target).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(err) => Err(not_found_or_io(err, path)),
        }
    }

    async fn set_modified(
        &mut self,
        path: &str,
        modified: OffsetDateTime,
    ) -> Result<(), RemoteError> {
        let target = self.resolve(path)?;
        let stamp = SystemTime::from(modified);
        let remote = path.to_string();
        tokio::task::spawn_blocking(move || {
            let file = std::fs::OpenOptions::new().write(true).open(&target)?;
            file.set_modified(stamp)
        })
        .await
        .map_err(|err| RemoteError::Other(format!("set_modified task failed: {err}")))?
        .map_err(|err| not_found_or_io(err, &remote))
    }
}

#[derive(Debug, Clone)]
pub struct FsConnector {
    base: PathBuf,
}

impl FsConnector {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }
}

impl RemoteConnector for FsConnector {
    fn session(&self) -> Box<dyn RemoteClient> {
        Box::new(FsRemote::new(self.base.clone()))
    }

    fn describe(&self) -> String {
        format!("file://{}", self.base.display())
    }
}
