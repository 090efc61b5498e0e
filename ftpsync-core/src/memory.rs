use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::client::{RemoteClient, RemoteConnector, RemoteEntry, RemoteError, parent_remote};

#[derive(Debug, Clone)]
struct MemoryFile {
    data: Vec<u8>,
    modified: OffsetDateTime,
}

#[derive(Debug, Default)]
struct MemoryState {
    files: BTreeMap<String, MemoryFile>,
    dirs: BTreeSet<String>,
    connects: usize,
    failing_connects: usize,
    failing_paths: HashSet<String>,
    active_ops: usize,
    peak_ops: usize,
    completed_ops: usize,
    op_delay: Duration,
}

/// An in-process remote tree shared by every session created from it.
///
/// Supports fault injection and records how many operations ran at once,
/// which makes it the remote double for engine and pool tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryRemote {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        let remote = Self::default();
        remote.lock().dirs.insert("/".to_string());
        remote
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            remote: self.clone(),
        }
    }

    pub fn session(&self) -> MemorySession {
        MemorySession {
            remote: self.clone(),
            connected: false,
        }
    }

    /// Stores a file, creating its parent directories.
    pub fn put_file(&self, path: &str, data: impl Into<Vec<u8>>, modified: OffsetDateTime) {
        let mut state = self.lock();
        insert_parents(&mut state.dirs, path);
        state.files.insert(
            path.to_string(),
            MemoryFile {
                data: data.into(),
                modified,
            },
        );
    }

    pub fn mkdir_all(&self, path: &str) {
        let mut state = self.lock();
        insert_parents(&mut state.dirs, path);
        state.dirs.insert(path.to_string());
    }

    pub fn file(&self, path: &str) -> Option<(Vec<u8>, OffsetDateTime)> {
        self.lock()
            .files
            .get(path)
            .map(|file| (file.data.clone(), file.modified))
    }

    pub fn file_paths(&self) -> Vec<String> {
        self.lock().files.keys().cloned().collect()
    }

    pub fn remove_file(&self, path: &str) -> bool {
        self.lock().files.remove(path).is_some()
    }

    pub fn connect_count(&self) -> usize {
        self.lock().connects
    }

    pub fn peak_concurrency(&self) -> usize {
        self.lock().peak_ops
    }

    pub fn completed_operations(&self) -> usize {
        self.lock().completed_ops
    }

    /// Makes every data operation take at least `delay`.
    pub fn set_op_delay(&self, delay: Duration) {
        self.lock().op_delay = delay;
    }

    /// The next `count` connect attempts fail with a connection error.
    pub fn fail_next_connects(&self, count: usize) {
        self.lock().failing_connects = count;
    }

    /// Every operation touching `path` fails until cleared.
    pub fn fail_path(&self, path: &str) {
        self.lock().failing_paths.insert(path.to_string());
    }

    pub fn clear_failures(&self) {
        let mut state = self.lock();
        state.failing_paths.clear();
        state.failing_connects = 0;
    }

    async fn begin_op(&self, path: &str) -> Result<(), RemoteError> {
        let delay = {
            let mut state = self.lock();
            if state.failing_paths.contains(path) {
                return Err(RemoteError::Other(format!("injected failure for {path}")));
            }
            state.active_ops += 1;
            state.peak_ops = state.peak_ops.max(state.active_ops);
            state.op_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    fn end_op(&self) {
        let mut state = self.lock();
        state.active_ops = state.active_ops.saturating_sub(1);
        state.completed_ops += 1;
    }
}

fn insert_parents(dirs: &mut BTreeSet<String>, path: &str) {
    let mut current = parent_remote(path);
    while let Some(dir) = current {
        let done = dir == "/";
        current = if done { None } else { parent_remote(&dir) };
        dirs.insert(dir);
    }
}

fn child_name<'a>(dir: &str, path: &'a str) -> Option<&'a str> {
    let rest = if dir == "/" {
        path.strip_prefix('/')?
    } else {
        path.strip_prefix(dir)?.strip_prefix('/')?
    };
    if rest.is_empty() || rest.contains('/') {
        None
    } else {
        Some(rest)
    }
}

/// One "control connection" against a [`MemoryRemote`].
pub struct MemorySession {
    remote: MemoryRemote,
    connected: bool,
}

impl MemorySession {
    fn ensure_connected(&self) -> Result<(), RemoteError> {
        if self.connected {
            Ok(())
        } else {
            Err(RemoteError::NotConnected)
        }
    }
}

#[async_trait]
impl RemoteClient for MemorySession {
    async fn connect(&mut self) -> Result<(), RemoteError> {
        if self.connected {
            return Ok(());
        }
        let mut state = self.remote.lock();
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(RemoteError::Connection("injected connect failure".into()));
        }
        state.connects += 1;
        self.connected = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn disconnect(&mut self) -> Result<(), RemoteError> {
        self.connected = false;
        Ok(())
    }

    async fn list_dir(&mut self, path: &str) -> Result<Vec<RemoteEntry>, RemoteError> {
        self.ensure_connected()?;
        self.remote.begin_op(path).await?;
        let result = {
            let state = self.remote.lock();
            if !state.dirs.contains(path) {
                Err(RemoteError::NotFound(path.to_string()))
            } else {
                let dirs = state
                    .dirs
                    .iter()
                    .filter_map(|dir| child_name(path, dir))
                    .map(|name| RemoteEntry {
                        name: name.to_string(),
                        size: 0,
                        modified: None,
                        is_dir: true,
                    });
                let files = state.files.iter().filter_map(|(file_path, file)| {
                    child_name(path, file_path).map(|name| RemoteEntry {
                        name: name.to_string(),
                        size: file.data.len() as u64,
                        modified: Some(file.modified),
                        is_dir: false,
                    })
                });
                Ok(dirs.chain(files).collect())
            }
        };
        self.remote.end_op();
        result
    }

    async fn upload(
        &mut self,
        local: &Path,
        remote: &str,
        _buffer_size: usize,
    ) -> Result<u64, RemoteError> {
        self.ensure_connected()?;
        self.remote.begin_op(remote).await?;
        let result = match tokio::fs::read(local).await {
            Ok(data) => {
                let mut state = self.remote.lock();
                match parent_remote(remote) {
                    Some(parent) if state.dirs.contains(&parent) => {
                        let len = data.len() as u64;
                        state.files.insert(
                            remote.to_string(),
                            MemoryFile {
                                data,
                                modified: OffsetDateTime::now_utc(),
                            },
                        );
                        Ok(len)
                    }
                    _ => Err(RemoteError::NotFound(remote.to_string())),
                }
            }
            Err(err) => Err(err.into()),
        };
        self.remote.end_op();
        result
    }

    async fn download(
        &mut self,
        remote: &str,
        local: &Path,
        _buffer_size: usize,
    ) -> Result<u64, RemoteError> {
        self.ensure_connected()?;
        self.remote.begin_op(remote).await?;
        let data = self.remote.lock().files.get(remote).map(|f| f.data.clone());
        let result = match data {
            Some(data) => tokio::fs::write(local, &data)
                .await
                .map(|()| data.len() as u64)
                .map_err(RemoteError::from),
            None => Err(RemoteError::NotFound(remote.to_string())),
        };
        self.remote.end_op();
        result
    }

    async fn delete(&mut self, path: &str) -> Result<(), RemoteError> {
        self.ensure_connected()?;
        self.remote.begin_op(path).await?;
        let removed = self.remote.lock().files.remove(path).is_some();
        self.remote.end_op();
        if removed {
            Ok(())
        } else {
            Err(RemoteError::NotFound(path.to_string()))
        }
    }

    async fn mkdir(&mut self, path: &str) -> Result<(), RemoteError> {
        self.ensure_connected()?;
        let mut state = self.remote.lock();
        if state.failing_paths.contains(path) {
            return Err(RemoteError::Other(format!("injected failure for {path}")));
        }
        match parent_remote(path) {
            Some(parent) if !state.dirs.contains(&parent) => {
                Err(RemoteError::NotFound(parent))
            }
            _ => {
                state.dirs.insert(path.to_string());
                Ok(())
            }
        }
    }

    async fn set_modified(
        &mut self,
        path: &str,
        modified: OffsetDateTime,
    ) -> Result<(), RemoteError> {
        self.ensure_connected()?;
        let mut state = self.remote.lock();
        match state.files.get_mut(path) {
            Some(file) => {
                file.modified = modified;
                Ok(())
            }
            None => Err(RemoteError::NotFound(path.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemoryConnector {
    remote: MemoryRemote,
}

impl RemoteConnector for MemoryConnector {
    fn session(&self) -> Box<dyn RemoteClient> {
        Box::new(self.remote.session())
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}
