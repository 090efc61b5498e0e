use std::collections::{BTreeSet, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ftpsync_core::RemoteConnector;
use futures_util::stream::{self, StreamExt};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use super::conflict::{Action, DEFAULT_TOLERANCE, FileRecord, ResolvePolicy, resolve};
use super::cycle_lock::CycleLock;
use super::local_watcher::{ChangeKind, DEFAULT_DEBOUNCE_WINDOW, LocalEvent};
use super::paths::{PathError, PathMapper, is_hidden};
use super::pool::{ConnectionPool, PoolError};
use super::stats::{Direction, StatSink, TransferStat};
use super::target::SyncTarget;
use super::transport::TransportError;

const DEFAULT_IDLE_CLOSE_THRESHOLD: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("connection pool unavailable: {0}")]
    Pool(#[from] PoolError),
    #[error("scanning local tree at {} failed: {source}", .path.display())]
    LocalScan {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Path(#[from] PathError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    pub tolerance: Duration,
    pub debounce_window: Duration,
    /// Pooled connections are closed after each cycle when the sync interval
    /// is longer than this.
    pub idle_close_threshold: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_TOLERANCE,
            debounce_window: DEFAULT_DEBOUNCE_WINDOW,
            idle_close_threshold: DEFAULT_IDLE_CLOSE_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleTrigger {
    Timer,
    Explicit,
}

impl CycleTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            CycleTrigger::Timer => "timer",
            CycleTrigger::Explicit => "explicit",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOrigin {
    Watch,
    Cycle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferTask {
    pub direction: Direction,
    pub path: String,
    pub local: PathBuf,
    pub remote: String,
    pub origin: TaskOrigin,
    pub remote_modified: Option<OffsetDateTime>,
}

#[derive(Debug)]
pub struct TaskOutcome {
    pub task: TransferTask,
    pub result: Result<u64, String>,
}

impl TaskOutcome {
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CyclePlan {
    pub tasks: Vec<TransferTask>,
    pub remote_unavailable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleSummary {
    pub target_id: String,
    pub trigger: CycleTrigger,
    pub planned: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub bytes_uploaded: u64,
    pub bytes_downloaded: u64,
    pub remote_unavailable: bool,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Skipped,
    Completed(CycleSummary),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    size: u64,
    modified: OffsetDateTime,
}

struct EngineInner {
    target: SyncTarget,
    mapper: PathMapper,
    pool: ConnectionPool,
    stats: Arc<dyn StatSink>,
    options: EngineOptions,
    cycle_lock: CycleLock,
    cancel: CancellationToken,
    transferred: Mutex<HashMap<String, Fingerprint>>,
    last_summary: Mutex<Option<CycleSummary>>,
    finished: broadcast::Sender<CycleSummary>,
}

/// Synchronization engine for one target.
///
/// Full cycles are mutually exclusive; watch-triggered transfers run beside
/// them and share only the connection pool.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    pub fn new(
        target: SyncTarget,
        connector: Arc<dyn RemoteConnector>,
        stats: Arc<dyn StatSink>,
        options: EngineOptions,
    ) -> Self {
        let mapper = PathMapper::new(&target.local_root, target.remote_root.clone());
        let pool = ConnectionPool::new(
            connector,
            mapper.clone(),
            target.parallelism,
            target.buffer_size,
        );
        let (finished, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(EngineInner {
                target,
                mapper,
                pool,
                stats,
                options,
                cycle_lock: CycleLock::new(),
                cancel: CancellationToken::new(),
                transferred: Mutex::new(HashMap::new()),
                last_summary: Mutex::new(None),
                finished,
            }),
        }
    }

    pub fn target(&self) -> &SyncTarget {
        &self.inner.target
    }

    pub fn id(&self) -> &str {
        &self.inner.target.id
    }

    pub fn options(&self) -> &EngineOptions {
        &self.inner.options
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }

    pub fn is_cycle_running(&self) -> bool {
        self.inner.cycle_lock.is_running()
    }

    pub fn status(&self) -> &'static str {
        if self.is_cycle_running() {
            "cycle_running"
        } else {
            "idle"
        }
    }

    pub fn last_summary(&self) -> Option<CycleSummary> {
        self.inner
            .last_summary
            .lock()
            .ok()
            .and_then(|summary| summary.clone())
    }

    /// Summaries of every completed cycle, as they finish.
    pub fn subscribe(&self) -> broadcast::Receiver<CycleSummary> {
        self.inner.finished.subscribe()
    }

    /// Explicit trigger: waits for a running cycle, then runs a fresh one.
    pub async fn sync_now(&self) -> Result<CycleSummary, EngineError> {
        let _guard = self.inner.cycle_lock.acquire().await;
        self.run_locked(CycleTrigger::Explicit).await
    }

    /// Timer ticks are dropped while a cycle runs; explicit triggers wait.
    pub async fn run_cycle(&self, trigger: CycleTrigger) -> Result<CycleOutcome, EngineError> {
        match trigger {
            CycleTrigger::Explicit => self.sync_now().await.map(CycleOutcome::Completed),
            CycleTrigger::Timer => {
                let Some(_guard) = self.inner.cycle_lock.try_acquire() else {
                    tracing::warn!(target_id = %self.id(), "sync cycle already running; tick dropped");
                    return Ok(CycleOutcome::Skipped);
                };
                self.run_locked(trigger).await.map(CycleOutcome::Completed)
            }
        }
    }

    async fn run_locked(&self, trigger: CycleTrigger) -> Result<CycleSummary, EngineError> {
        let id = self.id();
        let started = Instant::now();
        tracing::info!(target_id = %id, trigger = trigger.as_str(), "sync cycle started");

        let plan = self.plan_cycle().await?;
        let planned = plan.tasks.len();
        let outcomes = self.execute(plan.tasks).await;

        let mut summary = CycleSummary {
            target_id: id.to_string(),
            trigger,
            planned,
            succeeded: 0,
            failed: 0,
            bytes_uploaded: 0,
            bytes_downloaded: 0,
            remote_unavailable: plan.remote_unavailable,
            elapsed: Duration::ZERO,
        };
        for outcome in &outcomes {
            match (&outcome.result, outcome.task.direction) {
                (Ok(bytes), Direction::Upload) => {
                    summary.succeeded += 1;
                    summary.bytes_uploaded += bytes;
                }
                (Ok(bytes), Direction::Download) => {
                    summary.succeeded += 1;
                    summary.bytes_downloaded += bytes;
                }
                (Ok(_), Direction::Delete) => summary.succeeded += 1,
                (Err(_), _) => summary.failed += 1,
            }
        }

        if self.inner.target.sync_interval > self.inner.options.idle_close_threshold {
            self.inner.pool.close_all().await;
        }
        self.inner.stats.flush().await;

        summary.elapsed = started.elapsed();
        tracing::info!(
            target_id = %id,
            trigger = trigger.as_str(),
            planned = summary.planned,
            succeeded = summary.succeeded,
            failed = summary.failed,
            bytes_uploaded = summary.bytes_uploaded,
            bytes_downloaded = summary.bytes_downloaded,
            remote_unavailable = summary.remote_unavailable,
            elapsed_ms = u64::try_from(summary.elapsed.as_millis()).unwrap_or(u64::MAX),
            "sync cycle finished"
        );
        if let Ok(mut last) = self.inner.last_summary.lock() {
            *last = Some(summary.clone());
        }
        let _ = self.inner.finished.send(summary.clone());
        Ok(summary)
    }

    /// Lists the remote tree once, gathers the matching local state and
    /// resolves every path. Nothing is transferred.
    pub async fn plan_cycle(&self) -> Result<CyclePlan, EngineError> {
        let target = &self.inner.target;
        let remote = match self.list_remote().await? {
            Some(remote) => remote,
            None => {
                return Ok(CyclePlan {
                    tasks: Vec::new(),
                    remote_unavailable: true,
                });
            }
        };

        let local = if target.mode.allows_upload() {
            walk_local(&self.inner.mapper).await?
        } else {
            let mut local = HashMap::new();
            for path in remote.keys() {
                let file = self.inner.mapper.local_for_relative(path)?;
                if let Some(record) = stat_local(path, &file).await {
                    local.insert(path.clone(), record);
                }
            }
            local
        };

        let policy = ResolvePolicy {
            mode: target.mode,
            propagate_deletes: target.propagate_deletes,
            tolerance: self.inner.options.tolerance,
        };
        let paths: BTreeSet<&String> = local.keys().chain(remote.keys()).collect();
        self.forget_vanished(&paths);
        let mut tasks = Vec::new();
        for path in paths {
            let local_record = local.get(path);
            let remote_record = remote.get(path);
            let direction = match resolve(local_record, remote_record, &policy) {
                Action::NoOp => continue,
                Action::Upload => Direction::Upload,
                Action::Download => Direction::Download,
                Action::DeleteRemote => Direction::Delete,
            };
            tasks.push(self.task(
                direction,
                path,
                TaskOrigin::Cycle,
                remote_record.map(|r| r.modified),
            )?);
        }
        Ok(CyclePlan {
            tasks,
            remote_unavailable: false,
        })
    }

    /// `None` when the endpoint cannot be reached. A missing or unreadable
    /// remote root is an empty tree.
    async fn list_remote(&self) -> Result<Option<HashMap<String, FileRecord>>, EngineError> {
        let id = self.id();
        let root = self.inner.mapper.remote_root();
        let mut transport = match self.inner.pool.acquire(&self.inner.cancel).await {
            Ok(transport) => transport,
            Err(PoolError::Connect(err)) => {
                tracing::warn!(target_id = %id, error = %err, "remote unreachable; cycle skipped");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        let records = match transport.list_recursive(root).await {
            Ok(records) => records,
            Err(err @ TransportError::Connection(_)) => {
                transport.mark_broken();
                tracing::warn!(target_id = %id, error = %err, "remote connection lost while listing");
                return Ok(None);
            }
            Err(err) => {
                tracing::warn!(target_id = %id, path = %root, error = %err, "remote listing failed; treating as empty");
                Vec::new()
            }
        };
        Ok(Some(
            records
                .into_iter()
                .filter(|record| !is_hidden(&record.path))
                .map(|record| (record.path.clone(), record))
                .collect(),
        ))
    }

    fn task(
        &self,
        direction: Direction,
        path: &str,
        origin: TaskOrigin,
        remote_modified: Option<OffsetDateTime>,
    ) -> Result<TransferTask, PathError> {
        Ok(TransferTask {
            direction,
            path: path.to_string(),
            local: self.inner.mapper.local_for_relative(path)?,
            remote: self.inner.mapper.remote_for_relative(path)?,
            origin,
            remote_modified,
        })
    }

    async fn execute(&self, tasks: Vec<TransferTask>) -> Vec<TaskOutcome> {
        let parallelism = self.inner.pool.parallelism();
        if !tasks.is_empty() {
            let warmed = self.inner.pool.prewarm().await;
            tracing::debug!(target_id = %self.id(), warmed, "connection pool pre-warmed");
        }
        stream::iter(tasks)
            .map(|task| self.run_task(task))
            .buffer_unordered(parallelism)
            .collect()
            .await
    }

    async fn run_task(&self, task: TransferTask) -> TaskOutcome {
        let id = self.id();
        let result = match self.inner.pool.acquire(&self.inner.cancel).await {
            Ok(mut transport) => {
                let result = match task.direction {
                    Direction::Upload => transport.upload(&task.local, &task.remote).await,
                    Direction::Download => {
                        transport
                            .download(&task.remote, &task.local, task.remote_modified)
                            .await
                    }
                    Direction::Delete => transport.remove(&task.remote).await.map(|()| 0),
                };
                if matches!(&result, Err(err) if err.is_connection()) {
                    transport.mark_broken();
                }
                result.map_err(|err| err.to_string())
            }
            Err(err) => Err(err.to_string()),
        };

        match &result {
            Ok(bytes) => {
                self.remember_transfer(&task).await;
                self.inner
                    .stats
                    .record(TransferStat::now(id, task.direction, *bytes));
                tracing::info!(
                    target_id = %id,
                    path = %task.path,
                    direction = task.direction.as_str(),
                    bytes = *bytes,
                    origin = ?task.origin,
                    "transfer succeeded"
                );
            }
            Err(err) => {
                tracing::warn!(
                    target_id = %id,
                    path = %task.path,
                    direction = task.direction.as_str(),
                    origin = ?task.origin,
                    error = %err,
                    "transfer failed"
                );
            }
        }
        TaskOutcome { task, result }
    }

    async fn remember_transfer(&self, task: &TransferTask) {
        let fingerprint = match task.direction {
            Direction::Delete => None,
            Direction::Upload | Direction::Download => local_fingerprint(&task.local).await,
        };
        if let Ok(mut transferred) = self.inner.transferred.lock() {
            match fingerprint {
                Some(fingerprint) => {
                    transferred.insert(task.path.clone(), fingerprint);
                }
                None => {
                    transferred.remove(&task.path);
                }
            }
        }
    }

    /// Drops transfer fingerprints of paths that exist on neither side.
    fn forget_vanished(&self, live: &BTreeSet<&String>) {
        if let Ok(mut transferred) = self.inner.transferred.lock() {
            transferred.retain(|path, _| live.contains(path));
        }
    }

    fn was_transferred_as(&self, path: &str, fingerprint: Fingerprint) -> bool {
        self.inner
            .transferred
            .lock()
            .map(|transferred| transferred.get(path) == Some(&fingerprint))
            .unwrap_or(false)
    }

    /// Reacts to one settled local change. Returns `None` when the change
    /// needs no transfer.
    pub async fn handle_local_event(&self, event: LocalEvent) -> Option<TaskOutcome> {
        let target = &self.inner.target;
        if !target.mode.allows_upload() || is_hidden(&event.path) {
            return None;
        }
        let local = match self.inner.mapper.local_for_relative(&event.path) {
            Ok(local) => local,
            Err(err) => {
                tracing::warn!(target_id = %target.id, path = %event.path, error = %err, "ignoring watch event");
                return None;
            }
        };

        let direction = match event.kind {
            ChangeKind::Created | ChangeKind::Modified => {
                let fingerprint = local_fingerprint(&local).await?;
                if self.was_transferred_as(&event.path, fingerprint) {
                    tracing::debug!(target_id = %target.id, path = %event.path, "unchanged since last transfer");
                    return None;
                }
                Direction::Upload
            }
            ChangeKind::Deleted => {
                if !target.propagate_deletes {
                    return None;
                }
                if tokio::fs::try_exists(&local).await.unwrap_or(false) {
                    return None;
                }
                Direction::Delete
            }
        };

        let task = self.task(direction, &event.path, TaskOrigin::Watch, None).ok()?;
        Some(self.run_task(task).await)
    }

    /// Waits for a running cycle and all borrowed connections, then closes
    /// the pool. Later cycles and watch events fail fast.
    pub async fn shutdown(&self) {
        let _guard = self.inner.cycle_lock.acquire().await;
        self.inner.cancel.cancel();
        self.inner.pool.shutdown().await;
        tracing::debug!(target_id = %self.id(), "engine shut down");
    }
}

async fn local_fingerprint(path: &Path) -> Option<Fingerprint> {
    let metadata = tokio::fs::metadata(path).await.ok()?;
    if !metadata.is_file() {
        return None;
    }
    Some(Fingerprint {
        size: metadata.len(),
        modified: OffsetDateTime::from(metadata.modified().ok()?),
    })
}

async fn stat_local(relative: &str, path: &Path) -> Option<FileRecord> {
    let fingerprint = local_fingerprint(path).await?;
    Some(FileRecord {
        path: relative.to_string(),
        size: fingerprint.size,
        modified: fingerprint.modified,
    })
}

/// Regular, non-hidden files below the local root. Symlinks are not
/// followed. A missing or unreadable root fails the scan so that an
/// unmounted share never reads as an empty tree.
async fn walk_local(mapper: &PathMapper) -> Result<HashMap<String, FileRecord>, EngineError> {
    let mapper = mapper.clone();
    let root = mapper.local_root().to_path_buf();
    tokio::task::spawn_blocking(move || scan_local_tree(&mapper))
        .await
        .map_err(|err| EngineError::LocalScan {
            path: root,
            source: io::Error::other(err),
        })?
}

fn scan_local_tree(mapper: &PathMapper) -> Result<HashMap<String, FileRecord>, EngineError> {
    let root = mapper.local_root();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0 || !entry.file_name().to_string_lossy().starts_with('.')
        });

    let mut records = HashMap::new();
    for entry in walker {
        let entry = match entry {
            Ok(entry) if entry.depth() == 0 && !entry.file_type().is_dir() => {
                return Err(EngineError::LocalScan {
                    path: root.to_path_buf(),
                    source: io::Error::new(
                        io::ErrorKind::NotADirectory,
                        "local root is not a directory",
                    ),
                });
            }
            Ok(entry) => entry,
            Err(err) if err.depth() == 0 => {
                return Err(EngineError::LocalScan {
                    path: root.to_path_buf(),
                    source: err.into(),
                });
            }
            Err(err) => {
                tracing::warn!(path = ?err.path(), error = %err, "skipping unreadable local entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(err) => {
                tracing::warn!(path = %entry.path().display(), error = %err, "skipping local file");
                continue;
            }
        };
        let Ok(modified) = metadata.modified() else {
            continue;
        };
        let relative = mapper.relative_of_local(entry.path())?;
        records.insert(
            relative.clone(),
            FileRecord {
                path: relative,
                size: metadata.len(),
                modified: OffsetDateTime::from(modified),
            },
        );
    }
    Ok(records)
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
