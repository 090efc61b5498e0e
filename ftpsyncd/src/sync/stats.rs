use std::path::Path;
use std::sync::Mutex;

use futures_util::future::BoxFuture;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool, migrate::Migrator};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("stats writer has stopped")]
    WriterStopped,
    #[error("unknown direction: {0}")]
    UnknownDirection(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Upload,
    Download,
    Delete,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Upload => "upload",
            Direction::Download => "download",
            Direction::Delete => "delete",
        }
    }

    pub fn parse(value: &str) -> Result<Self, StatsError> {
        match value {
            "upload" => Ok(Direction::Upload),
            "download" => Ok(Direction::Download),
            "delete" => Ok(Direction::Delete),
            other => Err(StatsError::UnknownDirection(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferStat {
    pub target_id: String,
    pub direction: Direction,
    pub bytes: u64,
    pub recorded_at: OffsetDateTime,
}

impl TransferStat {
    pub fn now(target_id: &str, direction: Direction, bytes: u64) -> Self {
        Self {
            target_id: target_id.to_string(),
            direction,
            bytes,
            recorded_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Append-only sink for transfer accounting. Recording never fails from the
/// caller's side.
pub trait StatSink: Send + Sync {
    fn record(&self, stat: TransferStat);

    /// Waits until everything recorded so far is persisted. Best effort.
    fn flush(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectionTotals {
    pub uploaded_bytes: u64,
    pub downloaded_bytes: u64,
    pub uploads: u64,
    pub downloads: u64,
    pub deletes: u64,
}

impl DirectionTotals {
    fn add(&mut self, direction: Direction, bytes: u64, count: u64) {
        match direction {
            Direction::Upload => {
                self.uploaded_bytes += bytes;
                self.uploads += count;
            }
            Direction::Download => {
                self.downloaded_bytes += bytes;
                self.downloads += count;
            }
            Direction::Delete => self.deletes += count,
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryStatSink {
    records: Mutex<Vec<TransferStat>>,
}

impl MemoryStatSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<TransferStat> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    pub fn totals(&self, target_id: &str) -> DirectionTotals {
        let mut totals = DirectionTotals::default();
        for stat in self.records().iter().filter(|s| s.target_id == target_id) {
            totals.add(stat.direction, stat.bytes, 1);
        }
        totals
    }
}

impl StatSink for MemoryStatSink {
    fn record(&self, stat: TransferStat) {
        if let Ok(mut records) = self.records.lock() {
            records.push(stat);
        }
    }
}

enum WriterMsg {
    Record(TransferStat),
    Flush(oneshot::Sender<()>),
}

/// SQLite-backed sink. Inserts run on a background task in arrival order.
pub struct SqliteStatSink {
    pool: SqlitePool,
    tx: mpsc::UnboundedSender<WriterMsg>,
}

impl SqliteStatSink {
    pub async fn open(path: &Path) -> Result<Self, StatsError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StatsError> {
        MIGRATOR.run(&pool).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(pool.clone(), rx));
        Ok(Self { pool, tx })
    }

    /// Resolves once every stat recorded before this call has been written.
    pub async fn flush(&self) -> Result<(), StatsError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(WriterMsg::Flush(done_tx))
            .map_err(|_| StatsError::WriterStopped)?;
        done_rx.await.map_err(|_| StatsError::WriterStopped)
    }

    pub async fn totals(&self, target_id: &str) -> Result<DirectionTotals, StatsError> {
        let rows = sqlx::query(
            "SELECT direction, COALESCE(SUM(bytes), 0) AS bytes, COUNT(*) AS transfers
             FROM transfer_stats
             WHERE target_id = ?1
             GROUP BY direction",
        )
        .bind(target_id)
        .fetch_all(&self.pool)
        .await?;

        let mut totals = DirectionTotals::default();
        for row in rows {
            let direction: String = row.try_get("direction")?;
            let bytes: i64 = row.try_get("bytes")?;
            let transfers: i64 = row.try_get("transfers")?;
            totals.add(
                Direction::parse(&direction)?,
                u64::try_from(bytes).unwrap_or(0),
                u64::try_from(transfers).unwrap_or(0),
            );
        }
        Ok(totals)
    }
}

impl StatSink for SqliteStatSink {
    fn record(&self, stat: TransferStat) {
        if self.tx.send(WriterMsg::Record(stat)).is_err() {
            tracing::warn!("stats writer has stopped; dropping transfer stat");
        }
    }

    fn flush(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Err(err) = SqliteStatSink::flush(self).await {
                tracing::warn!(error = %err, "flushing transfer stats failed");
            }
        })
    }
}

async fn write_loop(pool: SqlitePool, mut rx: mpsc::UnboundedReceiver<WriterMsg>) {
    while let Some(msg) = rx.recv().await {
        match msg {
            WriterMsg::Record(stat) => {
                if let Err(err) = insert_stat(&pool, &stat).await {
                    tracing::warn!(
                        target_id = %stat.target_id,
                        direction = stat.direction.as_str(),
                        error = %err,
                        "failed to persist transfer stat"
                    );
                }
            }
            WriterMsg::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

async fn insert_stat(pool: &SqlitePool, stat: &TransferStat) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO transfer_stats (target_id, direction, bytes, recorded_at)
         VALUES (?1, ?2, ?3, ?4)",
    )
    .bind(&stat.target_id)
    .bind(stat.direction.as_str())
    .bind(i64::try_from(stat.bytes).unwrap_or(i64::MAX))
    .bind(stat.recorded_at.unix_timestamp())
    .execute(pool)
    .await?;
    Ok(())
}
