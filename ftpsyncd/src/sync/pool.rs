use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use ftpsync_core::RemoteConnector;
use futures_util::future::join_all;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use super::backoff::Backoff;
use super::paths::PathMapper;
use super::transport::{Transport, TransportError};

const CONNECT_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("acquire cancelled")]
    Cancelled,
    #[error("connection pool is closed")]
    Closed,
    #[error("could not open a connection: {0}")]
    Connect(#[source] TransportError),
}

struct PoolInner {
    connector: Arc<dyn RemoteConnector>,
    mapper: PathMapper,
    buffer_size: usize,
    parallelism: usize,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Transport>>,
    live: AtomicUsize,
    backoff: Backoff,
}

impl PoolInner {
    fn idle(&self) -> MutexGuard<'_, Vec<Transport>> {
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn open(&self) -> Result<Transport, TransportError> {
        self.backoff
            .retry(CONNECT_ATTEMPTS, move |attempt| async move {
                let mut transport = Transport::new(
                    self.connector.session(),
                    self.mapper.clone(),
                    self.buffer_size,
                );
                match transport.connect().await {
                    Ok(()) => Ok(transport),
                    Err(err) => {
                        tracing::debug!(
                            endpoint = %self.connector.describe(),
                            attempt,
                            error = %err,
                            "connect attempt failed"
                        );
                        Err(err)
                    }
                }
            })
            .await
    }
}

/// A fixed-size set of transports for one target.
///
/// At most `parallelism` transports exist at once; each is used by one task
/// at a time through a [`PooledTransport`] guard.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(
        connector: Arc<dyn RemoteConnector>,
        mapper: PathMapper,
        parallelism: usize,
        buffer_size: usize,
    ) -> Self {
        let parallelism = parallelism.max(1);
        Self {
            inner: Arc::new(PoolInner {
                connector,
                mapper,
                buffer_size,
                parallelism,
                permits: Arc::new(Semaphore::new(parallelism)),
                idle: Mutex::new(Vec::with_capacity(parallelism)),
                live: AtomicUsize::new(0),
                backoff: Backoff::new(Duration::from_millis(200), Duration::from_secs(2), true),
            }),
        }
    }

    pub fn parallelism(&self) -> usize {
        self.inner.parallelism
    }

    pub fn live_count(&self) -> usize {
        self.inner.live.load(Ordering::SeqCst)
    }

    pub fn idle_count(&self) -> usize {
        self.inner.idle().len()
    }

    /// Waits for a free slot, then hands out an idle transport or opens a new one.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<PooledTransport, PoolError> {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PoolError::Cancelled),
            permit = self.inner.permits.clone().acquire_owned() => {
                permit.map_err(|_| PoolError::Closed)?
            }
        };

        let reused = self.inner.idle().pop();
        let transport = match reused {
            Some(transport) => transport,
            None => {
                let opened = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(PoolError::Cancelled),
                    opened = self.inner.open() => opened,
                };
                let transport = opened.map_err(PoolError::Connect)?;
                self.inner.live.fetch_add(1, Ordering::SeqCst);
                tracing::debug!(
                    endpoint = %self.inner.connector.describe(),
                    live = self.live_count(),
                    "opened pooled connection"
                );
                transport
            }
        };

        Ok(PooledTransport {
            transport: Some(transport),
            pool: Arc::clone(&self.inner),
            broken: false,
            _permit: permit,
        })
    }

    /// Returns a transport to the idle set. Equivalent to dropping the guard.
    pub fn release(&self, transport: PooledTransport) {
        drop(transport);
    }

    /// Opens connections up to the pool size ahead of a burst of transfers.
    pub async fn prewarm(&self) -> usize {
        let cancel = CancellationToken::new();
        let attempts = (0..self.inner.parallelism).map(|_| self.acquire(&cancel));
        let mut held = Vec::new();
        for result in join_all(attempts).await {
            match result {
                Ok(guard) => held.push(guard),
                Err(err) => tracing::warn!(error = %err, "pre-warming connection failed"),
            }
        }
        held.len()
    }

    /// Disconnects every idle transport. Busy ones are unaffected.
    pub async fn close_all(&self) {
        let drained: Vec<Transport> = std::mem::take(&mut *self.inner.idle());
        if drained.is_empty() {
            return;
        }
        self.inner.live.fetch_sub(drained.len(), Ordering::SeqCst);
        let closed = drained.len();
        for mut transport in drained {
            transport.disconnect().await;
        }
        tracing::debug!(closed, "closed idle pooled connections");
    }

    /// Waits until every borrowed transport is returned, closes them all and
    /// refuses further acquires.
    pub async fn shutdown(&self) {
        let all = u32::try_from(self.inner.parallelism).unwrap_or(u32::MAX);
        let held = self.inner.permits.acquire_many(all).await;
        self.close_all().await;
        self.inner.permits.close();
        drop(held);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.permits.is_closed()
    }
}

/// Exclusive use of one pooled transport.
pub struct PooledTransport {
    transport: Option<Transport>,
    pool: Arc<PoolInner>,
    broken: bool,
    _permit: OwnedSemaphorePermit,
}

impl PooledTransport {
    /// Discard the transport instead of returning it to the idle set.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl Deref for PooledTransport {
    type Target = Transport;

    fn deref(&self) -> &Transport {
        self.transport.as_ref().expect("transport is present until drop")
    }
}

impl DerefMut for PooledTransport {
    fn deref_mut(&mut self) -> &mut Transport {
        self.transport.as_mut().expect("transport is present until drop")
    }
}

impl Drop for PooledTransport {
    fn drop(&mut self) {
        let Some(transport) = self.transport.take() else {
            return;
        };
        if self.broken || !transport.is_connected() || self.pool.permits.is_closed() {
            self.pool.live.fetch_sub(1, Ordering::SeqCst);
            tracing::debug!("discarding pooled connection");
            return;
        }
        self.pool.idle().push(transport);
    }
}
