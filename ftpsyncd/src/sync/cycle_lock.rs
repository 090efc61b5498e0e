use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Per-target cycle exclusivity.
///
/// Timer ticks use [`CycleLock::try_acquire`] and are dropped while a cycle
/// runs; explicit requests use [`CycleLock::acquire`] and queue in FIFO order.
#[derive(Debug, Clone, Default)]
pub struct CycleLock {
    inner: Arc<Mutex<()>>,
}

#[derive(Debug)]
pub struct CycleGuard {
    _guard: OwnedMutexGuard<()>,
}

impl CycleLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self) -> Option<CycleGuard> {
        Arc::clone(&self.inner)
            .try_lock_owned()
            .ok()
            .map(|guard| CycleGuard { _guard: guard })
    }

    pub async fn acquire(&self) -> CycleGuard {
        CycleGuard {
            _guard: Arc::clone(&self.inner).lock_owned().await,
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}
