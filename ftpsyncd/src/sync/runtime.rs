use notify::RecommendedWatcher;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::engine::{CycleOutcome, CycleTrigger, SyncEngine};
use super::local_watcher::{Debouncer, LocalEvent, start_notify_watcher};

/// The background tasks driving one target: the cycle timer and, optionally,
/// the local watch pipeline.
pub struct TargetRuntime {
    engine: SyncEngine,
    cancel: CancellationToken,
    tracker: TaskTracker,
    watcher: Option<RecommendedWatcher>,
}

impl TargetRuntime {
    pub fn start(engine: SyncEngine, watch: bool) -> Self {
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        tracker.spawn(timer_loop(engine.clone(), tracker.clone(), cancel.clone()));

        let watcher = if watch {
            match start_notify_watcher(&engine.target().local_root) {
                Ok((watcher, raw)) => {
                    let (settled_tx, settled_rx) = mpsc::unbounded_channel();
                    let debouncer = Debouncer::new(engine.options().debounce_window);
                    tracker.spawn(debouncer.run(raw, settled_tx, cancel.clone()));
                    tracker.spawn(watch_loop(
                        engine.clone(),
                        settled_rx,
                        tracker.clone(),
                        cancel.clone(),
                    ));
                    Some(watcher)
                }
                Err(err) => {
                    tracing::warn!(
                        target_id = %engine.id(),
                        error = %err,
                        "local watcher unavailable; relying on periodic cycles"
                    );
                    None
                }
            }
        } else {
            None
        };

        tracing::info!(
            target_id = %engine.id(),
            mode = engine.target().mode.as_str(),
            interval_secs = engine.target().sync_interval.as_secs(),
            watching = watcher.is_some(),
            "target started"
        );
        Self {
            engine,
            cancel,
            tracker,
            watcher,
        }
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    /// Stops new work, lets in-flight transfers and a running cycle finish,
    /// then closes the target's connections.
    pub async fn shutdown(mut self) {
        self.watcher.take();
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        self.engine.shutdown().await;
        tracing::info!(target_id = %self.engine.id(), "target stopped");
    }
}

async fn timer_loop(engine: SyncEngine, tracker: TaskTracker, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(engine.target().sync_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let engine = engine.clone();
                tracker.spawn(async move {
                    match engine.run_cycle(CycleTrigger::Timer).await {
                        Ok(CycleOutcome::Completed(_)) | Ok(CycleOutcome::Skipped) => {}
                        Err(err) => {
                            tracing::warn!(target_id = %engine.id(), error = %err, "sync cycle failed");
                        }
                    }
                });
            }
        }
    }
}

async fn watch_loop(
    engine: SyncEngine,
    mut settled: mpsc::UnboundedReceiver<LocalEvent>,
    tracker: TaskTracker,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = settled.recv() => {
                let Some(event) = event else { break };
                tracing::debug!(target_id = %engine.id(), path = %event.path, kind = ?event.kind, "local change");
                let engine = engine.clone();
                tracker.spawn(async move {
                    engine.handle_local_event(event).await;
                });
            }
        }
    }
}
