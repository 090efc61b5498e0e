use super::*;
use crate::sync::stats::MemoryStatSink;
use crate::sync::target::{Endpoint, SyncMode};
use crate::sync::transport::{local_modified, set_local_modified};
use ftpsync_core::MemoryRemote;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;
use time::macros::datetime;

const T0: OffsetDateTime = datetime!(2024-06-01 12:00 UTC);

struct Harness {
    dir: TempDir,
    remote: MemoryRemote,
    stats: Arc<MemoryStatSink>,
    engine: SyncEngine,
}

fn target(local_root: &Path, mode: SyncMode, propagate_deletes: bool) -> SyncTarget {
    SyncTarget {
        id: "docs".into(),
        endpoint: Endpoint::file(),
        local_root: local_root.to_path_buf(),
        remote_root: "/share".into(),
        mode,
        propagate_deletes,
        parallelism: 3,
        buffer_size: 4096,
        sync_interval: Duration::from_secs(60),
    }
}

fn harness(mode: SyncMode, propagate_deletes: bool) -> Harness {
    harness_with(mode, propagate_deletes, EngineOptions::default())
}

fn harness_with(mode: SyncMode, propagate_deletes: bool, options: EngineOptions) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let remote = MemoryRemote::new();
    remote.mkdir_all("/share");
    let stats = Arc::new(MemoryStatSink::new());
    let engine = SyncEngine::new(
        target(dir.path(), mode, propagate_deletes),
        Arc::new(remote.connector()),
        stats.clone(),
        options,
    );
    Harness {
        dir,
        remote,
        stats,
        engine,
    }
}

impl Harness {
    fn local(&self, relative: &str) -> PathBuf {
        self.dir.path().join(relative)
    }

    async fn write_local(&self, relative: &str, data: &[u8], modified: OffsetDateTime) {
        let path = self.local(relative);
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&path, data).await.unwrap();
        set_local_modified(&path, modified).await.unwrap();
    }
}

fn secs(n: i64) -> time::Duration {
    time::Duration::seconds(n)
}

#[tokio::test]
async fn uploads_local_only_file() {
    let h = harness(SyncMode::Bidirectional, false);
    h.write_local("a.txt", b"hello", T0).await;

    let summary = h.engine.sync_now().await.unwrap();

    assert_eq!(summary.planned, 1);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.bytes_uploaded, 5);
    let (data, modified) = h.remote.file("/share/a.txt").unwrap();
    assert_eq!(data.len(), 5);
    assert_eq!(modified, T0);
    assert_eq!(h.stats.totals("docs").uploaded_bytes, 5);
}

#[tokio::test]
async fn downloads_newer_remote_file() {
    let h = harness(SyncMode::Bidirectional, false);
    h.write_local("b.txt", b"old", T0).await;
    h.remote
        .put_file("/share/b.txt", b"remote!".to_vec(), T0 + secs(10));

    let summary = h.engine.sync_now().await.unwrap();

    assert_eq!(summary.planned, 1);
    assert_eq!(summary.bytes_downloaded, 7);
    assert_eq!(tokio::fs::read(h.local("b.txt")).await.unwrap(), b"remote!");
    assert_eq!(local_modified(&h.local("b.txt")).await.unwrap(), T0 + secs(10));
}

#[tokio::test]
async fn second_cycle_is_a_no_op() {
    let h = harness(SyncMode::Bidirectional, false);
    h.write_local("docs/a.txt", b"local", T0).await;
    h.remote
        .put_file("/share/photos/b.jpg", b"remote".to_vec(), T0 + secs(30));

    let first = h.engine.sync_now().await.unwrap();
    assert_eq!(first.planned, 2);
    assert_eq!(first.succeeded, 2);

    let second = h.engine.sync_now().await.unwrap();
    assert_eq!(second.planned, 0);
    assert_eq!(h.engine.plan_cycle().await.unwrap(), CyclePlan::default());
}

#[tokio::test]
async fn timestamps_within_tolerance_are_in_sync() {
    let h = harness(SyncMode::Bidirectional, false);
    h.write_local("a.txt", b"same", T0).await;
    h.remote
        .put_file("/share/a.txt", b"same".to_vec(), T0 + secs(1));

    assert!(h.engine.plan_cycle().await.unwrap().tasks.is_empty());
}

#[tokio::test]
async fn download_only_never_uploads() {
    let h = harness(SyncMode::DownloadOnly, true);
    h.write_local("local-only.txt", b"x", T0).await;
    h.write_local("newer-local.txt", b"new", T0 + secs(60)).await;
    h.remote
        .put_file("/share/newer-local.txt", b"old".to_vec(), T0);
    h.remote
        .put_file("/share/remote-only.txt", b"r".to_vec(), T0);

    let plan = h.engine.plan_cycle().await.unwrap();
    assert_eq!(plan.tasks.len(), 1);
    assert_eq!(plan.tasks[0].path, "remote-only.txt");
    assert_eq!(plan.tasks[0].direction, Direction::Download);

    h.engine.sync_now().await.unwrap();
    assert!(h.remote.file("/share/local-only.txt").is_none());
    assert_eq!(h.remote.file("/share/newer-local.txt").unwrap().0, b"old");
}

#[tokio::test]
async fn upload_only_deletes_remote_only_files_when_enabled() {
    let h = harness(SyncMode::UploadOnly, true);
    h.write_local("keep.txt", b"k", T0).await;
    h.remote.put_file("/share/keep.txt", b"k".to_vec(), T0);
    h.remote.put_file("/share/stale.txt", b"s".to_vec(), T0);

    let summary = h.engine.sync_now().await.unwrap();

    assert_eq!(summary.planned, 1);
    assert!(h.remote.file("/share/stale.txt").is_none());
    assert!(h.remote.file("/share/keep.txt").is_some());
    assert_eq!(h.stats.totals("docs").deletes, 1);
}

#[tokio::test]
async fn upload_only_keeps_remote_only_files_by_default() {
    let h = harness(SyncMode::UploadOnly, false);
    h.remote.put_file("/share/stale.txt", b"s".to_vec(), T0);

    let summary = h.engine.sync_now().await.unwrap();

    assert_eq!(summary.planned, 0);
    assert!(h.remote.file("/share/stale.txt").is_some());
}

#[tokio::test]
async fn hidden_files_are_ignored_on_both_sides() {
    let h = harness(SyncMode::Bidirectional, false);
    h.write_local(".secret", b"s", T0).await;
    h.write_local(".git/config", b"c", T0).await;
    h.remote.put_file("/share/.cache/x", b"x".to_vec(), T0);

    assert!(h.engine.plan_cycle().await.unwrap().tasks.is_empty());
}

#[tokio::test]
async fn missing_remote_root_is_treated_as_empty() {
    let dir = tempfile::tempdir().unwrap();
    let remote = MemoryRemote::new();
    tokio::fs::write(dir.path().join("a.txt"), b"a").await.unwrap();
    let engine = SyncEngine::new(
        target(dir.path(), SyncMode::Bidirectional, false),
        Arc::new(remote.connector()),
        Arc::new(MemoryStatSink::new()),
        EngineOptions::default(),
    );

    let summary = engine.sync_now().await.unwrap();

    assert!(!summary.remote_unavailable);
    assert_eq!(summary.succeeded, 1);
    assert!(remote.file("/share/a.txt").is_some());
}

#[tokio::test(start_paused = true)]
async fn unreachable_remote_plans_no_transfers() {
    let h = harness(SyncMode::Bidirectional, false);
    h.write_local("a.txt", b"a", T0).await;
    h.remote.fail_next_connects(3);

    let summary = h.engine.sync_now().await.unwrap();

    assert!(summary.remote_unavailable);
    assert_eq!(summary.planned, 0);
    assert!(h.remote.file_paths().is_empty());

    let retry = h.engine.sync_now().await.unwrap();
    assert!(!retry.remote_unavailable);
    assert_eq!(retry.succeeded, 1);
}

#[tokio::test]
async fn one_failing_file_does_not_abort_the_cycle() {
    let h = harness(SyncMode::Bidirectional, false);
    h.write_local("bad.txt", b"bad", T0).await;
    h.write_local("good.txt", b"good", T0).await;
    h.remote.fail_path("/share/bad.txt");

    let summary = h.engine.sync_now().await.unwrap();

    assert_eq!(summary.planned, 2);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 1);
    assert!(h.remote.file("/share/good.txt").is_some());

    h.remote.clear_failures();
    let retry = h.engine.sync_now().await.unwrap();
    assert_eq!(retry.planned, 1);
    assert_eq!(retry.succeeded, 1);
}

#[tokio::test(start_paused = true)]
async fn transfers_are_bounded_by_parallelism() {
    let h = harness(SyncMode::UploadOnly, false);
    for i in 0..10 {
        h.write_local(&format!("f{i}.txt"), b"data", T0).await;
    }
    h.remote.set_op_delay(Duration::from_millis(20));

    let summary = h.engine.sync_now().await.unwrap();

    assert_eq!(summary.planned, 10);
    assert_eq!(summary.succeeded, 10);
    assert!(h.remote.peak_concurrency() <= 3);
    assert_eq!(h.remote.file_paths().len(), 10);
    assert!(h.engine.pool().live_count() <= 3);
}

#[tokio::test(start_paused = true)]
async fn timer_tick_is_dropped_while_cycle_runs() {
    let h = harness(SyncMode::UploadOnly, false);
    h.write_local("a.txt", b"a", T0).await;
    h.remote.set_op_delay(Duration::from_millis(100));

    let running = tokio::spawn({
        let engine = h.engine.clone();
        async move { engine.sync_now().await }
    });
    while !h.engine.is_cycle_running() {
        tokio::task::yield_now().await;
    }

    assert_eq!(
        h.engine.run_cycle(CycleTrigger::Timer).await.unwrap(),
        CycleOutcome::Skipped
    );
    assert_eq!(h.engine.status(), "cycle_running");

    let explicit = h.engine.run_cycle(CycleTrigger::Explicit).await.unwrap();
    let first = running.await.unwrap().unwrap();
    assert_eq!(first.succeeded, 1);
    match explicit {
        CycleOutcome::Completed(summary) => assert_eq!(summary.planned, 0),
        CycleOutcome::Skipped => panic!("explicit trigger must wait"),
    }
    assert_eq!(h.engine.status(), "idle");
}

#[tokio::test]
async fn watch_event_uploads_changed_file() {
    let h = harness(SyncMode::Bidirectional, false);
    h.write_local("notes/a.txt", b"draft", T0).await;

    let outcome = h
        .engine
        .handle_local_event(LocalEvent::new("notes/a.txt", ChangeKind::Modified))
        .await
        .unwrap();

    assert!(outcome.succeeded());
    assert_eq!(outcome.task.origin, TaskOrigin::Watch);
    assert_eq!(h.remote.file("/share/notes/a.txt").unwrap().0, b"draft");

    let repeat = h
        .engine
        .handle_local_event(LocalEvent::new("notes/a.txt", ChangeKind::Modified))
        .await;
    assert!(repeat.is_none());
}

#[tokio::test]
async fn watch_event_after_download_is_not_echoed() {
    let h = harness(SyncMode::Bidirectional, false);
    h.remote.put_file("/share/b.txt", b"remote".to_vec(), T0);
    h.engine.sync_now().await.unwrap();

    let echoed = h
        .engine
        .handle_local_event(LocalEvent::new("b.txt", ChangeKind::Created))
        .await;
    assert!(echoed.is_none());
}

#[tokio::test]
async fn watch_events_are_ignored_in_download_only_mode() {
    let h = harness(SyncMode::DownloadOnly, true);
    h.write_local("a.txt", b"a", T0).await;

    let created = h
        .engine
        .handle_local_event(LocalEvent::new("a.txt", ChangeKind::Created))
        .await;
    let deleted = h
        .engine
        .handle_local_event(LocalEvent::new("gone.txt", ChangeKind::Deleted))
        .await;

    assert!(created.is_none());
    assert!(deleted.is_none());
    assert!(h.remote.file_paths().is_empty());
}

#[tokio::test]
async fn watch_delete_requires_propagation_flag() {
    let without = harness(SyncMode::Bidirectional, false);
    without
        .remote
        .put_file("/share/gone.txt", b"g".to_vec(), T0);
    let outcome = without
        .engine
        .handle_local_event(LocalEvent::new("gone.txt", ChangeKind::Deleted))
        .await;
    assert!(outcome.is_none());
    assert!(without.remote.file("/share/gone.txt").is_some());

    let with = harness(SyncMode::Bidirectional, true);
    with.remote.put_file("/share/gone.txt", b"g".to_vec(), T0);
    let outcome = with
        .engine
        .handle_local_event(LocalEvent::new("gone.txt", ChangeKind::Deleted))
        .await
        .unwrap();
    assert!(outcome.succeeded());
    assert!(with.remote.file("/share/gone.txt").is_none());
}

#[tokio::test]
async fn delete_event_for_recreated_file_is_ignored() {
    let h = harness(SyncMode::UploadOnly, true);
    h.write_local("back.txt", b"again", T0).await;
    h.remote.put_file("/share/back.txt", b"old".to_vec(), T0);

    let outcome = h
        .engine
        .handle_local_event(LocalEvent::new("back.txt", ChangeKind::Deleted))
        .await;

    assert!(outcome.is_none());
    assert!(h.remote.file("/share/back.txt").is_some());
}

#[tokio::test]
async fn watch_upload_racing_a_cycle_converges() {
    let h = harness(SyncMode::Bidirectional, false);
    h.write_local("race.txt", b"content", T0).await;
    h.write_local("other.txt", b"other", T0).await;

    let (cycle, watched) = tokio::join!(
        h.engine.sync_now(),
        h.engine
            .handle_local_event(LocalEvent::new("race.txt", ChangeKind::Created))
    );
    cycle.unwrap();
    let _ = watched;

    let settle = h.engine.sync_now().await.unwrap();
    assert_eq!(settle.planned, 0);
    let (data, modified) = h.remote.file("/share/race.txt").unwrap();
    assert_eq!(data, b"content");
    assert_eq!(modified, T0);
}

#[tokio::test]
async fn finished_cycles_are_broadcast() {
    let h = harness(SyncMode::Bidirectional, false);
    let mut finished = h.engine.subscribe();
    h.write_local("a.txt", b"a", T0).await;

    h.engine.sync_now().await.unwrap();

    let summary = finished.recv().await.unwrap();
    assert_eq!(summary.target_id, "docs");
    assert_eq!(summary.trigger, CycleTrigger::Explicit);
    assert_eq!(h.engine.last_summary(), Some(summary));
}

#[tokio::test]
async fn long_intervals_close_pooled_connections_after_cycle() {
    let options = EngineOptions {
        idle_close_threshold: Duration::from_secs(10),
        ..EngineOptions::default()
    };
    let closing = harness_with(SyncMode::Bidirectional, false, options);
    closing.engine.sync_now().await.unwrap();
    assert_eq!(closing.engine.pool().live_count(), 0);

    let keeping = harness(SyncMode::Bidirectional, false);
    keeping.engine.sync_now().await.unwrap();
    assert_eq!(keeping.engine.pool().live_count(), 1);
}

#[tokio::test]
async fn shutdown_closes_the_pool() {
    let h = harness(SyncMode::Bidirectional, false);
    h.engine.sync_now().await.unwrap();

    h.engine.shutdown().await;

    assert!(h.engine.pool().is_closed());
    assert!(matches!(
        h.engine.sync_now().await,
        Err(EngineError::Pool(_))
    ));
}

#[tokio::test]
async fn missing_local_root_fails_the_cycle_and_keeps_remote_files() {
    let dir = tempfile::tempdir().unwrap();
    let remote = MemoryRemote::new();
    remote.put_file("/share/a.txt", b"a".to_vec(), T0);
    remote.put_file("/share/sub/b.txt", b"b".to_vec(), T0);
    let engine = SyncEngine::new(
        target(&dir.path().join("mounted"), SyncMode::UploadOnly, true),
        Arc::new(remote.connector()),
        Arc::new(MemoryStatSink::new()),
        EngineOptions::default(),
    );

    let err = engine.sync_now().await.unwrap_err();

    assert!(matches!(err, EngineError::LocalScan { .. }));
    assert_eq!(
        remote.file_paths(),
        vec!["/share/a.txt".to_string(), "/share/sub/b.txt".to_string()]
    );
}

#[tokio::test]
async fn local_root_that_is_a_file_fails_the_scan() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("not-a-dir");
    std::fs::write(&file, b"x").unwrap();
    let remote = MemoryRemote::new();
    let engine = SyncEngine::new(
        target(&file, SyncMode::Bidirectional, false),
        Arc::new(remote.connector()),
        Arc::new(MemoryStatSink::new()),
        EngineOptions::default(),
    );

    assert!(matches!(
        engine.plan_cycle().await,
        Err(EngineError::LocalScan { .. })
    ));
}

#[cfg(unix)]
#[tokio::test]
async fn symlinked_directories_are_not_followed() {
    let h = harness(SyncMode::UploadOnly, false);
    let outside = tempfile::tempdir().unwrap();
    std::fs::write(outside.path().join("secret.txt"), b"s").unwrap();
    std::os::unix::fs::symlink(outside.path(), h.local("linked")).unwrap();
    h.write_local("real/a.txt", b"a", T0).await;
    h.write_local(".cache/skip.txt", b"c", T0).await;

    let plan = h.engine.plan_cycle().await.unwrap();

    let paths: Vec<&str> = plan.tasks.iter().map(|t| t.path.as_str()).collect();
    assert_eq!(paths, vec!["real/a.txt"]);
}

#[tokio::test]
async fn cycle_with_transfers_prewarms_the_pool() {
    let h = harness(SyncMode::UploadOnly, false);
    for i in 0..5 {
        h.write_local(&format!("f{i}.txt"), b"data", T0).await;
    }

    let summary = h.engine.sync_now().await.unwrap();

    assert_eq!(summary.succeeded, 5);
    assert_eq!(h.remote.connect_count(), 3);
    assert_eq!(h.engine.pool().live_count(), 3);
}

#[tokio::test]
async fn idle_cycle_opens_only_the_listing_connection() {
    let h = harness(SyncMode::UploadOnly, false);
    h.engine.sync_now().await.unwrap();
    assert_eq!(h.remote.connect_count(), 1);
}

#[derive(Default)]
struct FlushCountingSink {
    inner: MemoryStatSink,
    flushes: AtomicUsize,
}

impl StatSink for FlushCountingSink {
    fn record(&self, stat: TransferStat) {
        self.inner.record(stat);
    }

    fn flush(&self) -> futures_util::future::BoxFuture<'_, ()> {
        Box::pin(async {
            self.flushes.fetch_add(1, Ordering::SeqCst);
        })
    }
}

#[tokio::test]
async fn every_cycle_flushes_the_stat_sink() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
    let remote = MemoryRemote::new();
    let stats = Arc::new(FlushCountingSink::default());
    let engine = SyncEngine::new(
        target(dir.path(), SyncMode::UploadOnly, false),
        Arc::new(remote.connector()),
        stats.clone(),
        EngineOptions::default(),
    );

    engine.sync_now().await.unwrap();
    engine.sync_now().await.unwrap();

    assert_eq!(stats.flushes.load(Ordering::SeqCst), 2);
    assert_eq!(stats.inner.records().len(), 1);
}

#[tokio::test]
async fn fingerprints_of_vanished_paths_are_forgotten() {
    let h = harness(SyncMode::Bidirectional, false);
    h.remote
        .put_file("/share/a.txt", b"remote".to_vec(), T0);
    h.remote
        .put_file("/share/b.txt", b"remote".to_vec(), T0);
    h.engine.sync_now().await.unwrap();
    assert_eq!(h.engine.inner.transferred.lock().unwrap().len(), 2);

    std::fs::remove_file(h.local("a.txt")).unwrap();
    h.remote.remove_file("/share/a.txt");
    let summary = h.engine.sync_now().await.unwrap();

    assert_eq!(summary.planned, 0);
    let transferred = h.engine.inner.transferred.lock().unwrap();
    assert_eq!(transferred.len(), 1);
    assert!(transferred.contains_key("b.txt"));
}
