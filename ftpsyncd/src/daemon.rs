use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::future::join_all;
use serde::Deserialize;
use tokio::sync::broadcast;
use zbus::connection::Builder as ConnectionBuilder;
use zbus::object_server::SignalEmitter;

use crate::dbus_api::{DBUS_NAME, DBUS_OBJECT_PATH, SyncDbusService};
use crate::sync::engine::{CycleSummary, EngineOptions, SyncEngine};
use crate::sync::runtime::TargetRuntime;
use crate::sync::stats::{SqliteStatSink, StatSink};
use crate::sync::target::{
    BuiltinConnectors, ConfigError, ConnectorRegistry, SyncTarget, TargetConfig, validate_all,
};

const DEFAULT_TOLERANCE_MS: u64 = 2_000;
const DEFAULT_DEBOUNCE_MS: u64 = 2_000;
const DEFAULT_IDLE_CLOSE_SECS: u64 = 300;

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub targets_file: PathBuf,
    pub stats_db: PathBuf,
    pub enable_watcher: bool,
    pub enable_dbus: bool,
    pub engine_options: EngineOptions,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let targets_file = std::env::var("FTPSYNC_TARGETS_FILE")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(default_targets_file);
        let stats_db = std::env::var("FTPSYNC_STATS_DB")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(default_stats_db);
        let engine_options = EngineOptions {
            tolerance: Duration::from_millis(read_u64_env(
                "FTPSYNC_TOLERANCE_MS",
                DEFAULT_TOLERANCE_MS,
            )),
            debounce_window: Duration::from_millis(read_u64_env(
                "FTPSYNC_DEBOUNCE_MS",
                DEFAULT_DEBOUNCE_MS,
            )),
            idle_close_threshold: Duration::from_secs(read_u64_env(
                "FTPSYNC_IDLE_CLOSE_SECS",
                DEFAULT_IDLE_CLOSE_SECS,
            )),
        };

        Ok(Self {
            targets_file,
            stats_db,
            enable_watcher: read_bool_env("FTPSYNC_ENABLE_WATCHER", true),
            enable_dbus: read_bool_env("FTPSYNC_ENABLE_DBUS", true),
            engine_options,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct TargetsFile {
    #[serde(default)]
    targets: Vec<TargetConfig>,
}

/// Reads target definitions and validates them. Invalid targets come back
/// as errors next to the valid ones.
pub async fn check_config(
    config: &DaemonConfig,
) -> anyhow::Result<(Vec<SyncTarget>, Vec<ConfigError>)> {
    let configs = load_targets(&config.targets_file).await?;
    Ok(validate_all(&configs))
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    engines: Vec<SyncEngine>,
    stats: Arc<SqliteStatSink>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        let (targets, errors) = check_config(&config).await?;
        for err in &errors {
            tracing::warn!(error = %err, "skipping invalid target");
        }
        let stats = Arc::new(
            SqliteStatSink::open(&config.stats_db)
                .await
                .with_context(|| format!("failed to open stats store at {:?}", config.stats_db))?,
        );
        let engines = build_engines(
            targets,
            &BuiltinConnectors,
            stats.clone(),
            config.engine_options,
        )
        .await;
        if engines.is_empty() {
            tracing::warn!(
                targets_file = %config.targets_file.display(),
                "no usable sync targets configured"
            );
        }

        Ok(Self {
            config,
            engines,
            stats,
        })
    }

    pub fn engines(&self) -> &[SyncEngine] {
        &self.engines
    }

    pub async fn run(self) -> anyhow::Result<()> {
        tracing::info!(
            targets = self.engines.len(),
            watcher = self.config.enable_watcher,
            dbus = self.config.enable_dbus,
            "ftpsyncd started"
        );

        let runtimes: Vec<TargetRuntime> = self
            .engines
            .iter()
            .map(|engine| TargetRuntime::start(engine.clone(), self.config.enable_watcher))
            .collect();

        let dbus_connection = if self.config.enable_dbus {
            match start_dbus(&self.engines).await {
                Ok(connection) => Some(connection),
                Err(err) => {
                    tracing::warn!(error = %format!("{err:#}"), "D-Bus control surface unavailable");
                    None
                }
            }
        } else {
            None
        };

        let mut signal_handles = Vec::new();
        if let Some(connection) = &dbus_connection {
            let emitter = SignalEmitter::new(connection, DBUS_OBJECT_PATH)
                .context("failed to create D-Bus signal emitter")?
                .into_owned();
            for engine in &self.engines {
                signal_handles.push(tokio::spawn(forward_cycle_signals(
                    emitter.clone(),
                    engine.subscribe(),
                )));
            }
        }

        tokio::signal::ctrl_c()
            .await
            .context("failed waiting for shutdown signal")?;
        tracing::info!("shutdown requested; waiting for in-flight transfers");

        for handle in signal_handles {
            handle.abort();
        }
        join_all(runtimes.into_iter().map(TargetRuntime::shutdown)).await;
        drop(dbus_connection);
        self.flush_stats().await;
        tracing::info!("ftpsyncd stopped");
        Ok(())
    }

    /// One explicit cycle per target, then a graceful stop.
    pub async fn run_once(self) -> anyhow::Result<Vec<CycleSummary>> {
        let mut summaries = Vec::with_capacity(self.engines.len());
        for engine in &self.engines {
            match engine.sync_now().await {
                Ok(summary) => summaries.push(summary),
                Err(err) => {
                    tracing::warn!(target_id = %engine.id(), error = %err, "sync cycle failed");
                }
            }
        }
        join_all(self.engines.iter().map(SyncEngine::shutdown)).await;
        self.flush_stats().await;
        Ok(summaries)
    }

    async fn flush_stats(&self) {
        if let Err(err) = self.stats.flush().await {
            tracing::warn!(error = %err, "failed to flush transfer stats");
        }
    }
}

async fn build_engines(
    targets: Vec<SyncTarget>,
    registry: &dyn ConnectorRegistry,
    stats: Arc<dyn StatSink>,
    options: EngineOptions,
) -> Vec<SyncEngine> {
    let mut engines = Vec::with_capacity(targets.len());
    for target in targets {
        if let Err(err) = tokio::fs::create_dir_all(&target.local_root).await {
            tracing::warn!(
                target_id = %target.id,
                path = %target.local_root.display(),
                error = %err,
                "failed to create local root; skipping target"
            );
            continue;
        }
        let connector = match registry.connector_for(&target) {
            Ok(connector) => connector,
            Err(err) => {
                tracing::warn!(target_id = %target.id, error = %err, "skipping target");
                continue;
            }
        };
        tracing::debug!(
            target_id = %target.id,
            remote = %connector.describe(),
            remote_root = %target.remote_root,
            local_root = %target.local_root.display(),
            "target configured"
        );
        engines.push(SyncEngine::new(target, connector, stats.clone(), options));
    }
    engines
}

async fn start_dbus(engines: &[SyncEngine]) -> anyhow::Result<zbus::Connection> {
    ConnectionBuilder::session()?
        .name(DBUS_NAME)?
        .serve_at(DBUS_OBJECT_PATH, SyncDbusService::new(engines.iter().cloned()))?
        .build()
        .await
        .context("failed to start D-Bus object server")
}

async fn forward_cycle_signals(
    emitter: SignalEmitter<'static>,
    mut finished: broadcast::Receiver<CycleSummary>,
) {
    loop {
        match finished.recv().await {
            Ok(summary) => {
                let succeeded = u32::try_from(summary.succeeded).unwrap_or(u32::MAX);
                let failed = u32::try_from(summary.failed).unwrap_or(u32::MAX);
                if let Err(err) =
                    SyncDbusService::cycle_finished(&emitter, &summary.target_id, succeeded, failed)
                        .await
                {
                    tracing::debug!(error = %err, "failed to emit CycleFinished");
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::debug!(missed, "CycleFinished signals dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
