use std::collections::BTreeMap;

use thiserror::Error;
use zbus::{interface, object_server::SignalEmitter};

use crate::sync::engine::{EngineError, SyncEngine};

pub const DBUS_NAME: &str = "org.ftpsync.Sync1";
pub const DBUS_INTERFACE: &str = "org.ftpsync.Sync1";
pub const DBUS_OBJECT_PATH: &str = "/org/ftpsync/Sync1";

pub const DBUS_ERROR_NOT_FOUND: &str = "org.ftpsync.Sync1.Error.NotFound";
pub const DBUS_ERROR_FAILED: &str = "org.ftpsync.Sync1.Error.Failed";

#[derive(Debug, Error)]
pub enum DbusServiceError {
    #[error("unknown target: {0}")]
    NotFound(String),
    #[error("operation failed: {0}")]
    Failed(String),
}

pub fn dbus_error_name(err: &DbusServiceError) -> &'static str {
    match err {
        DbusServiceError::NotFound(_) => DBUS_ERROR_NOT_FOUND,
        DbusServiceError::Failed(_) => DBUS_ERROR_FAILED,
    }
}

fn map_to_fdo(err: DbusServiceError) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(format!("{}: {}", dbus_error_name(&err), err))
}

fn map_engine_error(err: EngineError) -> zbus::fdo::Error {
    map_to_fdo(DbusServiceError::Failed(err.to_string()))
}

fn to_u32(value: usize) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

#[derive(Default)]
pub struct SyncDbusService {
    engines: BTreeMap<String, SyncEngine>,
}

impl SyncDbusService {
    pub fn new(engines: impl IntoIterator<Item = SyncEngine>) -> Self {
        Self {
            engines: engines
                .into_iter()
                .map(|engine| (engine.id().to_string(), engine))
                .collect(),
        }
    }

    fn engine(&self, id: &str) -> Result<&SyncEngine, DbusServiceError> {
        self.engines
            .get(id)
            .ok_or_else(|| DbusServiceError::NotFound(id.to_string()))
    }
}

#[interface(name = "org.ftpsync.Sync1")]
impl SyncDbusService {
    async fn list_targets(&self) -> Vec<String> {
        self.engines.keys().cloned().collect()
    }

    /// Runs a full cycle now, waiting behind one that is already running.
    async fn sync_now(&self, id: &str) -> zbus::fdo::Result<(u32, u32, u32)> {
        let engine = self.engine(id).map_err(map_to_fdo)?;
        tracing::info!(target_id = %id, "sync requested over D-Bus");
        let summary = engine.sync_now().await.map_err(map_engine_error)?;
        Ok((
            to_u32(summary.planned),
            to_u32(summary.succeeded),
            to_u32(summary.failed),
        ))
    }

    async fn get_status(&self, id: &str) -> zbus::fdo::Result<String> {
        let engine = self.engine(id).map_err(map_to_fdo)?;
        Ok(engine.status().to_string())
    }

    #[zbus(signal)]
    pub async fn cycle_finished(
        ctxt: &SignalEmitter<'_>,
        id: &str,
        succeeded: u32,
        failed: u32,
    ) -> zbus::Result<()>;
}
