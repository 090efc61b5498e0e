use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use ftpsync_core::{FsConnector, FtpConfig, FtpConnector, RemoteConnector};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_PARALLELISM: usize = 3;
const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;
const DEFAULT_SYNC_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("target id is empty")]
    EmptyId,
    #[error("target {id}: local root must be an absolute path, got {path}")]
    RelativeLocalRoot { id: String, path: String },
    #[error("target {id}: remote root must start with '/', got {path}")]
    InvalidRemoteRoot { id: String, path: String },
    #[error("target {id}: {field} must be at least {min}")]
    TooSmall {
        id: String,
        field: &'static str,
        min: u64,
    },
    #[error("target {id}: host is required for scheme {scheme}")]
    MissingHost { id: String, scheme: String },
    #[error("target {id}: unsupported scheme {scheme}")]
    UnsupportedScheme { id: String, scheme: String },
    #[error("target {id}: cannot set up client: {message}")]
    Connector { id: String, message: String },
    #[error("duplicate target id: {0}")]
    DuplicateId(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    UploadOnly,
    DownloadOnly,
    Bidirectional,
}

impl SyncMode {
    pub fn allows_upload(self) -> bool {
        matches!(self, SyncMode::UploadOnly | SyncMode::Bidirectional)
    }

    pub fn allows_download(self) -> bool {
        matches!(self, SyncMode::DownloadOnly | SyncMode::Bidirectional)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SyncMode::UploadOnly => "upload_only",
            SyncMode::DownloadOnly => "download_only",
            SyncMode::Bidirectional => "bidirectional",
        }
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub scheme: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub secure: bool,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("scheme", &self.scheme)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("secure", &self.secure)
            .finish()
    }
}

impl Endpoint {
    pub fn file() -> Self {
        Self {
            scheme: "file".to_string(),
            host: String::new(),
            port: 0,
            username: String::new(),
            password: String::new(),
            secure: false,
        }
    }

    fn is_local(&self) -> bool {
        self.scheme == "file"
    }
}

/// Serialized shape of one target as kept by the configuration store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub id: String,
    pub endpoint: Endpoint,
    pub local_root: PathBuf,
    pub remote_root: String,
    pub mode: SyncMode,
    #[serde(default)]
    pub propagate_deletes: bool,
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
}

fn default_parallelism() -> usize {
    DEFAULT_PARALLELISM
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_sync_interval_secs() -> u64 {
    DEFAULT_SYNC_INTERVAL_SECS
}

/// A validated, read-only synchronization relationship.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTarget {
    pub id: String,
    pub endpoint: Endpoint,
    pub local_root: PathBuf,
    pub remote_root: String,
    pub mode: SyncMode,
    pub propagate_deletes: bool,
    pub parallelism: usize,
    pub buffer_size: usize,
    pub sync_interval: Duration,
}

impl TargetConfig {
    pub fn validate(&self) -> Result<SyncTarget, ConfigError> {
        let id = self.id.trim();
        if id.is_empty() {
            return Err(ConfigError::EmptyId);
        }
        let id = id.to_string();
        if !self.local_root.is_absolute() {
            return Err(ConfigError::RelativeLocalRoot {
                id,
                path: self.local_root.display().to_string(),
            });
        }
        let remote_root = normalize_remote_root(&self.remote_root).ok_or_else(|| {
            ConfigError::InvalidRemoteRoot {
                id: id.clone(),
                path: self.remote_root.clone(),
            }
        })?;
        if self.parallelism < 1 {
            return Err(ConfigError::TooSmall {
                id,
                field: "parallelism",
                min: 1,
            });
        }
        if self.buffer_size < 1 {
            return Err(ConfigError::TooSmall {
                id,
                field: "buffer_size",
                min: 1,
            });
        }
        if self.sync_interval_secs < 1 {
            return Err(ConfigError::TooSmall {
                id,
                field: "sync_interval_secs",
                min: 1,
            });
        }
        if !self.endpoint.is_local() && self.endpoint.host.trim().is_empty() {
            return Err(ConfigError::MissingHost {
                id,
                scheme: self.endpoint.scheme.clone(),
            });
        }

        Ok(SyncTarget {
            id,
            endpoint: self.endpoint.clone(),
            local_root: self.local_root.clone(),
            remote_root,
            mode: self.mode,
            propagate_deletes: self.propagate_deletes,
            parallelism: self.parallelism,
            buffer_size: self.buffer_size,
            sync_interval: Duration::from_secs(self.sync_interval_secs),
        })
    }
}

/// Validates a batch of targets independently. Invalid entries do not affect
/// the others; duplicate ids keep the first occurrence.
pub fn validate_all(configs: &[TargetConfig]) -> (Vec<SyncTarget>, Vec<ConfigError>) {
    let mut targets: Vec<SyncTarget> = Vec::with_capacity(configs.len());
    let mut errors = Vec::new();
    for config in configs {
        match config.validate() {
            Ok(target) if targets.iter().any(|t| t.id == target.id) => {
                errors.push(ConfigError::DuplicateId(target.id));
            }
            Ok(target) => targets.push(target),
            Err(err) => errors.push(err),
        }
    }
    (targets, errors)
}

fn normalize_remote_root(value: &str) -> Option<String> {
    let value = value.trim();
    if !value.starts_with('/') {
        return None;
    }
    if value.split('/').any(|part| part == "..") {
        return None;
    }
    let trimmed = value.trim_end_matches('/');
    Some(if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    })
}

/// Maps an endpoint to the protocol client that serves it.
pub trait ConnectorRegistry: Send + Sync {
    fn connector_for(&self, target: &SyncTarget)
    -> Result<Arc<dyn RemoteConnector>, ConfigError>;
}

/// Registry with the protocol clients linked into this binary.
///
/// `file` endpoints serve `remote_root` straight from the local filesystem,
/// so the remote tree is rooted at `/` of the host. `ftps` always negotiates
/// explicit TLS; `ftp` does when the endpoint sets `secure`.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinConnectors;

impl ConnectorRegistry for BuiltinConnectors {
    fn connector_for(
        &self,
        target: &SyncTarget,
    ) -> Result<Arc<dyn RemoteConnector>, ConfigError> {
        match target.endpoint.scheme.as_str() {
            "file" => Ok(Arc::new(FsConnector::new(Path::new("/")))),
            "ftp" | "ftps" => {
                let endpoint = &target.endpoint;
                let mut config = FtpConfig::new(endpoint.host.trim());
                if endpoint.port != 0 {
                    config.port = endpoint.port;
                }
                if !endpoint.username.is_empty() {
                    config.username = endpoint.username.clone();
                    config.password = endpoint.password.clone();
                }
                config.secure = endpoint.scheme == "ftps" || endpoint.secure;
                let connector = FtpConnector::new(config).map_err(|err| ConfigError::Connector {
                    id: target.id.clone(),
                    message: err.to_string(),
                })?;
                Ok(Arc::new(connector))
            }
            other => Err(ConfigError::UnsupportedScheme {
                id: target.id.clone(),
                scheme: other.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TargetConfig {
        TargetConfig {
            id: "docs".into(),
            endpoint: Endpoint::file(),
            local_root: PathBuf::from("/home/user/Docs"),
            remote_root: "/backup/docs/".into(),
            mode: SyncMode::Bidirectional,
            propagate_deletes: false,
            parallelism: 3,
            buffer_size: 4096,
            sync_interval_secs: 30,
        }
    }

    #[test]
    fn validate_normalizes_remote_root() {
        let target = config().validate().unwrap();
        assert_eq!(target.remote_root, "/backup/docs");
        assert_eq!(target.sync_interval, Duration::from_secs(30));

        let mut root = config();
        root.remote_root = "///".into();
        assert_eq!(root.validate().unwrap().remote_root, "/");
    }

    #[test]
    fn validate_rejects_bad_fields() {
        let mut relative = config();
        relative.local_root = PathBuf::from("Docs");
        assert!(matches!(
            relative.validate(),
            Err(ConfigError::RelativeLocalRoot { .. })
        ));

        let mut remote = config();
        remote.remote_root = "backup".into();
        assert!(matches!(
            remote.validate(),
            Err(ConfigError::InvalidRemoteRoot { .. })
        ));

        let mut zero = config();
        zero.parallelism = 0;
        assert!(matches!(
            zero.validate(),
            Err(ConfigError::TooSmall {
                field: "parallelism",
                ..
            })
        ));

        let mut ftp = config();
        ftp.endpoint.scheme = "ftp".into();
        assert!(matches!(ftp.validate(), Err(ConfigError::MissingHost { .. })));
    }

    #[test]
    fn validate_all_isolates_failures() {
        let mut broken = config();
        broken.id = "broken".into();
        broken.buffer_size = 0;
        let dup = config();

        let (targets, errors) = validate_all(&[config(), broken, dup]);
        assert_eq!(targets.len(), 1);
        assert_eq!(errors.len(), 2);
        assert!(errors.contains(&ConfigError::DuplicateId("docs".into())));
    }

    #[test]
    fn deserializes_with_defaults() {
        let json = serde_json::json!({
            "id": "photos",
            "endpoint": { "scheme": "file" },
            "local_root": "/home/user/Photos",
            "remote_root": "/mnt/nas/photos",
            "mode": "upload_only"
        });
        let config: TargetConfig = serde_json::from_value(json).unwrap();
        assert_eq!(config.parallelism, DEFAULT_PARALLELISM);
        assert_eq!(config.buffer_size, DEFAULT_BUFFER_SIZE);
        assert!(!config.propagate_deletes);
        assert_eq!(config.mode, SyncMode::UploadOnly);
    }

    #[test]
    fn builtin_registry_rejects_unknown_scheme() {
        let mut sftp = config();
        sftp.endpoint.scheme = "sftp".into();
        sftp.endpoint.host = "ftp.example.org".into();
        let target = sftp.validate().unwrap();
        assert!(matches!(
            BuiltinConnectors.connector_for(&target),
            Err(ConfigError::UnsupportedScheme { .. })
        ));
    }

    #[test]
    fn builtin_registry_builds_ftp_connectors() {
        let mut ftp = config();
        ftp.endpoint.scheme = "ftp".into();
        ftp.endpoint.host = "ftp.example.org".into();
        let connector = BuiltinConnectors
            .connector_for(&ftp.validate().unwrap())
            .unwrap();
        assert_eq!(connector.describe(), "ftp://anonymous@ftp.example.org:21");

        let mut ftps = config();
        ftps.endpoint.scheme = "ftps".into();
        ftps.endpoint.host = "nas.local".into();
        ftps.endpoint.port = 2121;
        ftps.endpoint.username = "backup".into();
        ftps.endpoint.password = "hunter2".into();
        let connector = BuiltinConnectors
            .connector_for(&ftps.validate().unwrap())
            .unwrap();
        assert_eq!(connector.describe(), "ftps://backup@nas.local:2121");
    }

    #[test]
    fn endpoint_debug_redacts_password() {
        let mut endpoint = Endpoint::file();
        endpoint.password = "hunter2".into();
        assert!(!format!("{endpoint:?}").contains("hunter2"));
    }
}
