use std::time::Duration;

use time::OffsetDateTime;

use super::target::SyncMode;

pub const DEFAULT_TOLERANCE: Duration = Duration::from_secs(2);

/// A file seen on one side, keyed by its canonical relative path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub path: String,
    pub size: u64,
    pub modified: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvePolicy {
    pub mode: SyncMode,
    pub propagate_deletes: bool,
    pub tolerance: Duration,
}

impl ResolvePolicy {
    pub fn new(mode: SyncMode, propagate_deletes: bool) -> Self {
        Self {
            mode,
            propagate_deletes,
            tolerance: DEFAULT_TOLERANCE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    NoOp,
    Upload,
    Download,
    DeleteRemote,
}

/// Last-writer-wins decision for one path.
///
/// Without tombstones a missing side cannot be told apart from a deleted one,
/// so a one-sided file is re-created on the other side. The only exception is
/// `UploadOnly` with delete propagation, where the local tree is authoritative.
pub fn resolve(
    local: Option<&FileRecord>,
    remote: Option<&FileRecord>,
    policy: &ResolvePolicy,
) -> Action {
    let mode = policy.mode;
    match (local, remote) {
        (None, None) => Action::NoOp,
        (Some(_), None) => {
            if mode.allows_upload() {
                Action::Upload
            } else {
                Action::NoOp
            }
        }
        (None, Some(_)) => {
            if mode.allows_download() {
                Action::Download
            } else if mode == SyncMode::UploadOnly && policy.propagate_deletes {
                Action::DeleteRemote
            } else {
                Action::NoOp
            }
        }
        (Some(local), Some(remote)) => {
            let skew = local.modified - remote.modified;
            if skew.unsigned_abs() <= policy.tolerance {
                Action::NoOp
            } else if skew.is_positive() {
                if mode.allows_upload() {
                    Action::Upload
                } else {
                    Action::NoOp
                }
            } else if mode.allows_download() {
                Action::Download
            } else {
                Action::NoOp
            }
        }
    }
}
