use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("path is outside the sync root: {0}")]
    OutsideRoot(String),
    #[error("path contains unsupported component: {0}")]
    UnsupportedComponent(String),
}

/// Translates between absolute local paths, absolute remote paths and the
/// canonical relative form (`docs/a.txt`, forward slashes, no leading slash).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathMapper {
    local_root: PathBuf,
    remote_root: String,
}

impl PathMapper {
    pub fn new(local_root: impl Into<PathBuf>, remote_root: impl Into<String>) -> Self {
        let remote_root = remote_root.into();
        let trimmed = remote_root.trim_end_matches('/');
        Self {
            local_root: local_root.into(),
            remote_root: if trimmed.is_empty() {
                "/".to_string()
            } else {
                trimmed.to_string()
            },
        }
    }

    pub fn local_root(&self) -> &Path {
        &self.local_root
    }

    pub fn remote_root(&self) -> &str {
        &self.remote_root
    }

    pub fn relative_of_local(&self, local: &Path) -> Result<String, PathError> {
        let rest = local
            .strip_prefix(&self.local_root)
            .map_err(|_| PathError::OutsideRoot(local.display().to_string()))?;
        let mut parts = Vec::new();
        for component in rest.components() {
            match component {
                Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
                Component::CurDir => continue,
                Component::ParentDir | Component::Prefix(_) | Component::RootDir => {
                    return Err(PathError::UnsupportedComponent(local.display().to_string()));
                }
            }
        }
        Ok(parts.join("/"))
    }

    pub fn relative_of_remote(&self, remote: &str) -> Result<String, PathError> {
        let rest = if self.remote_root == "/" {
            remote.strip_prefix('/')
        } else {
            remote
                .strip_prefix(self.remote_root.as_str())
                .and_then(|rest| {
                    if rest.is_empty() {
                        Some(rest)
                    } else {
                        rest.strip_prefix('/')
                    }
                })
        }
        .ok_or_else(|| PathError::OutsideRoot(remote.to_string()))?;
        check_relative(rest)?;
        Ok(rest
            .split('/')
            .filter(|part| !part.is_empty() && *part != ".")
            .collect::<Vec<_>>()
            .join("/"))
    }

    pub fn local_for_relative(&self, relative: &str) -> Result<PathBuf, PathError> {
        check_relative(relative)?;
        let mut out = self.local_root.clone();
        for part in relative.split('/').filter(|part| !part.is_empty()) {
            out.push(part);
        }
        Ok(out)
    }

    pub fn remote_for_relative(&self, relative: &str) -> Result<String, PathError> {
        check_relative(relative)?;
        let relative = relative.trim_matches('/');
        Ok(ftpsync_core::join_remote(&self.remote_root, relative))
    }

    pub fn to_remote(&self, local: &Path) -> Result<String, PathError> {
        let relative = self.relative_of_local(local)?;
        self.remote_for_relative(&relative)
    }

    pub fn to_local(&self, remote: &str) -> Result<PathBuf, PathError> {
        let relative = self.relative_of_remote(remote)?;
        self.local_for_relative(&relative)
    }
}

fn check_relative(relative: &str) -> Result<(), PathError> {
    if relative.split('/').any(|part| part == "..") || relative.contains('\\') {
        return Err(PathError::UnsupportedComponent(relative.to_string()));
    }
    Ok(())
}

/// Dotfiles and anything inside a dot-directory.
pub fn is_hidden(relative: &str) -> bool {
    relative
        .split('/')
        .any(|part| part.starts_with('.') && part != "." && part != "..")
}
