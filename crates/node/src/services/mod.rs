//! RPC services.
//!
//! Each service method takes the caller's token, checks it against the
//! [`PermissionCache`] and only then touches the filesystem. Paths are
//! normalized once up front; the normalized path is both the one checked and
//! the one operated on.

mod bookmark;
mod device;
mod file;
mod path;

use std::path::PathBuf;
use std::sync::Arc;

use protocol::{Bookmark, DeviceIdentity, ProtocolError};
use thiserror::Error;

use crate::fs::{FileSystemAdapter, FsError};
use crate::permissions::{normalize_path, Action, PermissionCache};

pub use bookmark::BookmarkService;
pub use device::DeviceService;
pub use file::FileService;
pub use path::{PathService, TraverseStream};

/// Errors surfaced by service calls. Carried to the caller as
/// `RpcReply::Failure` or an HTTP status, never as a transport fault.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("permission denied: {action} on {path}")]
    PermissionDenied { action: Action, path: String },

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error(transparent)]
    Fs(#[from] FsError),
}

impl From<ServiceError> for ProtocolError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::PermissionDenied { action, path } => ProtocolError::PermissionDenied {
                action: action.to_string(),
                path,
            },
            ServiceError::InvalidPath(path) => {
                ProtocolError::Protocol(format!("invalid path: {}", path))
            }
            ServiceError::Fs(e) => e.into(),
        }
    }
}

/// Dependencies shared by all services.
pub struct ServiceContext {
    pub identity: DeviceIdentity,
    pub http_port: u16,
    pub root_paths: Vec<PathBuf>,
    pub bookmarks: Vec<Bookmark>,
    pub traverse_batch_size: usize,
    pub permissions: Arc<PermissionCache>,
    pub fs: Arc<dyn FileSystemAdapter>,
}

impl ServiceContext {
    /// Normalize `path` and require `action` on it.
    pub(crate) fn authorize(
        &self,
        token: &str,
        path: &str,
        action: Action,
    ) -> Result<PathBuf, ServiceError> {
        let normalized =
            normalize_path(path).ok_or_else(|| ServiceError::InvalidPath(path.to_string()))?;
        if normalized.is_empty() {
            return Err(ServiceError::InvalidPath(path.to_string()));
        }
        if !self
            .permissions
            .check_access(token, &normalized, action)
            .is_allowed()
        {
            return Err(ServiceError::PermissionDenied {
                action,
                path: normalized,
            });
        }
        Ok(PathBuf::from(normalized))
    }

    pub(crate) fn can(&self, token: &str, path: &str, action: Action) -> bool {
        self.permissions.check_access(token, path, action).is_allowed()
    }
}

/// The four services, sharing one context.
#[derive(Clone)]
pub struct Services {
    pub device: DeviceService,
    pub path: PathService,
    pub file: FileService,
    pub bookmark: BookmarkService,
}

impl Services {
    pub fn new(context: ServiceContext) -> Self {
        let context = Arc::new(context);
        Self {
            device: DeviceService::new(context.clone()),
            path: PathService::new(context.clone()),
            file: FileService::new(context.clone()),
            bookmark: BookmarkService::new(context),
        }
    }
}
