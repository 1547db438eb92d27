use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{ServiceContext, ServiceError};
use crate::fs::FsError;
use crate::permissions::Action;

/// Mutating and byte-level file operations.
#[derive(Clone)]
pub struct FileService {
    context: Arc<ServiceContext>,
}

impl FileService {
    pub(super) fn new(context: Arc<ServiceContext>) -> Self {
        Self { context }
    }

    /// Needs `rename` on the source and `write` on the destination's parent.
    pub fn rename(&self, token: &str, from: &str, to: &str) -> Result<(), ServiceError> {
        let source = self.context.authorize(token, from, Action::Rename)?;
        let destination_parent = Path::new(to)
            .parent()
            .map(|p| p.display().to_string())
            .ok_or_else(|| ServiceError::InvalidPath(to.to_string()))?;
        let parent = self
            .context
            .authorize(token, &destination_parent, Action::Write)?;
        let file_name = Path::new(to)
            .file_name()
            .ok_or_else(|| ServiceError::InvalidPath(to.to_string()))?;

        let destination = parent.join(file_name);
        self.context.fs.rename(&source, &destination)?;
        tracing::info!("Renamed {:?} to {:?}", source, destination);
        Ok(())
    }

    pub fn create_folder(&self, token: &str, path: &str) -> Result<(), ServiceError> {
        let path = self.context.authorize(token, path, Action::Write)?;
        self.context.fs.create_dir(&path)?;
        Ok(())
    }

    pub fn create_file(&self, token: &str, path: &str) -> Result<(), ServiceError> {
        let path = self.context.authorize(token, path, Action::Write)?;
        self.context.fs.create_file(&path)?;
        Ok(())
    }

    pub fn delete(&self, token: &str, path: &str) -> Result<(), ServiceError> {
        let path = self.context.authorize(token, path, Action::Remove)?;
        self.context.fs.delete(&path)?;
        tracing::info!("Deleted {:?}", path);
        Ok(())
    }

    pub fn read_bytes(
        &self,
        token: &str,
        path: &str,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>, ServiceError> {
        let path = self.context.authorize(token, path, Action::Read)?;
        Ok(self.context.fs.read(&path, offset, length)?)
    }

    /// Check read access on a regular file and return its normalized path
    /// and size. Used by the HTTP file endpoint, which streams the bytes
    /// itself.
    pub fn readable_file(&self, token: &str, path: &str) -> Result<(PathBuf, u64), ServiceError> {
        let path = self.context.authorize(token, path, Action::Read)?;
        let entry = self.context.fs.stat(&path)?;
        if entry.is_dir() {
            return Err(FsError::IsADirectory(path).into());
        }
        Ok((path, entry.size))
    }

    /// Returns the number of bytes written.
    pub fn write_bytes(
        &self,
        token: &str,
        path: &str,
        offset: u64,
        data: &[u8],
    ) -> Result<u64, ServiceError> {
        let path = self.context.authorize(token, path, Action::Write)?;
        Ok(self.context.fs.write(&path, offset, data)?)
    }
}
