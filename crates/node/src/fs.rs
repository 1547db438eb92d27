//! Filesystem adapter used by the RPC services and the HTTP server.
//!
//! Services never touch `std::fs` directly; they go through
//! [`FileSystemAdapter`] so that platform-specific enumeration can be swapped
//! out. [`LocalFileSystem`] is the default implementation.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use protocol::{EntryKind, FileEntry, ProtocolError};
use thiserror::Error;

/// Largest single `read` the adapter will serve.
pub const MAX_READ_SIZE: u64 = 16 * 1024 * 1024;

/// Errors that can occur during filesystem operations.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("path does not exist: {0}")]
    NotFound(PathBuf),

    #[error("path already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("path is not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("path is a directory: {0}")]
    IsADirectory(PathBuf),

    #[error("offset {offset} is beyond end of file ({size} bytes)")]
    InvalidOffset { offset: u64, size: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FsError {
    fn from_io(err: std::io::Error, path: &Path) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => FsError::NotFound(path.to_path_buf()),
            std::io::ErrorKind::AlreadyExists => FsError::AlreadyExists(path.to_path_buf()),
            _ => FsError::Io(err),
        }
    }
}

impl From<FsError> for ProtocolError {
    fn from(err: FsError) -> Self {
        match err {
            FsError::NotFound(path) => ProtocolError::NotFound(path.display().to_string()),
            FsError::Io(e) => ProtocolError::from(e),
            other => ProtocolError::Protocol(other.to_string()),
        }
    }
}

/// List/stat/read/write/create/delete/rename primitives.
pub trait FileSystemAdapter: Send + Sync {
    /// Entries of a directory, sorted by name.
    fn list(&self, path: &Path) -> Result<Vec<FileEntry>, FsError>;

    fn stat(&self, path: &Path) -> Result<FileEntry, FsError>;

    /// Up to `length` bytes starting at `offset`.
    fn read(&self, path: &Path, offset: u64, length: u64) -> Result<Vec<u8>, FsError>;

    /// Write `data` at `offset`, creating the file if needed. Returns bytes written.
    fn write(&self, path: &Path, offset: u64, data: &[u8]) -> Result<u64, FsError>;

    fn create_dir(&self, path: &Path) -> Result<(), FsError>;

    /// Create an empty file; fails if it exists.
    fn create_file(&self, path: &Path) -> Result<(), FsError>;

    /// Delete a file or a whole directory tree.
    fn delete(&self, path: &Path) -> Result<(), FsError>;

    /// Rename without overwriting an existing destination.
    fn rename(&self, from: &Path, to: &Path) -> Result<(), FsError>;
}

/// [`FileSystemAdapter`] over the local disk.
#[derive(Debug, Clone, Default)]
pub struct LocalFileSystem {
    include_hidden: bool,
}

impl LocalFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Include dot-files in listings.
    pub fn include_hidden(mut self, include: bool) -> Self {
        self.include_hidden = include;
        self
    }
}

fn entry_for(path: &Path) -> Result<FileEntry, FsError> {
    let link_meta = fs::symlink_metadata(path).map_err(|e| FsError::from_io(e, path))?;
    let kind = if link_meta.file_type().is_symlink() {
        EntryKind::Symlink
    } else if link_meta.is_dir() {
        EntryKind::Directory
    } else if link_meta.is_file() {
        EntryKind::File
    } else {
        EntryKind::Other
    };

    let size = if link_meta.is_file() { link_meta.len() } else { 0 };
    let modified = link_meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_secs());

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());

    Ok(FileEntry {
        name,
        path: path.display().to_string(),
        kind,
        size,
        modified,
    })
}

impl FileSystemAdapter for LocalFileSystem {
    fn list(&self, path: &Path) -> Result<Vec<FileEntry>, FsError> {
        let meta = fs::metadata(path).map_err(|e| FsError::from_io(e, path))?;
        if !meta.is_dir() {
            return Err(FsError::NotADirectory(path.to_path_buf()));
        }

        let mut entries = Vec::new();
        for item in fs::read_dir(path).map_err(|e| FsError::from_io(e, path))? {
            // Skip entries we can't read
            let Ok(item) = item else { continue };
            if !self.include_hidden && item.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            match entry_for(&item.path()) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::debug!("Skipping {:?}: {}", item.path(), e),
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn stat(&self, path: &Path) -> Result<FileEntry, FsError> {
        entry_for(path)
    }

    fn read(&self, path: &Path, offset: u64, length: u64) -> Result<Vec<u8>, FsError> {
        let meta = fs::metadata(path).map_err(|e| FsError::from_io(e, path))?;
        if meta.is_dir() {
            return Err(FsError::IsADirectory(path.to_path_buf()));
        }
        let size = meta.len();
        if offset > size {
            return Err(FsError::InvalidOffset { offset, size });
        }

        let to_read = length.min(size - offset).min(MAX_READ_SIZE);
        let mut file = File::open(path).map_err(|e| FsError::from_io(e, path))?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buffer = Vec::with_capacity(to_read as usize);
        file.take(to_read).read_to_end(&mut buffer)?;
        Ok(buffer)
    }

    fn write(&self, path: &Path, offset: u64, data: &[u8]) -> Result<u64, FsError> {
        if path.is_dir() {
            return Err(FsError::IsADirectory(path.to_path_buf()));
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| FsError::from_io(e, path))?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        file.flush()?;
        Ok(data.len() as u64)
    }

    fn create_dir(&self, path: &Path) -> Result<(), FsError> {
        fs::create_dir(path).map_err(|e| FsError::from_io(e, path))
    }

    fn create_file(&self, path: &Path) -> Result<(), FsError> {
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map(|_| ())
            .map_err(|e| FsError::from_io(e, path))
    }

    fn delete(&self, path: &Path) -> Result<(), FsError> {
        let meta = fs::symlink_metadata(path).map_err(|e| FsError::from_io(e, path))?;
        let result = if meta.is_dir() {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        };
        result.map_err(|e| FsError::from_io(e, path))
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<(), FsError> {
        if fs::symlink_metadata(to).is_ok() {
            return Err(FsError::AlreadyExists(to.to_path_buf()));
        }
        fs::rename(from, to).map_err(|e| FsError::from_io(e, from))
    }
}
