// The filesystem side of a transfer: turning a request's filename into a path under the server
// root and opening it for reading or writing. Nothing here knows about packets beyond mapping a
// failure onto the TFTP error code the client should see.

use crate::session::{ByteSink, ByteSource};
use crate::tftp::{ErrorCode, FileMode};
use std::fmt;
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("file not found: {0:?}")]
    NotFound(PathBuf),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("file already exists: {0:?}")]
    AlreadyExists(PathBuf),

    #[error("storage capacity exceeded: {0}")]
    CapacityExceeded(#[source] io::Error),

    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl StoreError {
    fn from_io(path: &Path, e: io::Error) -> StoreError {
        match e.kind() {
            io::ErrorKind::NotFound => StoreError::NotFound(path.to_path_buf()),
            io::ErrorKind::PermissionDenied => StoreError::AccessDenied(format!("{path:?}: {e}")),
            io::ErrorKind::AlreadyExists => StoreError::AlreadyExists(path.to_path_buf()),
            io::ErrorKind::StorageFull | io::ErrorKind::FileTooLarge => StoreError::CapacityExceeded(e),
            _ => StoreError::Io { path: path.to_path_buf(), source: e },
        }
    }

    /// Code sent back when a read request cannot be served.
    pub fn read_error_code(&self) -> ErrorCode {
        match self {
            StoreError::AccessDenied(_) => ErrorCode::AccessViolation,
            _ => ErrorCode::FileNotFound,
        }
    }

    /// Code sent back when a write request cannot be served.
    pub fn write_error_code(&self) -> ErrorCode {
        match self {
            StoreError::AccessDenied(_) => ErrorCode::AccessViolation,
            StoreError::AlreadyExists(_) => ErrorCode::FileAlreadyExists,
            _ => ErrorCode::DiskFull,
        }
    }
}

/// A file opened for a read request.
pub struct Source {
    pub reader: ByteSource,
    pub len: u64,
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Source").field("len", &self.len).finish_non_exhaustive()
    }
}

/// Serves files from, and stores files under, a single root directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
    allow_writes: bool,
    allow_overwrite: bool,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> FileStore {
        FileStore {
            root: root.into(),
            allow_writes: true,
            allow_overwrite: true,
        }
    }

    /// Refuse every write request.
    pub fn read_only(mut self, read_only: bool) -> FileStore {
        self.allow_writes = !read_only;
        self
    }

    /// Whether a write request may replace a file that already exists.
    pub fn allow_overwrite(mut self, allow: bool) -> FileStore {
        self.allow_overwrite = allow;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a requested filename to a path under the root. A leading `/` is treated as the root
    /// itself; anything that would climb out of the root is refused.
    pub fn resolve(&self, filename: &str) -> Result<PathBuf, StoreError> {
        let relative = Path::new(filename.trim_start_matches('/'));
        if relative.as_os_str().is_empty() {
            return Err(StoreError::AccessDenied("empty filename".to_string()));
        }

        for component in relative.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(StoreError::AccessDenied(format!(
                        "'{filename}' points outside the server root"
                    )));
                }
            }
        }

        Ok(self.root.join(relative))
    }

    pub async fn open_read(&self, filename: &str, mode: FileMode) -> Result<Source, StoreError> {
        let path = self.resolve(filename)?;
        let file = File::open(&path).await.map_err(|e| StoreError::from_io(&path, e))?;
        let metadata = file.metadata().await.map_err(|e| StoreError::from_io(&path, e))?;
        if metadata.is_dir() {
            return Err(StoreError::AccessDenied(format!("{path:?} is a directory")));
        }

        log::info!("Reading {path:?} ({} bytes, {mode})", metadata.len());
        Ok(Source {
            reader: Box::new(file),
            len: metadata.len(),
        })
    }

    pub async fn open_write(&self, filename: &str, mode: FileMode) -> Result<ByteSink, StoreError> {
        if !self.allow_writes {
            return Err(StoreError::AccessDenied("server is read-only".to_string()));
        }

        let path = self.resolve(filename)?;
        let mut options = OpenOptions::new();
        options.write(true);
        if self.allow_overwrite {
            options.create(true).truncate(true);
        } else {
            options.create_new(true);
        }

        let file = options.open(&path).await.map_err(|e| StoreError::from_io(&path, e))?;
        log::info!("Writing to {path:?} ({mode})");
        Ok(Box::new(file))
    }
}
