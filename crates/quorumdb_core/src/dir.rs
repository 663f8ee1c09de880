//! Replica data directory.
//!
//! ```text
//! <data_dir>/
//! ├─ LOCK          # Advisory lock: one process per replica
//! └─ replica.log   # The log, the only durable artifact
//! ```

use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use quorumdb_storage::FileBackend;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const LOG_FILE: &str = "replica.log";

/// Exclusive handle on a replica's data directory.
///
/// The lock is released when the handle is dropped.
#[derive(Debug)]
pub struct ReplicaDir {
    path: PathBuf,
    _lock_file: File,
}

impl ReplicaDir {
    /// Opens `path`, creating it if missing, and locks it.
    ///
    /// # Errors
    ///
    /// - `DataDirLocked` if another process holds the directory
    /// - `InvalidArgument` if `path` exists but is not a directory
    /// - I/O errors from creating the directory or the lock file
    pub fn open(path: &Path) -> CoreResult<Self> {
        if !path.exists() {
            fs::create_dir_all(path)?;
        }
        if !path.is_dir() {
            return Err(CoreError::invalid_argument(format!(
                "not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::DataDirLocked {
                path: path.to_path_buf(),
            });
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the log file.
    #[must_use]
    pub fn log_path(&self) -> PathBuf {
        self.path.join(LOG_FILE)
    }

    /// Opens the log file, creating it if missing.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the file cannot be opened.
    pub fn open_log(&self) -> CoreResult<FileBackend> {
        Ok(FileBackend::open_with_create_dirs(&self.log_path())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorumdb_storage::StorageBackend;
    use tempfile::tempdir;

    #[test]
    fn creates_missing_directory() {
        let root = tempdir().unwrap();
        let path = root.path().join("replica-0");
        let dir = ReplicaDir::open(&path).unwrap();
        assert!(path.is_dir());
        assert_eq!(dir.log_path(), path.join("replica.log"));
    }

    #[test]
    fn second_open_is_locked_out() {
        let root = tempdir().unwrap();
        let _held = ReplicaDir::open(root.path()).unwrap();
        let err = ReplicaDir::open(root.path()).unwrap_err();
        assert!(matches!(err, CoreError::DataDirLocked { .. }));
    }

    #[test]
    fn lock_released_on_drop() {
        let root = tempdir().unwrap();
        drop(ReplicaDir::open(root.path()).unwrap());
        assert!(ReplicaDir::open(root.path()).is_ok());
    }

    #[test]
    fn log_file_persists() {
        let root = tempdir().unwrap();
        {
            let dir = ReplicaDir::open(root.path()).unwrap();
            let mut log = dir.open_log().unwrap();
            log.append(b"abc").unwrap();
            log.flush().unwrap();
        }
        let dir = ReplicaDir::open(root.path()).unwrap();
        assert_eq!(dir.open_log().unwrap().size().unwrap(), 3);
    }

    #[test]
    fn file_in_the_way_is_rejected() {
        let root = tempdir().unwrap();
        let path = root.path().join("taken");
        fs::write(&path, b"x").unwrap();
        assert!(matches!(
            ReplicaDir::open(&path),
            Err(CoreError::InvalidArgument { .. })
        ));
    }
}
