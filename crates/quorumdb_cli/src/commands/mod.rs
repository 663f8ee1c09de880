//! CLI command implementations.

pub mod dump_log;
pub mod inspect;
pub mod serve;
pub mod verify;

use quorumdb_core::log::Log;
use quorumdb_storage::InMemoryBackend;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Name of the log file inside a data directory.
pub const LOG_FILE: &str = "replica.log";

/// Errors reported by the CLI commands.
#[derive(Debug, Error)]
pub enum CliError {
    /// No log file in the data directory.
    #[error("no replica log found at {}", .0.display())]
    LogNotFound(PathBuf),

    /// The log has damaged envelopes.
    #[error("verification failed: {0} problem(s) found")]
    VerificationFailed(usize),

    /// A `--members` entry could not be parsed.
    #[error("invalid member {0:?}: expected id=host:port")]
    InvalidMember(String),

    /// This replica's id is missing from `--members`.
    #[error("replica {0} is not listed in --members")]
    NotAMember(u32),
}

/// Returns the log path inside `dir`, failing if there is no log.
pub fn log_path(dir: &Path) -> Result<PathBuf, CliError> {
    let path = dir.join(LOG_FILE);
    if path.exists() {
        Ok(path)
    } else {
        Err(CliError::LogNotFound(path))
    }
}

/// Opens a copy of the log in `dir` without touching the file.
///
/// Recovery may cut a torn tail; doing that on a copy keeps the command
/// read-only while a replica is running.
pub fn open_log_copy(dir: &Path) -> Result<Log, Box<dyn std::error::Error>> {
    let bytes = std::fs::read(log_path(dir)?)?;
    Ok(Log::open(Box::new(InMemoryBackend::with_data(bytes)), false)?)
}
