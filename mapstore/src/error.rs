//! Error taxonomy for the map-data acquisition core.
//!
//! Three families:
//!
//! - [`DownloadError`]: everything that can go wrong between issuing an
//!   HTTP request and confirming the last byte on disk.
//! - [`MigrationError`]: the small user-facing set for storage migration;
//!   every migration failure must map to an actionable message, never a
//!   raw error code.
//! - [`CommandError`]: rejected commands against the region model
//!   (unknown id, invalid state transition).

use std::io;

use thiserror::Error;

/// Result alias for transfer-layer operations.
pub type DownloadResult<T> = Result<T, DownloadError>;

/// Errors produced by chunk transfers and the scheduler.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Socket/read failure, including per-attempt timeouts.
    #[error("I/O error during transfer: {0}")]
    Io(String),

    /// The URL could not be parsed.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// The HTTP status did not match the request shape (ranged request
    /// answered with something other than 206, full request with
    /// something other than 200).
    #[error("inconsistent HTTP response: expected {expected}, got {actual}")]
    InconsistentResponse { expected: u16, actual: u16 },

    /// The server reported a different total size than the caller
    /// expected. Guards against captive portals and transparent proxies
    /// serving a login page as the map file.
    #[error("inconsistent file size: expected {expected} bytes, server reported {reported}")]
    InconsistentFileSize { expected: u64, reported: u64 },

    /// The caller-side sink refused a write (disk full, file gone).
    /// The transfer must stop immediately on this signal.
    #[error("local write rejected: {0}")]
    WriteRejected(String),

    /// The transfer was cancelled cooperatively at a buffer boundary.
    #[error("transfer cancelled")]
    Cancelled,

    /// The connection could not be established at all.
    #[error("no internet connection")]
    NoInternet,

    /// Not enough free disk space.
    #[error("not enough free disk space")]
    OutOfMemory,

    /// The server answered with a 4xx/5xx status.
    #[error("server error: HTTP {0}")]
    ServerError(u16),
}

impl From<io::Error> for DownloadError {
    fn from(e: io::Error) -> Self {
        DownloadError::Io(e.to_string())
    }
}

/// User-facing migration failure classes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MigrationError {
    /// Not enough free space for the migrated map set.
    #[error("not enough free space to migrate maps")]
    OutOfMemory,

    /// No network connection while fetching the migrated region.
    #[error("no internet connection")]
    NoInternet,

    /// Anything else, carried verbatim for logging.
    #[error("migration failed: {0}")]
    Other(String),
}

impl From<&DownloadError> for MigrationError {
    fn from(e: &DownloadError) -> Self {
        match e {
            DownloadError::OutOfMemory | DownloadError::WriteRejected(_) => {
                MigrationError::OutOfMemory
            }
            DownloadError::NoInternet => MigrationError::NoInternet,
            other => MigrationError::Other(other.to_string()),
        }
    }
}

/// Rejected commands against the region model.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// The region id does not exist in the region tree.
    #[error("unknown region id: {0}")]
    UnknownRegion(String),

    /// The command is not valid for the region's current status
    /// (e.g. `retry` on a region that never failed).
    #[error("invalid transition for region {region}: {command} while {status}")]
    InvalidTransition {
        region: String,
        command: &'static str,
        status: &'static str,
    },
}
