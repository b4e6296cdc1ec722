//! Error and Result types for usage database operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// A convenience `Result` type for usage database operations.
pub type Result<T> = std::result::Result<T, UsageError>;

/// The error type for usage database operations.
#[derive(Debug, Error)]
pub enum UsageError {
    /// File name does not start with a decimal begin time.
    #[error("Malformed stats file name: {0}")]
    MalformedFileName(String),

    /// No codec is registered for the requested on-disk version.
    #[error("Unhandled usage database version: {0}")]
    UnsupportedVersion(u32),

    /// Invalid magic bytes at the start of a compact stats file.
    #[error("Invalid magic bytes: expected USTB, got {0:?}")]
    InvalidMagic([u8; 4]),

    /// Stats payload checksum does not match the stored value.
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Checksum stored in the footer.
        expected: u32,
        /// Checksum computed over the payload.
        actual: u32,
    },

    /// Stats could not be serialized.
    #[error("Encode error: {0}")]
    Encode(String),

    /// Stats payload is structurally invalid.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Stats payload ended before a complete value could be read.
    #[error("Unexpected end of data while reading {0}")]
    Truncated(&'static str),

    /// The upgrade breadcrumb exists but could not be parsed.
    #[error("Malformed upgrade breadcrumb: {0}")]
    MalformedBreadcrumb(String),

    /// Snapshots must start at or after the epoch to be named on disk.
    #[error("Snapshot begin time {0} is negative")]
    NegativeBeginTime(i64),

    /// An interval directory could not be created.
    #[error("Failed to create directory {0}")]
    DirectoryCreation(PathBuf),

    /// A versioned backup could not be upgraded to the current version.
    #[error("Failed to upgrade versioned backup {path}: {source}")]
    Migration {
        /// Versioned backup file that failed to upgrade.
        path: PathBuf,
        /// Underlying decode or write failure.
        #[source]
        source: Box<UsageError>,
    },

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl UsageError {
    /// Wraps a failure to upgrade the versioned backup at `path`.
    pub fn migration(path: impl Into<PathBuf>, source: UsageError) -> Self {
        Self::Migration {
            path: path.into(),
            source: Box::new(source),
        }
    }
}
