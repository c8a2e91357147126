//! Error types for zipstream.
//!
//! Errors fall into two classes. Fatal errors ([`Error::RemoteContentChanged`],
//! [`Error::Cancelled`]) abort the whole job. Everything else raised while
//! processing a single entry is recorded against that entry in the
//! [`JobResult`](crate::pipeline::JobResult) and sibling entries carry on.

use thiserror::Error;

/// Result type alias for zipstream operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for zipstream
#[derive(Debug, Error)]
pub enum Error {
    /// The End Of Central Directory (or its Zip64 counterpart) could not be
    /// found or is malformed.
    #[error("invalid archive structure: {0}")]
    ArchiveStructure(String),

    /// A local file header disagrees with its central directory record.
    #[error("local header mismatch for {entry}: {reason}")]
    LocalHeaderMismatch {
        /// Entry name as stored in the central directory
        entry: String,
        /// What did not match
        reason: String,
    },

    /// The extracted data does not hash to the CRC32 from the central directory.
    #[error("CRC32 mismatch for {entry}: expected {expected:08x}, got {actual:08x}")]
    Checksum {
        /// Entry name
        entry: String,
        /// CRC32 recorded in the central directory
        expected: u32,
        /// CRC32 of the bytes actually produced
        actual: u32,
    },

    /// The extracted data length differs from the central directory size.
    #[error("size mismatch for {entry}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        /// Entry name
        entry: String,
        /// Uncompressed size recorded in the central directory
        expected: u64,
        /// Number of bytes actually produced
        actual: u64,
    },

    /// Encryption, patch data or an unsupported compression method.
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    /// The remote object changed between two range requests.
    #[error("remote content changed during download")]
    RemoteContentChanged,

    /// The job was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// Configuration error with the offending key
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message
        message: String,
        /// The configuration key that caused the error
        key: Option<String>,
    },

    /// Entry name that would escape the target directory or is otherwise unusable
    #[error("invalid entry name: {0}")]
    InvalidEntryName(String),

    /// A job is already running on this downloader
    #[error("a download job is already running")]
    JobInProgress,

    /// The server does not honour byte ranges
    #[error("range requests not supported: {0}")]
    RangeNotSupported(String),

    /// Unexpected HTTP status
    #[error("HTTP request failed with status: {0}")]
    HttpStatus(u16),

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a [`Error::LocalHeaderMismatch`] for `entry`.
    pub fn header_mismatch(entry: &str, reason: impl Into<String>) -> Self {
        Error::LocalHeaderMismatch {
            entry: entry.to_string(),
            reason: reason.into(),
        }
    }

    /// Build a [`Error::Config`] for `key`.
    pub fn config(key: &str, message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.to_string()),
        }
    }

    /// Returns true for errors that must abort the whole job rather than
    /// being recorded against a single entry.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::RemoteContentChanged | Error::Cancelled)
    }
}
