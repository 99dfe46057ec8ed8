//! Error types for the updater.

use thiserror::Error;

/// Errors that can occur during update operations.
#[derive(Error, Debug)]
pub enum UpdateError {
    /// Network transport failure (connect, timeout, non-2xx already consumed).
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The server answered with an unexpected HTTP status.
    #[error("unexpected HTTP status {status} from {url}")]
    HttpStatus { status: u16, url: String },

    /// Digest of the downloaded archive does not match the expected value.
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumFailed { expected: String, actual: String },

    /// Per-file hash mismatch during a manifest (delta) pass.
    #[error("hash mismatch for {file}: expected {expected}, got {actual}")]
    HashFailed {
        file: String,
        expected: String,
        actual: String,
    },

    /// Session-key decryption of the payload or key material failed.
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    /// Archive entry would be written outside the extraction directory.
    #[error("unsafe archive entry path: {0}")]
    ZipSlip(String),

    /// The configuration forbids the requested mutation.
    #[error("not allowed: {0}")]
    NotAllowed(String),

    /// Unknown bundle id.
    #[error("bundle not found: {0}")]
    NotFound(String),

    /// Filesystem I/O failure.
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Failure while reading the downloaded zip archive.
    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    /// The server returned JSON we cannot act on.
    #[error("invalid server response: {0}")]
    InvalidResponse(String),

    /// The supplied configuration is unusable.
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Result type alias for updater operations.
pub type Result<T> = std::result::Result<T, UpdateError>;
