//! Error types for zipstage.

use serde::Serialize;
use thiserror::Error;

use crate::sandbox::PathRejection;

/// Common error type for zipstage.
#[derive(Error, Debug)]
pub enum ZipstageError {
    /// Configuration error, including a missing tenant identity.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Resource not found.
    #[error("{0} not found")]
    NotFound(String),

    /// An untrusted name was rejected by the path guard.
    #[error("invalid path {name:?}: {reason}")]
    InvalidPath {
        name: String,
        #[source]
        reason: PathRejection,
    },

    /// The sandbox lock is held by another owner.
    #[error("sandbox is busy: {0}")]
    LockConflict(String),

    /// The URL did not parse or is not allowed.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// The remote server answered with a non-success status.
    #[error("HTTP error: {status}")]
    Http { status: u16 },

    /// Transport-level failure while talking to the remote server.
    #[error("network error: {0}")]
    Network(String),

    /// The download deadline elapsed.
    #[error("download timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    /// Content exceeded a byte budget.
    #[error("content too large: {size} bytes (max {limit} bytes)")]
    TooLarge { size: u64, limit: u64 },

    /// The secret-scanning gate rejected the content.
    ///
    /// `pattern_sample` is masked; the raw match is never carried.
    #[error("secret detected ({secret_type}): {pattern_sample}")]
    SecretDetected {
        secret_type: String,
        pattern_sample: String,
    },

    /// The file extension is not on the allow-list.
    #[error("unsupported file type: {0}")]
    UnsupportedFileType(String),

    /// Sniffed content disagrees with the extension.
    #[error("MIME type mismatch: extension implies {expected}, content is {detected}")]
    MimeMismatch { expected: String, detected: String },

    /// Validation error for configuration or input.
    #[error("validation error: {0}")]
    Validation(String),
}

/// Machine-discriminable error kind for the calling layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    Io,
    NotFound,
    InvalidPath,
    LockConflict,
    InvalidUrl,
    Http,
    Network,
    Timeout,
    TooLarge,
    SecretDetected,
    UnsupportedFileType,
    MimeMismatch,
    Validation,
}

impl ZipstageError {
    /// Get the kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ZipstageError::Config(_) => ErrorKind::Config,
            ZipstageError::Io(_) => ErrorKind::Io,
            ZipstageError::NotFound(_) => ErrorKind::NotFound,
            ZipstageError::InvalidPath { .. } => ErrorKind::InvalidPath,
            ZipstageError::LockConflict(_) => ErrorKind::LockConflict,
            ZipstageError::InvalidUrl(_) => ErrorKind::InvalidUrl,
            ZipstageError::Http { .. } => ErrorKind::Http,
            ZipstageError::Network(_) => ErrorKind::Network,
            ZipstageError::Timeout { .. } => ErrorKind::Timeout,
            ZipstageError::TooLarge { .. } => ErrorKind::TooLarge,
            ZipstageError::SecretDetected { .. } => ErrorKind::SecretDetected,
            ZipstageError::UnsupportedFileType(_) => ErrorKind::UnsupportedFileType,
            ZipstageError::MimeMismatch { .. } => ErrorKind::MimeMismatch,
            ZipstageError::Validation(_) => ErrorKind::Validation,
        }
    }

    /// Whether the caller may simply retry later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ZipstageError::LockConflict(_)
                | ZipstageError::Timeout { .. }
                | ZipstageError::Network(_)
        )
    }

    pub(crate) fn invalid_path(name: &str, reason: PathRejection) -> Self {
        ZipstageError::InvalidPath {
            name: name.to_string(),
            reason,
        }
    }
}

impl From<crate::scan::SecretDetection> for ZipstageError {
    fn from(d: crate::scan::SecretDetection) -> Self {
        ZipstageError::SecretDetected {
            secret_type: d.secret_type,
            pattern_sample: d.pattern_sample,
        }
    }
}

/// Result type alias for zipstage operations.
pub type Result<T> = std::result::Result<T, ZipstageError>;
