//! Error types for kvfs
//!
//! This module defines the fixed error vocabulary surfaced at the filesystem
//! boundary. Backend failures of any flavour collapse into the two
//! `Backend*` kinds and are reported to the OS as a generic I/O error.

use thiserror::Error;

/// Common result type for kvfs operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for kvfs
#[derive(Debug, Error)]
pub enum Error {
    // Namespace errors
    #[error("no such file or directory: {0}")]
    NotFound(String),

    #[error("file exists: {0}")]
    AlreadyExists(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("directory not empty: {0}")]
    NotEmpty(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("operation not supported: {0}")]
    NotSupported(String),

    #[error("name too long: {len} bytes (max {max})")]
    NameTooLong { len: usize, max: usize },

    // Backend errors
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("backend rejected request: {0}")]
    BackendRejected(String),

    #[error("backend request timed out")]
    Timeout,

    #[error("could not acquire lock on file {id} after {attempts} attempts")]
    LockTimeout { id: u64, attempts: u32 },

    // Internal errors
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a not found error
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a not supported error
    pub fn not_supported(op: impl Into<String>) -> Self {
        Self::NotSupported(op.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Check if this error originated in the key-value backend
    #[must_use]
    pub const fn is_backend(&self) -> bool {
        matches!(
            self,
            Self::BackendUnavailable(_) | Self::BackendRejected(_) | Self::Timeout
        )
    }

    /// POSIX errno for the filesystem boundary
    #[must_use]
    pub const fn errno(&self) -> i32 {
        match self {
            Self::NotFound(_) => libc::ENOENT,
            Self::AlreadyExists(_) => libc::EEXIST,
            Self::NotADirectory(_) => libc::ENOTDIR,
            Self::IsADirectory(_) => libc::EISDIR,
            Self::NotEmpty(_) => libc::ENOTEMPTY,
            Self::InvalidArgument(_) => libc::EINVAL,
            Self::NotSupported(_) => libc::EOPNOTSUPP,
            Self::NameTooLong { .. } => libc::ENAMETOOLONG,

            // Every backend failure, and anything we cannot classify, is EIO
            Self::BackendUnavailable(_)
            | Self::BackendRejected(_)
            | Self::Timeout
            | Self::LockTimeout { .. }
            | Self::Internal(_) => libc::EIO,
        }
    }
}
