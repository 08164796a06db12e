//! Key-value backend error types

use thiserror::Error;

/// Error type for backend operations
#[derive(Debug, Error)]
pub enum KvError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The store could not be reached or the call could not be scheduled
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    /// The store understood the request but refused it
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("backend call timed out")]
    Timeout,
}

impl From<redb::TransactionError> for KvError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

pub type KvResult<T> = Result<T, KvError>;

impl From<KvError> for kvfs_common::Error {
    fn from(e: KvError) -> Self {
        match e {
            KvError::Timeout => Self::Timeout,
            KvError::Unavailable(msg) => Self::BackendUnavailable(msg),
            KvError::Io(e) => Self::BackendUnavailable(e.to_string()),
            KvError::Storage(e) => Self::BackendUnavailable(e.to_string()),
            KvError::Redb(e) => Self::BackendUnavailable(e.to_string()),
            KvError::Transaction(e) => Self::BackendUnavailable(e.to_string()),
            KvError::Commit(e) => Self::BackendUnavailable(e.to_string()),
            KvError::Table(e) => Self::BackendRejected(e.to_string()),
            KvError::Bincode(e) => Self::BackendRejected(e.to_string()),
            KvError::Rejected(msg) => Self::BackendRejected(msg),
        }
    }
}
