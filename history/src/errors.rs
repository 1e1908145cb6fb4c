use thiserror::Error;
use tokio::task::JoinError;

/// Errors surfaced by the history engine.
///
/// Tree mutations and change set application only ever produce
/// [Error::Conflict], [Error::NotFound] and [Error::InvalidRequest]; whenever
/// one of them is returned, the whole change set was rejected and nothing was
/// published.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum Error {
    /// A name collision, or a structural change the tree can't represent.
    #[error("conflict: {0}")]
    Conflict(String),

    /// An operation referenced a path, id or version that does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Persisted data failed integrity validation while being read.
    #[error("corruption: {0}")]
    Corruption(String),

    /// A call to the external file system failed (or timed out) during revert.
    #[error("gateway error at {path}: {message}")]
    Gateway { path: String, message: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("internal storage error: {0}")]
    StorageError(String),
}

impl From<JoinError> for Error {
    fn from(value: JoinError) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<redb::Error> for Error {
    fn from(value: redb::Error) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<redb::DatabaseError> for Error {
    fn from(value: redb::DatabaseError) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<redb::TableError> for Error {
    fn from(value: redb::TableError) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<redb::TransactionError> for Error {
    fn from(value: redb::TransactionError) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<redb::StorageError> for Error {
    fn from(value: redb::StorageError) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<redb::CommitError> for Error {
    fn from(value: redb::CommitError) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        if value.kind() == std::io::ErrorKind::InvalidInput {
            Error::InvalidRequest(value.to_string())
        } else {
            Error::StorageError(value.to_string())
        }
    }
}

impl From<Error> for std::io::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::InvalidRequest(msg) => Self::new(std::io::ErrorKind::InvalidInput, msg),
            Error::NotFound(msg) => Self::new(std::io::ErrorKind::NotFound, msg),
            Error::Corruption(msg) => Self::new(std::io::ErrorKind::InvalidData, msg),
            e => Self::new(std::io::ErrorKind::Other, e.to_string()),
        }
    }
}
