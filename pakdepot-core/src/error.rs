use thiserror::Error;

#[derive(Error, Debug)]
pub enum DepotError {
    #[error("Package not found: {manager}:{name}")]
    PackageNotFound { manager: String, name: String },

    #[error("All sources failed for {package}")]
    AllSourcesFailed { package: String },

    #[error("No peers share {package}")]
    NoPeers { package: String },

    #[error("Mirror not found: {mirror_id}")]
    MirrorNotFound { mirror_id: String },

    #[error("Resource exhausted: {resource}")]
    ResourceExhausted { resource: String },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Connection error to {address}: {details}")]
    Connection { address: String, details: String },

    #[error("Operation timed out: {operation} after {duration:?}")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },

    #[error("Checksum mismatch for {package}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        package: String,
        expected: String,
        actual: String,
    },

    #[error("Chunk not found: {chunk_id}")]
    ChunkNotFound { chunk_id: String },

    #[error("Storage error: {0}")]
    Storage(#[from] redb::Error),

    #[error("Storage transaction error: {0}")]
    StorageTransaction(String),

    #[error("Storage table error: {0}")]
    StorageTable(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

pub type DepotResult<T> = std::result::Result<T, DepotError>;

impl From<redb::TransactionError> for DepotError {
    fn from(err: redb::TransactionError) -> Self {
        DepotError::StorageTransaction(err.to_string())
    }
}

impl From<redb::TableError> for DepotError {
    fn from(err: redb::TableError) -> Self {
        DepotError::StorageTable(err.to_string())
    }
}

impl From<redb::StorageError> for DepotError {
    fn from(err: redb::StorageError) -> Self {
        DepotError::Storage(err.into())
    }
}

impl From<redb::DatabaseError> for DepotError {
    fn from(err: redb::DatabaseError) -> Self {
        DepotError::Storage(err.into())
    }
}

impl From<redb::CommitError> for DepotError {
    fn from(err: redb::CommitError) -> Self {
        DepotError::Storage(err.into())
    }
}
