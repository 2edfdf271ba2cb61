use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("index error: {0}")]
    Tantivy(#[from] tantivy::TantivyError),

    #[error("database open error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("database storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("database transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("database table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("database commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("metadata encoding error: {0}")]
    Json(#[from] serde_json::Error),

    /// The store could not be created or opened (permissions, disk, or
    /// another process holding the writer lock).
    #[error("storage error: {0}")]
    Storage(String),

    /// The on-disk index is unreadable or cannot be migrated; the caller
    /// must rebuild it.
    #[error("index is corrupt or incompatible: {0} (run `maildex rebuild`)")]
    CorruptIndex(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("data directory does not exist and could not be created: {0}")]
    DataDir(PathBuf),
}

impl Error {
    /// Whether the error means the store has to be rebuilt from scratch.
    pub fn is_corrupt_index(&self) -> bool {
        matches!(self, Error::CorruptIndex(_))
    }
}
