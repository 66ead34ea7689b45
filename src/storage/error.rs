use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("range out of bounds: offset {offset}, length {length}")]
    InvalidRange { offset: u64, length: u64 },

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("path traversal detected in file path: {0}")]
    PathTraversal(String),

    #[error("storage closed")]
    Closed,
}

/// Errors raised by [`PieceRepository`](super::PieceRepository) operations.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("peer already has a piece in progress")]
    AlreadyDownloading,

    #[error("piece {0} failed hash verification")]
    PieceCorrupt(u32),

    #[error("no open buffer for piece {0}")]
    NoOpenBuffer(u32),

    #[error("invalid piece index: {0}")]
    InvalidPieceIndex(u32),

    #[error("invalid block: piece {piece}, offset {offset}, length {length}")]
    InvalidBlock { piece: u32, offset: u32, length: u32 },

    #[error("piece {0} is not on disk")]
    NotOnDisk(u32),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl RepositoryError {
    /// True when the local storage layer failed rather than the peer.
    pub fn is_storage_failure(&self) -> bool {
        matches!(self, RepositoryError::Storage(_))
    }
}
