//! Piece storage and bookkeeping.
//!
//! This module owns everything the engine knows about piece data: where the
//! bytes live ([`FileStorage`]), how blocks are assembled into pieces and
//! verified, and which piece each peer should be asked for next
//! ([`PieceRepository`]).
//!
//! # Components
//!
//! - [`FileStorage`] - Byte-addressed storage over the concatenation of all files
//! - [`DiskStorage`] - Multi-file storage on disk, `.part` files until complete
//! - [`MemoryStorage`] - In-memory storage
//! - [`PieceRepository`] - Availability, rarest-first selection, request
//!   pipelining, endgame and verification
//! - [`FileEntry`] / [`PieceInfo`] - Layout of files and pieces
//!
//! # Examples
//!
//! ```no_run
//! use bitswarm::storage::{DiskStorage, FileEntry, FileStorage};
//! use std::path::PathBuf;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let files = vec![
//!     FileEntry::new(PathBuf::from("album/01.flac"), 1000, 0),
//!     FileEntry::new(PathBuf::from("album/02.flac"), 500, 1000),
//! ];
//!
//! let storage = DiskStorage::new("./downloads", files)?;
//! storage.preallocate().await?;
//!
//! // Writes spanning a file boundary are split across both files.
//! storage.write(900, &[0u8; 200]).await?;
//! let data = storage.read(900, 200).await?;
//! assert_eq!(data.len(), 200);
//! # Ok(())
//! # }
//! ```
//!
//! # Security
//!
//! File paths containing `..` or absolute paths are rejected.

mod disk;
mod error;
mod file;
mod memory;
mod piece;
mod repository;
mod selector;

pub use disk::{DiskStorage, PART_EXTENSION};
pub use error::{RepositoryError, StorageError};
pub use file::{file_spans, FileEntry, FileSpan, PieceInfo};
pub use memory::MemoryStorage;
pub use repository::{PieceRepository, WriteOutcome};
pub use selector::PieceSelector;

use async_trait::async_trait;
use bytes::Bytes;

/// Storage addressed by absolute offset in the concatenation of all files.
#[async_trait]
pub trait FileStorage: Send + Sync {
    /// Reads `length` bytes starting at `offset`.
    async fn read(&self, offset: u64, length: usize) -> Result<Bytes, StorageError>;

    /// Writes `data` at `offset`, returning the number of bytes written.
    async fn write(&self, offset: u64, data: &[u8]) -> Result<usize, StorageError>;

    /// Total size in bytes.
    fn size(&self) -> u64;

    /// Moves the content to its final layout once every piece is verified.
    async fn complete(&self) -> Result<(), StorageError>;

    fn is_complete(&self) -> bool;

    /// Flushes and releases resources. Further reads and writes fail.
    async fn close(&self) -> Result<(), StorageError>;
}

#[cfg(test)]
mod tests;
