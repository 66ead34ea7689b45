//! Torrent metadata consumed by the engine.
//!
//! [`Metainfo`] is the read-only description of the content being shared:
//! the info hash, the piece length, the ordered piece hashes and the file
//! list. Parsing `.torrent` files is left to the caller; this type only
//! checks that the pieces it is given are consistent with the files.
//!
//! # Examples
//!
//! ```
//! use bitswarm::metainfo::Metainfo;
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let metainfo = Metainfo::new(
//!     [7u8; 20],
//!     "album",
//!     16384,
//!     vec![[0u8; 20]; 3],
//!     vec![
//!         (PathBuf::from("01.flac"), 20000),
//!         (PathBuf::from("02.flac"), 20000),
//!     ],
//! )?;
//!
//! assert_eq!(metainfo.total_length(), 40000);
//! assert_eq!(metainfo.piece_count(), 3);
//! assert_eq!(metainfo.piece_size(2), Some(40000 - 2 * 16384));
//! # Ok(())
//! # }
//! ```

use crate::storage::{FileEntry, PieceInfo};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised when metadata is inconsistent.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MetainfoError {
    /// The piece length is zero.
    #[error("invalid piece length: {0}")]
    InvalidPieceLength(u64),

    /// The number of piece hashes does not cover the content.
    #[error("expected {expected} piece hashes, got {actual}")]
    PieceCountMismatch { expected: usize, actual: usize },

    /// The torrent lists no files, or only empty ones.
    #[error("torrent has no content")]
    Empty,

    /// A file path is empty.
    #[error("invalid file path: {0}")]
    InvalidPath(String),
}

/// Metadata of one torrent.
#[derive(Clone, PartialEq, Eq)]
pub struct Metainfo {
    info_hash: [u8; 20],
    name: String,
    piece_length: u64,
    piece_hashes: Vec<[u8; 20]>,
    files: Vec<FileEntry>,
    total_length: u64,
}

impl Metainfo {
    /// Builds metadata from its parts. File offsets are assigned in list
    /// order.
    pub fn new(
        info_hash: [u8; 20],
        name: impl Into<String>,
        piece_length: u64,
        piece_hashes: Vec<[u8; 20]>,
        files: Vec<(PathBuf, u64)>,
    ) -> Result<Self, MetainfoError> {
        if piece_length == 0 {
            return Err(MetainfoError::InvalidPieceLength(piece_length));
        }

        let mut offset = 0u64;
        let mut entries = Vec::with_capacity(files.len());
        for (path, length) in files {
            if path.as_os_str().is_empty() {
                return Err(MetainfoError::InvalidPath(path.display().to_string()));
            }
            entries.push(FileEntry::new(path, length, offset));
            offset += length;
        }

        let total_length = offset;
        if total_length == 0 {
            return Err(MetainfoError::Empty);
        }

        let expected = total_length.div_ceil(piece_length) as usize;
        if piece_hashes.len() != expected {
            return Err(MetainfoError::PieceCountMismatch {
                expected,
                actual: piece_hashes.len(),
            });
        }

        Ok(Self {
            info_hash,
            name: name.into(),
            piece_length,
            piece_hashes,
            files: entries,
            total_length,
        })
    }

    /// Single-file torrent named after its only file.
    pub fn single_file(
        info_hash: [u8; 20],
        name: impl Into<String>,
        piece_length: u64,
        piece_hashes: Vec<[u8; 20]>,
        length: u64,
    ) -> Result<Self, MetainfoError> {
        let name = name.into();
        let path = PathBuf::from(&name);
        Self::new(info_hash, name, piece_length, piece_hashes, vec![(path, length)])
    }

    pub fn info_hash(&self) -> &[u8; 20] {
        &self.info_hash
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn piece_length(&self) -> u64 {
        self.piece_length
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    pub fn piece_hash(&self, index: u32) -> Option<&[u8; 20]> {
        self.piece_hashes.get(index as usize)
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    /// Length of a piece; only the last one may be shorter.
    pub fn piece_size(&self, index: u32) -> Option<u64> {
        if index as usize >= self.piece_hashes.len() {
            return None;
        }
        let offset = index as u64 * self.piece_length;
        Some((self.total_length - offset).min(self.piece_length))
    }

    /// Placement and expected hash of every piece.
    pub fn pieces(&self) -> Vec<PieceInfo> {
        self.piece_hashes
            .iter()
            .enumerate()
            .map(|(i, hash)| {
                let index = i as u32;
                PieceInfo::new(
                    index,
                    *hash,
                    index as u64 * self.piece_length,
                    self.piece_size(index).unwrap_or(0),
                )
            })
            .collect()
    }

    pub fn info_hash_hex(&self) -> String {
        self.info_hash.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Debug for Metainfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metainfo")
            .field("info_hash", &self.info_hash_hex())
            .field("name", &self.name)
            .field("piece_length", &self.piece_length)
            .field("pieces", &self.piece_hashes.len())
            .field("total_length", &self.total_length)
            .finish()
    }
}

#[cfg(test)]
mod tests;
