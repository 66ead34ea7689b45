use super::error::RepositoryError;
use std::collections::HashSet;

/// Assembly state of one piece.
///
/// The buffer only exists in `Open`: it is allocated on the first block and
/// handed out when the last byte arrives, so a piece never holds memory
/// before or after it is being downloaded.
#[derive(Debug, Default)]
pub(crate) enum PieceAssembly {
    #[default]
    Idle,
    Open {
        buffer: Vec<u8>,
        remaining: u64,
        received: HashSet<u32>,
    },
    Verifying,
    Complete,
}

pub(crate) enum BlockAccept {
    Accepted,
    Duplicate,
    /// The last missing block arrived; the assembled piece is returned and
    /// the slot moves to `Verifying`.
    Full(Vec<u8>),
}

impl PieceAssembly {
    pub(crate) fn is_idle(&self) -> bool {
        matches!(self, PieceAssembly::Idle)
    }

    pub(crate) fn has_block(&self, offset: u32) -> bool {
        match self {
            PieceAssembly::Idle => false,
            PieceAssembly::Open { received, .. } => received.contains(&offset),
            PieceAssembly::Verifying | PieceAssembly::Complete => true,
        }
    }

    /// Drops any partial buffer. Pieces being verified or already complete
    /// are left alone.
    pub(crate) fn release(&mut self) {
        if matches!(self, PieceAssembly::Open { .. }) {
            *self = PieceAssembly::Idle;
        }
    }

    pub(crate) fn accept(
        &mut self,
        index: u32,
        offset: u32,
        data: &[u8],
        piece_length: u64,
    ) -> Result<BlockAccept, RepositoryError> {
        let end = offset as u64 + data.len() as u64;
        if data.is_empty() || end > piece_length {
            return Err(RepositoryError::InvalidBlock {
                piece: index,
                offset,
                length: data.len() as u32,
            });
        }

        if self.is_idle() {
            *self = PieceAssembly::Open {
                buffer: vec![0; piece_length as usize],
                remaining: piece_length,
                received: HashSet::new(),
            };
        }

        let PieceAssembly::Open {
            buffer,
            remaining,
            received,
        } = self
        else {
            return Ok(BlockAccept::Duplicate);
        };

        if received.contains(&offset) {
            return Ok(BlockAccept::Duplicate);
        }
        if data.len() as u64 > *remaining {
            return Err(RepositoryError::InvalidBlock {
                piece: index,
                offset,
                length: data.len() as u32,
            });
        }

        buffer[offset as usize..end as usize].copy_from_slice(data);
        received.insert(offset);
        *remaining -= data.len() as u64;

        if *remaining > 0 {
            return Ok(BlockAccept::Accepted);
        }

        let full = std::mem::take(buffer);
        *self = PieceAssembly::Verifying;
        Ok(BlockAccept::Full(full))
    }
}
