use bytes::Bytes;

/// A `(piece, offset, length)` sub-range requested from a peer.
///
/// Sessions key their outstanding requests by this triple, so a `piece`
/// message only matches a request with the same length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRequest {
    pub piece: u32,
    pub offset: u32,
    pub length: u32,
}

impl BlockRequest {
    pub fn new(piece: u32, offset: u32, length: u32) -> Self {
        Self {
            piece,
            offset,
            length,
        }
    }

    /// Offset one past the last byte of the block within its piece.
    pub fn end(&self) -> u64 {
        self.offset as u64 + self.length as u64
    }

    /// True for a non-empty range that ends inside a piece of
    /// `piece_length` bytes.
    pub fn fits(&self, piece_length: u64) -> bool {
        self.length > 0 && self.end() <= piece_length
    }
}

/// Block data carried by a `piece` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub piece: u32,
    pub offset: u32,
    pub data: Bytes,
}

impl Block {
    pub fn new(piece: u32, offset: u32, data: Bytes) -> Self {
        Self {
            piece,
            offset,
            data,
        }
    }

    /// The request this block answers.
    pub fn request(&self) -> BlockRequest {
        BlockRequest::new(self.piece, self.offset, self.data.len() as u32)
    }
}
