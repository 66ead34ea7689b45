use crate::storage::{RepositoryError, StorageError};
use thiserror::Error;

/// Reasons a handshake is refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    /// The protocol identifier is not "BitTorrent protocol".
    #[error("unexpected protocol identifier")]
    ProtocolMismatch,

    /// The frame is shorter or longer than its declared size.
    #[error("invalid handshake length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    /// The peer's info hash doesn't match ours.
    #[error("info hash mismatch")]
    InfoHashMismatch,

    /// The peer id differs from the one the tracker announced.
    #[error("peer id mismatch")]
    PeerIdMismatch,
}

/// Errors that can occur during peer communication.
#[derive(Debug, Error)]
pub enum PeerError {
    /// Network I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer sent an invalid handshake.
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    /// Received a frame whose payload disagrees with its message kind.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// Received an unknown message ID.
    #[error("invalid message id: {0}")]
    InvalidMessageId(u8),

    /// The connection was closed by the peer.
    #[error("connection closed")]
    ConnectionClosed,

    /// Operation timed out.
    #[error("timeout")]
    Timeout,

    /// Protocol violation by the peer.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The piece repository refused an operation.
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}

impl PeerError {
    /// Returns true if the peer broke the protocol. The connection must be
    /// dropped but the session continues.
    pub fn is_protocol_violation(&self) -> bool {
        match self {
            PeerError::Handshake(_)
            | PeerError::MalformedMessage(_)
            | PeerError::InvalidMessageId(_)
            | PeerError::Protocol(_) => true,
            PeerError::Repository(e) => !e.is_storage_failure(),
            _ => false,
        }
    }

    /// Returns true if the error comes from the local storage layer. No
    /// peer-level retry can fix it, so it is reported to the session owner.
    pub fn is_local_storage_failure(&self) -> bool {
        matches!(self, PeerError::Repository(e) if e.is_storage_failure())
    }
}

impl From<StorageError> for PeerError {
    fn from(e: StorageError) -> Self {
        PeerError::Repository(RepositoryError::Storage(e))
    }
}
