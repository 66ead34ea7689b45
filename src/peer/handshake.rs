use super::error::HandshakeError;
use super::peer_id::PeerId;
use crate::constants::{HASH_LEN, PROTOCOL_STRING, RESERVED_BYTES};
use bytes::{BufMut, Bytes, BytesMut};

/// Bytes following the protocol string: reserved, info hash and peer id.
pub const HANDSHAKE_TAIL_LEN: usize = 8 + HASH_LEN + HASH_LEN;

/// Full handshake length for the standard protocol string (68 bytes).
pub const HANDSHAKE_LEN: usize = 1 + PROTOCOL_STRING.len() + HANDSHAKE_TAIL_LEN;

/// The first frame exchanged on every connection.
///
/// `<pstrlen><pstr><8 reserved bytes><20-byte info hash><20-byte peer id>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: PeerId,
    pub reserved: [u8; 8],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: PeerId) -> Self {
        Self {
            info_hash,
            peer_id,
            reserved: RESERVED_BYTES,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL_STRING.len() as u8);
        buf.put_slice(PROTOCOL_STRING);
        buf.put_slice(&self.reserved);
        buf.put_slice(&self.info_hash);
        buf.put_slice(self.peer_id.as_bytes());
        buf.freeze()
    }

    /// Parses a handshake frame.
    ///
    /// The protocol string is checked first, then the frame length against
    /// the size the protocol string length declares. Reserved bytes are
    /// kept but otherwise ignored.
    pub fn decode(data: &[u8]) -> Result<Self, HandshakeError> {
        let pstrlen = *data.first().ok_or(HandshakeError::ProtocolMismatch)? as usize;

        if pstrlen != PROTOCOL_STRING.len()
            || data.len() < 1 + pstrlen
            || &data[1..1 + pstrlen] != PROTOCOL_STRING
        {
            return Err(HandshakeError::ProtocolMismatch);
        }

        let expected = 1 + pstrlen + HANDSHAKE_TAIL_LEN;
        if data.len() != expected {
            return Err(HandshakeError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }

        let rest = &data[1 + pstrlen..];

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&rest[..8]);

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&rest[8..28]);

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&rest[28..48]);

        Ok(Self {
            info_hash,
            peer_id: PeerId(peer_id),
            reserved,
        })
    }

    /// Parses and validates a handshake received from a peer.
    ///
    /// Besides the framing checks of [`Handshake::decode`], the info hash
    /// must be ours and, for outbound connections where the tracker told us
    /// who to expect, the peer id must match.
    pub fn validate(
        data: &[u8],
        info_hash: &[u8; 20],
        expected_peer: Option<&PeerId>,
    ) -> Result<Self, HandshakeError> {
        let handshake = Self::decode(data)?;

        if &handshake.info_hash != info_hash {
            return Err(HandshakeError::InfoHashMismatch);
        }

        if let Some(expected) = expected_peer {
            if expected != &handshake.peer_id {
                return Err(HandshakeError::PeerIdMismatch);
            }
        }

        Ok(handshake)
    }
}
