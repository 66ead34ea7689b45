use super::error::PeerError;
use super::piece::BlockRequest;
use crate::constants::LENGTH_PREFIX_LEN;
use bytes::{Buf, BufMut, Bytes, BytesMut};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
}

impl TryFrom<u8> for MessageId {
    type Error = PeerError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            _ => Err(PeerError::InvalidMessageId(value)),
        }
    }
}

/// A peer wire message.
///
/// Frames are `<4-byte big-endian length>[<1-byte id>[<payload>]]`; a zero
/// length frame is a keep-alive. The codec only checks framing. Piece indices
/// and block bounds are checked by the peer session against the repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece: u32 },
    Bitfield(Bytes),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, data: Bytes },
    Cancel { index: u32, begin: u32, length: u32 },
}

impl Message {
    pub fn request(block: &BlockRequest) -> Self {
        Message::Request {
            index: block.piece,
            begin: block.offset,
            length: block.length,
        }
    }

    pub fn cancel(block: &BlockRequest) -> Self {
        Message::Cancel {
            index: block.piece,
            begin: block.offset,
            length: block.length,
        }
    }

    /// Message kind used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Message::KeepAlive => "keep-alive",
            Message::Choke => "choke",
            Message::Unchoke => "unchoke",
            Message::Interested => "interested",
            Message::NotInterested => "not-interested",
            Message::Have { .. } => "have",
            Message::Bitfield(_) => "bitfield",
            Message::Request { .. } => "request",
            Message::Piece { .. } => "piece",
            Message::Cancel { .. } => "cancel",
        }
    }

    /// Length of the encoded frame, prefix included.
    pub fn encoded_len(&self) -> usize {
        LENGTH_PREFIX_LEN
            + match self {
                Message::KeepAlive => 0,
                Message::Choke
                | Message::Unchoke
                | Message::Interested
                | Message::NotInterested => 1,
                Message::Have { .. } => 5,
                Message::Bitfield(bits) => 1 + bits.len(),
                Message::Request { .. } | Message::Cancel { .. } => 13,
                Message::Piece { data, .. } => 9 + data.len(),
            }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());

        match self {
            Message::KeepAlive => {
                buf.put_u32(0);
            }
            Message::Choke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Choke as u8);
            }
            Message::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Unchoke as u8);
            }
            Message::Interested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Interested as u8);
            }
            Message::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::NotInterested as u8);
            }
            Message::Have { piece } => {
                buf.put_u32(5);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(*piece);
            }
            Message::Bitfield(bits) => {
                buf.put_u32(1 + bits.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(bits);
            }
            Message::Request {
                index,
                begin,
                length,
            } => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece { index, begin, data } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(data);
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Cancel as u8);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
        }

        buf.freeze()
    }

    /// Decodes one complete frame, length prefix included.
    ///
    /// The frame must hold exactly the number of bytes its prefix declares,
    /// and the payload must have the size its message kind mandates.
    pub fn decode(mut data: Bytes) -> Result<Self, PeerError> {
        if data.len() < LENGTH_PREFIX_LEN {
            return Err(PeerError::MalformedMessage("too short".into()));
        }

        let length = data.get_u32() as usize;

        if data.remaining() != length {
            return Err(PeerError::MalformedMessage(format!(
                "declared length {} but frame carries {} bytes",
                length,
                data.remaining()
            )));
        }

        if length == 0 {
            return Ok(Message::KeepAlive);
        }

        let id = MessageId::try_from(data.get_u8())?;
        let payload_len = length - 1;

        let expect = |expected: usize, name: &str| -> Result<(), PeerError> {
            if payload_len == expected {
                Ok(())
            } else {
                Err(PeerError::MalformedMessage(format!(
                    "{} payload must be {} bytes, got {}",
                    name, expected, payload_len
                )))
            }
        };

        match id {
            MessageId::Choke => {
                expect(0, "choke")?;
                Ok(Message::Choke)
            }
            MessageId::Unchoke => {
                expect(0, "unchoke")?;
                Ok(Message::Unchoke)
            }
            MessageId::Interested => {
                expect(0, "interested")?;
                Ok(Message::Interested)
            }
            MessageId::NotInterested => {
                expect(0, "not interested")?;
                Ok(Message::NotInterested)
            }
            MessageId::Have => {
                expect(4, "have")?;
                Ok(Message::Have {
                    piece: data.get_u32(),
                })
            }
            MessageId::Bitfield => Ok(Message::Bitfield(data.copy_to_bytes(payload_len))),
            MessageId::Request => {
                expect(12, "request")?;
                Ok(Message::Request {
                    index: data.get_u32(),
                    begin: data.get_u32(),
                    length: data.get_u32(),
                })
            }
            MessageId::Piece => {
                if payload_len < 8 {
                    return Err(PeerError::MalformedMessage("piece too short".into()));
                }
                let index = data.get_u32();
                let begin = data.get_u32();
                let block_data = data.copy_to_bytes(payload_len - 8);
                Ok(Message::Piece {
                    index,
                    begin,
                    data: block_data,
                })
            }
            MessageId::Cancel => {
                expect(12, "cancel")?;
                Ok(Message::Cancel {
                    index: data.get_u32(),
                    begin: data.get_u32(),
                    length: data.get_u32(),
                })
            }
        }
    }
}
