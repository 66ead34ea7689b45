use super::error::{HandshakeError, PeerError};
use super::handshake::{Handshake, HANDSHAKE_TAIL_LEN};
use super::message::Message;
use super::peer_id::PeerId;
use crate::constants::{
    LENGTH_PREFIX_LEN, MAX_MESSAGE_SIZE, PEER_READ_TIMEOUT, PEER_WRITE_TIMEOUT, PROTOCOL_STRING,
};
use bytes::BytesMut;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::time::timeout;

/// A connection before and during the handshake.
///
/// Works over any byte stream so sessions can run on TCP sockets as well as
/// in-memory pipes.
pub struct PeerTransport<S> {
    stream: S,
    read_buf: BytesMut,
}

impl<S> PeerTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(32 * 1024),
        }
    }

    pub async fn send_handshake(&mut self, handshake: &Handshake) -> Result<(), PeerError> {
        let data = handshake.encode();
        timeout(PEER_WRITE_TIMEOUT, self.stream.write_all(&data))
            .await
            .map_err(|_| PeerError::Timeout)??;
        Ok(())
    }

    /// Reads one handshake frame and validates it.
    pub async fn receive_handshake(
        &mut self,
        info_hash: &[u8; 20],
        expected_peer: Option<&PeerId>,
    ) -> Result<Handshake, PeerError> {
        fill(&mut self.stream, &mut self.read_buf, 1, PEER_READ_TIMEOUT).await?;
        let pstrlen = self.read_buf[0] as usize;
        if pstrlen != PROTOCOL_STRING.len() {
            return Err(HandshakeError::ProtocolMismatch.into());
        }
        let total = 1 + pstrlen + HANDSHAKE_TAIL_LEN;
        fill(&mut self.stream, &mut self.read_buf, total, PEER_READ_TIMEOUT).await?;

        let data = self.read_buf.split_to(total);
        Ok(Handshake::validate(&data, info_hash, expected_peer)?)
    }

    /// Outbound side: send our handshake first, then check theirs.
    pub async fn initiate(
        &mut self,
        ours: &Handshake,
        expected_peer: Option<&PeerId>,
        limit: Duration,
    ) -> Result<Handshake, PeerError> {
        timeout(limit, async {
            self.send_handshake(ours).await?;
            self.receive_handshake(&ours.info_hash, expected_peer).await
        })
        .await
        .map_err(|_| PeerError::Timeout)?
    }

    /// Inbound side: check theirs first, answer only if it is for our torrent.
    pub async fn respond(&mut self, ours: &Handshake, limit: Duration) -> Result<Handshake, PeerError> {
        timeout(limit, async {
            let theirs = self.receive_handshake(&ours.info_hash, None).await?;
            self.send_handshake(ours).await?;
            Ok::<_, PeerError>(theirs)
        })
        .await
        .map_err(|_| PeerError::Timeout)?
    }

    /// Splits into independent read and write halves for the message phase.
    /// Bytes already buffered past the handshake stay with the reader.
    pub fn into_split(self) -> (FrameReader<ReadHalf<S>>, FrameWriter<WriteHalf<S>>) {
        let (read, write) = tokio::io::split(self.stream);
        (
            FrameReader {
                reader: read,
                read_buf: self.read_buf,
                read_timeout: PEER_READ_TIMEOUT,
            },
            FrameWriter {
                writer: write,
                write_timeout: PEER_WRITE_TIMEOUT,
            },
        )
    }
}

/// Reads length-prefixed message frames.
pub struct FrameReader<R> {
    reader: R,
    read_buf: BytesMut,
    read_timeout: Duration,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub async fn receive_message(&mut self) -> Result<Message, PeerError> {
        fill(
            &mut self.reader,
            &mut self.read_buf,
            LENGTH_PREFIX_LEN,
            self.read_timeout,
        )
        .await?;

        let length = u32::from_be_bytes([
            self.read_buf[0],
            self.read_buf[1],
            self.read_buf[2],
            self.read_buf[3],
        ]) as usize;

        if length > MAX_MESSAGE_SIZE {
            return Err(PeerError::MalformedMessage(format!(
                "message too large: {}",
                length
            )));
        }

        let total = LENGTH_PREFIX_LEN + length;
        fill(&mut self.reader, &mut self.read_buf, total, self.read_timeout).await?;

        let frame = self.read_buf.split_to(total);
        Message::decode(frame.freeze())
    }
}

/// Writes message frames.
pub struct FrameWriter<W> {
    writer: W,
    write_timeout: Duration,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub async fn send_message(&mut self, message: &Message) -> Result<(), PeerError> {
        let data = message.encode();
        timeout(self.write_timeout, self.writer.write_all(&data))
            .await
            .map_err(|_| PeerError::Timeout)??;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), PeerError> {
        timeout(self.write_timeout, self.writer.shutdown())
            .await
            .map_err(|_| PeerError::Timeout)??;
        Ok(())
    }
}

async fn fill<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut BytesMut,
    needed: usize,
    limit: Duration,
) -> Result<(), PeerError> {
    while buf.len() < needed {
        let n = timeout(limit, reader.read_buf(buf))
            .await
            .map_err(|_| PeerError::Timeout)??;

        if n == 0 {
            return Err(PeerError::ConnectionClosed);
        }
    }
    Ok(())
}
