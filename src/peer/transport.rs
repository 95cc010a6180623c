use super::error::PeerError;
use super::message::{Handshake, Message, HANDSHAKE_LEN};
use crate::config::MAX_FRAME_SIZE;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Length-prefixed framing over a byte stream.
///
/// Generic over the stream type so a connected socket can be split into an
/// owned read half (message parsing keeps the partial-frame buffer) and an
/// owned write half (driven by the outbound queue task).
pub struct PeerTransport<S = TcpStream> {
    stream: S,
    read_buf: BytesMut,
}

impl<S> PeerTransport<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(32 * 1024),
        }
    }

    pub fn into_parts(self) -> (S, BytesMut) {
        (self.stream, self.read_buf)
    }

    pub fn from_parts(stream: S, read_buf: BytesMut) -> Self {
        Self { stream, read_buf }
    }
}

impl<S: AsyncWrite + Unpin> PeerTransport<S> {
    pub async fn send_handshake(&mut self, handshake: &Handshake) -> Result<(), PeerError> {
        self.stream.write_all(&handshake.encode()).await?;
        Ok(())
    }

    pub async fn send_message(&mut self, message: &Message) -> Result<(), PeerError> {
        self.stream.write_all(&message.encode()).await?;
        Ok(())
    }
}

impl<S: AsyncRead + Unpin> PeerTransport<S> {
    pub async fn receive_handshake(&mut self) -> Result<Handshake, PeerError> {
        self.fill_to(HANDSHAKE_LEN).await?;
        let data = self.read_buf.split_to(HANDSHAKE_LEN);
        Handshake::decode(&data)
    }

    /// Reads the next parseable message, silently skipping frames with
    /// unknown IDs (extension traffic we don't speak).
    pub async fn receive_message(&mut self) -> Result<Message, PeerError> {
        loop {
            self.fill_to(4).await?;
            let length = u32::from_be_bytes([
                self.read_buf[0],
                self.read_buf[1],
                self.read_buf[2],
                self.read_buf[3],
            ]) as usize;

            if length > MAX_FRAME_SIZE {
                return Err(PeerError::InvalidMessage("frame too large"));
            }

            self.fill_to(4 + length).await?;
            let frame = self.read_buf.split_to(4 + length);

            match Message::decode(frame.freeze()) {
                Ok(message) => return Ok(message),
                Err(PeerError::UnknownMessageId(id)) => {
                    tracing::trace!(id, "skipping unknown message");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fill_to(&mut self, target: usize) -> Result<(), PeerError> {
        while self.read_buf.len() < target {
            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(PeerError::ConnectionClosed);
            }
        }
        Ok(())
    }
}
