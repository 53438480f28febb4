use super::error::PeerError;
use super::message::{Handshake, Message, HANDSHAKE_LEN};
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::constants::{MAX_MESSAGE_SIZE, WRITE_TIMEOUT};

/// Reads handshakes and length-prefixed frames off the inbound half of a
/// peer connection.
///
/// The session owns timing policy; this type only accumulates bytes and
/// cuts frames, so a cancelled read leaves the buffer consistent and the
/// next call picks up where it left off.
pub struct MessageReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(32 * 1024),
        }
    }

    async fn fill(&mut self, wanted: usize) -> Result<(), PeerError> {
        while self.buf.len() < wanted {
            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(PeerError::ConnectionClosed);
            }
        }
        Ok(())
    }

    pub async fn receive_handshake(&mut self) -> Result<Handshake, PeerError> {
        self.fill(HANDSHAKE_LEN).await?;
        let data = self.buf.split_to(HANDSHAKE_LEN);
        Handshake::decode(&data)
    }

    /// Receives one complete message, keepalives included.
    pub async fn receive_message(&mut self) -> Result<Message, PeerError> {
        self.fill(4).await?;

        let length =
            u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;

        if length > MAX_MESSAGE_SIZE {
            return Err(PeerError::InvalidMessage(format!(
                "message too large: {}",
                length
            )));
        }

        let total_len = 4 + length;
        self.fill(total_len).await?;

        let data = self.buf.split_to(total_len);
        Message::decode(data.freeze())
    }
}

/// Writes handshakes and frames to the outbound half of a peer connection.
///
/// Every write is bounded by [`WRITE_TIMEOUT`] so a stalled remote cannot
/// wedge the session loop.
pub struct MessageWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Sends the handshake, returning the number of bytes written.
    pub async fn send_handshake(&mut self, handshake: &Handshake) -> Result<usize, PeerError> {
        let data = handshake.encode();
        timeout(WRITE_TIMEOUT, self.inner.write_all(&data))
            .await
            .map_err(|_| PeerError::Timeout)??;
        Ok(data.len())
    }

    /// Sends one message, returning the number of bytes written.
    pub async fn send_message(&mut self, message: &Message) -> Result<usize, PeerError> {
        let data = message.encode();
        timeout(WRITE_TIMEOUT, self.inner.write_all(&data))
            .await
            .map_err(|_| PeerError::Timeout)??;
        Ok(data.len())
    }
}
