use thiserror::Error;

/// Errors that can occur during peer communication.
///
/// All of these are confined to the offending session; none of them touch
/// the controller or other peers.
#[derive(Debug, Error)]
pub enum PeerError {
    /// Network I/O error (dial refused, reset, EOF mid-frame).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer sent a handshake with the wrong length byte or protocol
    /// string.
    #[error("handshake mismatch: {0}")]
    HandshakeMismatch(String),

    /// The peer's info hash doesn't match ours.
    #[error("info hash mismatch")]
    InfoHashMismatch,

    /// Received a malformed protocol message.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Received an unknown message ID.
    #[error("invalid message id: {0}")]
    InvalidMessageId(u8),

    /// The connection was closed by the peer.
    #[error("connection closed")]
    ConnectionClosed,

    /// Nothing was received within the keepalive window.
    #[error("idle timeout")]
    IdleTimeout,

    /// A bounded operation (dial, handshake, write) timed out.
    #[error("timeout")]
    Timeout,
}
