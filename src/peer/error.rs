use thiserror::Error;

/// Errors on a single peer connection. All of them are peer-scoped: the
/// connection drops and the session carries on.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid handshake")]
    InvalidHandshake,

    #[error("info hash mismatch")]
    InfoHashMismatch,

    /// The peer presented our own ID — we connected to ourselves.
    #[error("connected to self")]
    SelfConnection,

    #[error("malformed message: {0}")]
    InvalidMessage(&'static str),

    /// Unknown message ID; the frame is skipped, not fatal.
    #[error("unknown message id {0}")]
    UnknownMessageId(u8),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("timed out")]
    Timeout,

    /// Outbound queue overflow: the peer is not draining what we send.
    #[error("peer too slow: outbound queue full")]
    SlowPeer,

    /// Repeated protocol abuse (bad bitfield, bogus requests, bad hashes).
    #[error("peer misbehavior: {0}")]
    Misbehavior(&'static str),
}
