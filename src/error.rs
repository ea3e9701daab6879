//! Error types for devicelink.

use thiserror::Error;

use crate::protocol::{ConnectionId, MalformedHeader};

/// Main error type for protocol handler operations.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A header failed validation.
    #[error("malformed header: {0}")]
    Malformed(#[from] MalformedHeader),

    /// Bytes arrived for a connection the parser does not know.
    #[error("unknown connection {0:?}")]
    UnknownConnection(ConnectionId),

    /// The session observer does not know the connection or session.
    #[error("connection or session does not exist")]
    SessionNotFound,

    /// Heartbeat requested on a protocol version without heartbeat support.
    #[error("heartbeat is not supported on this protocol version")]
    HeartbeatNotSupported,

    /// The crypto gateway refused the frame or the context failed.
    #[error("encryption failed")]
    EncryptionFailed,

    /// The transport rejected an outbound frame.
    #[error("transport send failed")]
    TransportFailed,

    /// The handler was stopped and no longer accepts work.
    #[error("protocol handler is stopped")]
    Stopped,
}

/// Result type alias using [`ProtocolError`].
pub type Result<T> = std::result::Result<T, ProtocolError>;
