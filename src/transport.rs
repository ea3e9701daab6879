//! Transport seam.
//!
//! The transport is an opaque byte carrier: it delivers inbound byte runs
//! through the handler's `on_bytes` callback and accepts serialized frames
//! here. Connection lifecycle events likewise arrive through the handler's
//! callbacks.

use bytes::Bytes;

use crate::error::Result;
use crate::protocol::ConnectionId;

/// Outbound byte carrier implemented by the transport layer.
pub trait Transport: Send + Sync {
    /// Queue a serialized frame for delivery on a connection.
    fn send(&self, connection: ConnectionId, data: Bytes) -> Result<()>;

    /// Close a connection after queued data drains.
    fn disconnect(&self, connection: ConnectionId);

    /// Tear a connection down immediately, discarding queued data.
    fn disconnect_force(&self, connection: ConnectionId);
}
