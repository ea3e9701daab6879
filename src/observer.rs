//! Session observer and application subscriber seams.
//!
//! The session observer owns session identity: it allocates session ids,
//! derives connection keys, tracks per-service protection, and receives
//! flood/malformed escalations. The protocol handler never stores session
//! state of its own beyond outbound message counters.

use std::sync::Arc;

use bytes::Bytes;

use crate::crypto::SslContext;
use crate::protocol::{ConnectionId, ConnectionKey, ServiceType};

/// A reassembled application-level message, or one queued for sending.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Session token the message belongs to.
    pub connection_key: ConnectionKey,
    /// Protocol version of the session.
    pub protocol_version: u8,
    /// Service the message travels on.
    pub service_type: ServiceType,
    /// Message body.
    pub payload: Bytes,
}

impl Message {
    /// Payload length in bytes.
    #[inline]
    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }
}

/// Owner of session identity and lifecycle, implemented by the connection
/// layer above the protocol handler.
pub trait SessionObserver: Send + Sync {
    /// Request a new service session. Returns the allocated session id and
    /// the resumption hash, or `None` when the request is refused.
    fn start_session(
        &self,
        connection: ConnectionId,
        session_id: u8,
        service_type: ServiceType,
        protection: bool,
    ) -> Option<(u8, u32)>;

    /// End a service session. Returns the key of the ended session, or
    /// `None` when the request is refused (unknown session, wrong hash).
    fn end_session(
        &self,
        connection: ConnectionId,
        session_id: u8,
        hash_id: u32,
        service_type: ServiceType,
    ) -> Option<ConnectionKey>;

    /// Derive the opaque session token for a `(connection, session)` pair.
    /// Session 0 names the connection itself.
    fn key_of(&self, connection: ConnectionId, session_id: u8) -> ConnectionKey;

    /// Resolve a session token back to its `(connection, session)` pair.
    fn pair_of(&self, key: ConnectionKey) -> Option<(ConnectionId, u8)>;

    /// Protocol version negotiated for a session, or `None` if the session
    /// is unknown.
    fn protocol_version_of(&self, connection: ConnectionId, session_id: u8) -> Option<u8>;

    /// Whether the session's version and settings support heartbeat.
    fn heartbeat_supported(&self, connection: ConnectionId, session_id: u8) -> bool;

    /// Refresh the session's liveness timer.
    fn keep_alive(&self, connection: ConnectionId, session_id: u8);

    /// Security context of a protected service, or `None` when the service
    /// is not protected.
    fn ssl_context_of(
        &self,
        key: ConnectionKey,
        service_type: ServiceType,
    ) -> Option<Arc<dyn SslContext>>;

    /// Mark a service as protected after a completed handshake.
    fn set_protection(&self, key: ConnectionKey, service_type: ServiceType);

    /// A connection produced malformed bytes beyond the tolerated rate.
    fn on_malformed(&self, key: ConnectionKey);

    /// A connection produced well-formed frames beyond the tolerated rate.
    fn on_flood(&self, key: ConnectionKey);
}

/// Receiver of reassembled messages and send confirmations.
pub trait Subscriber: Send + Sync {
    /// A complete logical message arrived.
    fn on_message(&self, message: Message);

    /// The transport confirmed delivery of an outbound frame.
    fn on_message_sent(&self, connection: ConnectionId) {
        let _ = connection;
    }
}
