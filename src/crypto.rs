//! Per-frame encryption and decryption gateway.
//!
//! Data-service frames of a protected service travel encrypted; control
//! frames and control-service data never do. The gateway resolves the
//! security context for a frame's `(connection, session, service)` and
//! applies it, leaving the frame untouched when no initialized context
//! exists on the egress side. On the ingress side a protected frame
//! without an initialized context is a protocol violation.
//!
//! Cryptographic primitives live behind [`SslContext`]; the gateway only
//! shuttles payloads through them and enforces the cleartext rules.

use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, error};

use crate::error::{ProtocolError, Result};
use crate::observer::SessionObserver;
use crate::protocol::{ConnectionKey, Frame, ServiceType};

/// Error text produced by a security context operation.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct SslError(pub String);

/// Internal error codes forwarded to the security manager's error channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SecurityError {
    /// Payload encryption failed.
    #[error("encryption failed")]
    EncryptionFailed,
    /// Payload decryption failed.
    #[error("decryption failed")]
    DecryptionFailed,
    /// Protected frame arrived for a service with no initialized context.
    #[error("service is not protected")]
    ServiceNotProtected,
    /// Service start requested protection on an already protected service.
    #[error("service is already protected")]
    ServiceAlreadyProtected,
    /// Context creation or other internal failure.
    #[error("internal security error")]
    Internal,
}

/// A per-session TLS-style context created by the security manager.
pub trait SslContext: Send + Sync {
    /// Whether the handshake completed and the context can cipher data.
    fn is_init_complete(&self) -> bool;

    /// Whether a handshake is currently in flight.
    fn is_handshake_pending(&self) -> bool;

    /// Encrypt a payload.
    fn encrypt(&self, data: &[u8]) -> std::result::Result<Vec<u8>, SslError>;

    /// Decrypt a payload.
    fn decrypt(&self, data: &[u8]) -> std::result::Result<Vec<u8>, SslError>;

    /// Largest plaintext that fits a frame of `raw_size` once encrypted.
    fn max_block_size(&self, raw_size: usize) -> usize;
}

/// Handshake orchestration, implemented by the security component.
pub trait SecurityManager: Send + Sync {
    /// Obtain or create the context for a session.
    fn create_context(&self, key: ConnectionKey) -> Option<Arc<dyn SslContext>>;

    /// Begin the handshake for a session.
    fn start_handshake(&self, key: ConnectionKey);

    /// Report an internal security failure on the error channel.
    fn send_internal_error(&self, key: ConnectionKey, error: SecurityError, text: &str);
}

/// Encrypt an outbound frame in place.
///
/// Control frames and control-service frames pass through unchanged, as do
/// frames of services without an initialized context. A context failure
/// reports `ERROR_ENCRYPTION_FAILED`, ends the owning session, and drops
/// the frame by returning an error.
pub fn encrypt_frame(
    frame: &mut Frame,
    observer: &dyn SessionObserver,
    security: &dyn SecurityManager,
) -> Result<()> {
    if frame.service_type() == ServiceType::Control || frame.is_control() {
        return Ok(());
    }
    let key = observer.key_of(frame.connection_id, frame.session_id());
    let Some(context) = observer.ssl_context_of(key, frame.service_type()) else {
        return Ok(());
    };
    if !context.is_init_complete() {
        return Ok(());
    }
    match context.encrypt(frame.payload()) {
        Ok(ciphertext) => {
            debug!(
                from = frame.payload.len(),
                to = ciphertext.len(),
                "encrypted frame payload"
            );
            frame.set_payload(Bytes::from(ciphertext));
            frame.header.protected = true;
            Ok(())
        }
        Err(reason) => {
            error!(%reason, ?key, "frame encryption failed, ending session");
            security.send_internal_error(key, SecurityError::EncryptionFailed, &reason.0);
            // Close the session to prevent cleartext leaking on a
            // protected service.
            observer.end_session(
                frame.connection_id,
                frame.session_id(),
                frame.message_id(),
                ServiceType::Rpc,
            );
            Err(ProtocolError::EncryptionFailed)
        }
    }
}

/// Decrypt an inbound frame in place.
///
/// Only data frames carrying the protection bit are touched. A protected
/// frame without an initialized context reports
/// `ERROR_SERVICE_NOT_PROTECTED`; a context failure reports
/// `ERROR_DECRYPTION_FAILED` and ends the owning session. Either way the
/// frame is rejected.
pub fn decrypt_frame(
    frame: &mut Frame,
    observer: &dyn SessionObserver,
    security: &dyn SecurityManager,
) -> Result<()> {
    if !frame.header.protected
        || frame.service_type() == ServiceType::Control
        || frame.is_control()
    {
        return Ok(());
    }
    let key = observer.key_of(frame.connection_id, frame.session_id());
    let context = observer
        .ssl_context_of(key, frame.service_type())
        .filter(|context| context.is_init_complete());
    let Some(context) = context else {
        error!(?key, service = ?frame.service_type(), "protected frame on unprotected service");
        security.send_internal_error(
            key,
            SecurityError::ServiceNotProtected,
            "decryption attempted on an unprotected service",
        );
        return Err(ProtocolError::EncryptionFailed);
    };
    match context.decrypt(frame.payload()) {
        Ok(plaintext) => {
            debug!(
                from = frame.payload.len(),
                to = plaintext.len(),
                "decrypted frame payload"
            );
            frame.set_payload(Bytes::from(plaintext));
            frame.header.protected = false;
            Ok(())
        }
        Err(reason) => {
            error!(%reason, ?key, "frame decryption failed, ending session");
            security.send_internal_error(key, SecurityError::DecryptionFailed, &reason.0);
            observer.end_session(
                frame.connection_id,
                frame.session_id(),
                frame.message_id(),
                ServiceType::Rpc,
            );
            Err(ProtocolError::EncryptionFailed)
        }
    }
}
