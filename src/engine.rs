//! Protocol engine: ingress and egress pipelines and the control
//! sub-protocol state machine.
//!
//! # Architecture
//!
//! ```text
//! transport on_bytes ─► IncomingDataHandler ─► decrypt ─► ingress queue ─► ingress worker
//!                                                                          │ reassembly
//!                                                                          │ control frames
//!                                                                          ▼
//!                                                                      subscribers
//!
//! send_message ─► fragmentation ─► egress queue ─► egress worker ─► encrypt ─► transport
//! transport on_bytes_sent ────────────────────────► egress worker (close scheduling)
//! ```
//!
//! Two dedicated workers consume the queues. The ingress worker owns the
//! multi-frame assembler, so per-connection frame order is preserved
//! end-to-end without locking. The egress worker owns the final-send
//! tracker and the ready-to-close set, and is the only place transport
//! delivery confirmations are interpreted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::crypto::{decrypt_frame, encrypt_frame, SecurityError, SecurityManager};
use crate::error::{ProtocolError, Result};
use crate::meter::FrequencyMeter;
use crate::observer::{Message, SessionObserver, Subscriber};
use crate::protocol::{
    frame_data, header_size, AssemblyOutcome, ConnectionId, ConnectionKey, Frame, FrameHeader,
    FrameType, IncomingDataHandler, MultiFrameAssembler, ProcessStatus, ServiceType,
    FIRST_FRAME_DATA_SIZE, HASH_ID_NOT_SUPPORTED, HASH_ID_WRONG, MAX_CONSECUTIVE,
    PROTOCOL_VERSION_1, PROTOCOL_VERSION_2, PROTOCOL_VERSION_3, PROTOCOL_VERSION_4,
};
use crate::transport::Transport;

/// Work items for the ingress worker.
enum IngressEvent {
    /// A decrypted, well-formed frame in wire order.
    Frame(Frame),
    /// The transport closed a connection; drop its reassembly slots.
    ConnectionClosed(ConnectionId),
    /// Drain and stop.
    Shutdown,
}

/// Work items for the egress worker.
enum EgressEvent {
    /// A numbered frame ready to encrypt and serialize.
    Frame {
        frame: Frame,
        /// The connection closes once this frame is confirmed sent.
        is_final: bool,
    },
    /// The transport confirmed delivery of previously sent bytes.
    Sent {
        connection: ConnectionId,
        data: Bytes,
    },
    /// Drain and stop.
    Shutdown,
}

/// Captured state of a start-service request awaiting its handshake.
///
/// One-shot: the slot is removed from the registry when the handshake
/// completes, so a listener can never fire twice.
#[derive(Debug, Clone)]
struct PendingStart {
    connection: ConnectionId,
    session_id: u8,
    protocol_version: u8,
    hash_id: u32,
    service_type: ServiceType,
}

/// The protocol handler core.
///
/// Sits between a [`Transport`] and the application subscribers, driving
/// frame parsing, reassembly, the control sub-protocol, rate metering, and
/// per-frame encryption. Constructed with [`ProtocolHandler::start`], which
/// spawns the two pipeline workers on the current tokio runtime.
pub struct ProtocolHandler {
    inner: Arc<Inner>,
    ingress_tx: mpsc::UnboundedSender<IngressEvent>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

struct Inner {
    config: Config,
    session_observer: Arc<dyn SessionObserver>,
    security_manager: Option<Arc<dyn SecurityManager>>,
    transport: Arc<dyn Transport>,
    subscribers: Mutex<Vec<Arc<dyn Subscriber>>>,
    incoming: Mutex<IncomingDataHandler>,
    message_meter: FrequencyMeter,
    malformed_meter: FrequencyMeter,
    /// session id -> next outbound message id. Shared by the send path and
    /// the ingress worker (end-service erases).
    counters: Mutex<HashMap<u8, u32>>,
    pending_starts: Mutex<HashMap<ConnectionKey, PendingStart>>,
    egress_tx: mpsc::UnboundedSender<EgressEvent>,
    stopped: AtomicBool,
}

impl ProtocolHandler {
    /// Build the handler and spawn its ingress and egress workers.
    ///
    /// Must be called from within a tokio runtime. `security_manager` is
    /// optional; without one, frames pass the crypto gateway untouched and
    /// protected service starts are acknowledged without protection.
    pub fn start(
        config: Config,
        session_observer: Arc<dyn SessionObserver>,
        security_manager: Option<Arc<dyn SecurityManager>>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let (ingress_tx, ingress_rx) = mpsc::unbounded_channel();
        let (egress_tx, egress_rx) = mpsc::unbounded_channel();

        if config.message_frequency_time > 0 && config.message_frequency_count > 0 {
            debug!(
                count = config.message_frequency_count,
                window_ms = config.message_frequency_time,
                "frequency meter enabled"
            );
        } else {
            warn!("frequency meter disabled");
        }
        if !config.malformed_message_filtering {
            warn!("malformed message filtering disabled, connections are reported on first malformed byte");
        }

        let inner = Arc::new(Inner {
            message_meter: FrequencyMeter::new(
                config.message_frequency_time,
                config.message_frequency_count,
            ),
            malformed_meter: FrequencyMeter::new(
                config.malformed_message_frequency_time,
                config.malformed_message_frequency_count,
            ),
            incoming: Mutex::new(IncomingDataHandler::new(config.maximum_payload_size)),
            config,
            session_observer,
            security_manager,
            transport,
            subscribers: Mutex::new(Vec::new()),
            counters: Mutex::new(HashMap::new()),
            pending_starts: Mutex::new(HashMap::new()),
            egress_tx,
            stopped: AtomicBool::new(false),
        });

        let ingress = tokio::spawn(ingress_worker(inner.clone(), ingress_rx));
        let egress = tokio::spawn(egress_worker(inner.clone(), egress_rx));

        Self {
            inner,
            ingress_tx,
            workers: Mutex::new(vec![ingress, egress]),
        }
    }

    /// Register an application subscriber.
    pub fn add_subscriber(&self, subscriber: Arc<dyn Subscriber>) {
        self.inner
            .subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .push(subscriber);
    }

    /// Unregister a previously added subscriber.
    pub fn remove_subscriber(&self, subscriber: &Arc<dyn Subscriber>) {
        self.inner
            .subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .retain(|existing| !Arc::ptr_eq(existing, subscriber));
    }

    /// The transport opened a connection: allocate its parse state.
    pub fn on_connection_opened(&self, connection: ConnectionId) {
        self.inner
            .incoming
            .lock()
            .expect("parser lock poisoned")
            .add_connection(connection);
    }

    /// The transport closed a connection: discard parse state, meter
    /// history, and in-progress reassembly. No frame from this connection
    /// is delivered after the close is processed.
    pub fn on_connection_closed(&self, connection: ConnectionId) {
        self.inner
            .incoming
            .lock()
            .expect("parser lock poisoned")
            .remove_connection(connection);
        self.inner.message_meter.clear();
        self.inner.malformed_meter.clear();
        let _ = self
            .ingress_tx
            .send(IngressEvent::ConnectionClosed(connection));
    }

    /// The transport delivered a run of bytes for a connection.
    ///
    /// Runs the parser synchronously on the caller's thread, applies the
    /// malformed-traffic policy, decrypts data frames, and queues the
    /// survivors for the ingress worker in wire order.
    pub fn on_bytes(&self, connection: ConnectionId, data: &[u8]) {
        let outcome = {
            let mut incoming = self.inner.incoming.lock().expect("parser lock poisoned");
            incoming.process(connection, data)
        };
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(error) => {
                error!(%error, ?connection, "incoming data processing failed");
                self.inner.transport.disconnect_force(connection);
                return;
            }
        };

        if outcome.status == ProcessStatus::MalformedOccurs {
            warn!(
                ?connection,
                bytes = outcome.malformed_bytes,
                "malformed bytes on connection"
            );
            let key = self.inner.session_observer.key_of(connection, 0);
            if !self.inner.config.malformed_message_filtering {
                // Escalate immediately and suppress whatever else the
                // batch produced.
                self.inner.session_observer.on_malformed(key);
                return;
            }
            if !outcome.frames.is_empty() {
                let rate = self
                    .inner
                    .malformed_meter
                    .track(key, outcome.malformed_bytes);
                if rate > self.inner.malformed_meter.max_per_window() {
                    warn!(?connection, rate, "malformed rate over limit");
                    self.inner.session_observer.on_malformed(key);
                    self.inner.malformed_meter.remove(key);
                }
            }
        }

        for mut frame in outcome.frames {
            if let Some(security) = &self.inner.security_manager {
                let decrypted = decrypt_frame(
                    &mut frame,
                    self.inner.session_observer.as_ref(),
                    security.as_ref(),
                );
                if decrypted.is_err() {
                    warn!(?connection, "frame decryption failed, frame skipped");
                    continue;
                }
            }
            let _ = self.ingress_tx.send(IngressEvent::Frame(frame));
        }
    }

    /// The transport confirmed that previously queued bytes were sent.
    pub fn on_bytes_sent(&self, connection: ConnectionId, data: Bytes) {
        let _ = self
            .inner
            .egress_tx
            .send(EgressEvent::Sent { connection, data });
    }

    /// Queue a logical message for sending, fragmenting when it exceeds
    /// the (possibly encrypted) per-frame payload ceiling.
    ///
    /// With `is_final` set, the connection is scheduled for disconnect
    /// once the transport confirms the terminating frame.
    pub fn send_message(&self, message: Message, is_final: bool) -> Result<()> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(ProtocolError::Stopped);
        }
        self.inner.send_message(message, is_final)
    }

    /// Send a heartbeat request on a session.
    pub fn send_heart_beat(&self, connection: ConnectionId, session_id: u8) -> Result<()> {
        let version = self
            .inner
            .session_observer
            .protocol_version_of(connection, session_id)
            .ok_or(ProtocolError::SessionNotFound)?;
        let message_id = self.inner.next_message_id(session_id);
        self.inner.post_frame(
            Frame::control(
                connection,
                version,
                ServiceType::Control,
                frame_data::HEART_BEAT,
                session_id,
                message_id,
                Bytes::new(),
            ),
            false,
        );
        Ok(())
    }

    /// Send an END_SERVICE request for one service of a session.
    pub fn send_end_service(
        &self,
        connection: ConnectionId,
        session_id: u8,
        service_type: ServiceType,
    ) -> Result<()> {
        self.inner
            .send_end_service(connection, session_id, service_type)
    }

    /// Send a SERVICE_DATA_ACK flow-control frame: the number of streaming
    /// frames consumed since the last acknowledgement.
    pub fn send_frames_number(&self, key: ConnectionKey, frame_count: u32) -> Result<()> {
        let (connection, session_id) = self
            .inner
            .session_observer
            .pair_of(key)
            .ok_or(ProtocolError::SessionNotFound)?;
        let version = self
            .inner
            .session_observer
            .protocol_version_of(connection, session_id)
            .ok_or(ProtocolError::SessionNotFound)?;
        let message_id = self.inner.next_message_id(session_id);
        self.inner.post_frame(
            Frame::control(
                connection,
                version,
                ServiceType::Video,
                frame_data::SERVICE_DATA_ACK,
                session_id,
                message_id,
                Bytes::copy_from_slice(&frame_count.to_be_bytes()),
            ),
            false,
        );
        debug!(?key, frame_count, "service data ack queued");
        Ok(())
    }

    /// Resolve a pending protected service start after its handshake
    /// finished. Returns whether a pending start was waiting on this key.
    ///
    /// The pending slot is consumed either way; a second completion for
    /// the same key is a no-op.
    pub fn on_handshake_done(&self, key: ConnectionKey, success: bool) -> bool {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return false;
        }
        self.inner.on_handshake_done(key, success)
    }

    /// Stop both workers: in-flight work is drained, the queues are
    /// discarded, and pending handshake listeners are disarmed.
    pub async fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner
            .pending_starts
            .lock()
            .expect("pending start lock poisoned")
            .clear();
        let _ = self.ingress_tx.send(IngressEvent::Shutdown);
        let _ = self.inner.egress_tx.send(EgressEvent::Shutdown);
        let workers = {
            let mut workers = self.workers.lock().expect("worker lock poisoned");
            std::mem::take(&mut *workers)
        };
        for worker in workers {
            if let Err(error) = worker.await {
                warn!(%error, "pipeline worker panicked");
            }
        }
    }
}

impl Inner {
    /// Allocate the next outbound message id of a session.
    fn next_message_id(&self, session_id: u8) -> u32 {
        let mut counters = self.counters.lock().expect("counter lock poisoned");
        let counter = counters.entry(session_id).or_insert(0);
        let id = *counter;
        *counter += 1;
        id
    }

    fn post_frame(&self, frame: Frame, is_final: bool) {
        if self
            .egress_tx
            .send(EgressEvent::Frame { frame, is_final })
            .is_err()
        {
            warn!("egress queue is gone, frame dropped");
        }
    }

    fn notify_subscribers(&self, message: Message) {
        let subscribers = self.subscribers.lock().expect("subscriber lock poisoned");
        for subscriber in subscribers.iter() {
            subscriber.on_message(message.clone());
        }
    }

    // ---- egress ----

    fn send_message(&self, message: Message, is_final: bool) -> Result<()> {
        let (connection, session_id) = self
            .session_observer
            .pair_of(message.connection_key)
            .ok_or(ProtocolError::SessionNotFound)?;

        let mut max_frame_size = (self.config.maximum_payload_size as usize)
            .saturating_sub(header_size(message.protocol_version));
        if max_frame_size == 0 {
            error!("maximum payload size does not fit a header");
            return Err(ProtocolError::TransportFailed);
        }
        if let Some(context) = self
            .session_observer
            .ssl_context_of(message.connection_key, message.service_type)
        {
            if context.is_init_complete() {
                let block_size = context.max_block_size(max_frame_size);
                if block_size > 0 {
                    max_frame_size = block_size;
                } else {
                    error!("security returned a zero block size, using the raw ceiling");
                }
            }
        }

        if message.payload.len() <= max_frame_size {
            self.send_single_frame(connection, session_id, &message, is_final)
        } else {
            debug!(
                size = message.payload.len(),
                max_frame_size, "message will be sent in multiple frames"
            );
            self.send_multi_frame(connection, session_id, &message, max_frame_size, is_final)
        }
    }

    fn send_single_frame(
        &self,
        connection: ConnectionId,
        session_id: u8,
        message: &Message,
        is_final: bool,
    ) -> Result<()> {
        let header = FrameHeader::new(
            message.protocol_version,
            false,
            FrameType::Single,
            message.service_type,
            frame_data::SINGLE,
            session_id,
            message.payload.len() as u32,
            self.next_message_id(session_id),
        );
        self.post_frame(
            Frame::new(connection, header, message.payload.clone()),
            is_final,
        );
        Ok(())
    }

    fn send_multi_frame(
        &self,
        connection: ConnectionId,
        session_id: u8,
        message: &Message,
        max_frame_size: usize,
        is_final: bool,
    ) -> Result<()> {
        let data_size = message.payload.len();
        let remainder = data_size % max_frame_size;
        let last_frame_size = if remainder > 0 { remainder } else { max_frame_size };
        let frame_count = data_size / max_frame_size + usize::from(remainder > 0);

        // One message id for the FIRST frame and every consecutive frame:
        // the close-scheduling match on the terminating frame depends on it.
        let message_id = self.next_message_id(session_id);

        let mut first_payload = Vec::with_capacity(FIRST_FRAME_DATA_SIZE);
        first_payload.extend_from_slice(&(data_size as u32).to_be_bytes());
        first_payload.extend_from_slice(&(frame_count as u32).to_be_bytes());
        let first_header = FrameHeader::new(
            message.protocol_version,
            false,
            FrameType::First,
            message.service_type,
            frame_data::FIRST,
            session_id,
            FIRST_FRAME_DATA_SIZE as u32,
            message_id,
        );
        self.post_frame(
            Frame::new(connection, first_header, Bytes::from(first_payload)),
            false,
        );

        for index in 0..frame_count {
            let is_last = index == frame_count - 1;
            let frame_size = if is_last { last_frame_size } else { max_frame_size };
            let sequence = if is_last {
                frame_data::LAST_CONSECUTIVE
            } else {
                (index % MAX_CONSECUTIVE as usize) as u8 + 1
            };
            let start = index * max_frame_size;
            let header = FrameHeader::new(
                message.protocol_version,
                false,
                FrameType::Consecutive,
                message.service_type,
                sequence,
                session_id,
                frame_size as u32,
                message_id,
            );
            self.post_frame(
                Frame::new(
                    connection,
                    header,
                    message.payload.slice(start..start + frame_size),
                ),
                is_last && is_final,
            );
        }
        Ok(())
    }

    fn process_egress_frame(
        &self,
        mut frame: Frame,
        is_final: bool,
        last_message_ids: &mut HashMap<u8, u32>,
    ) {
        if is_final {
            last_message_ids.insert(frame.session_id(), frame.message_id());
        }
        if let Some(security) = &self.security_manager {
            let encrypted =
                encrypt_frame(&mut frame, self.session_observer.as_ref(), security.as_ref());
            if encrypted.is_err() {
                warn!("frame encryption failed, frame dropped");
                return;
            }
        }
        let connection = frame.connection_id;
        let data = frame.serialize();
        if let Err(error) = self.transport.send(connection, data) {
            warn!(%error, ?connection, "transport rejected frame");
        }
    }

    fn process_sent_confirmation(
        &self,
        connection: ConnectionId,
        data: Bytes,
        last_message_ids: &mut HashMap<u8, u32>,
        ready_to_close: &mut Vec<ConnectionId>,
    ) {
        if let Some(position) = ready_to_close.iter().position(|c| *c == connection) {
            ready_to_close.remove(position);
            info!(?connection, "last frame drained, disconnecting");
            self.transport.disconnect(connection);
            return;
        }

        let frame = match Frame::parse(connection, &data) {
            Ok(frame) => frame,
            Err(reason) => {
                error!(%reason, "could not parse sent frame confirmation");
                return;
            }
        };

        let session_id = frame.session_id();
        let is_terminating =
            frame.frame_type() == FrameType::Single || frame.is_last_consecutive();
        if is_terminating && last_message_ids.get(&session_id) == Some(&frame.message_id()) {
            last_message_ids.remove(&session_id);
            ready_to_close.push(connection);
            debug!(
                ?connection,
                session_id, "final message confirmed, scheduling close"
            );
            let _ = self.send_end_service(connection, session_id, ServiceType::Rpc);
        }

        let subscribers = self.subscribers.lock().expect("subscriber lock poisoned");
        for subscriber in subscribers.iter() {
            subscriber.on_message_sent(connection);
        }
    }

    // ---- ingress ----

    fn handle_ingress_frame(&self, frame: Frame, assembler: &mut MultiFrameAssembler) {
        let connection = frame.connection_id;
        let session_id = frame.session_id();

        // Streaming services are exempt from well-formed metering.
        if !frame.service_type().is_streaming() {
            let key = self.session_observer.key_of(connection, session_id);
            let rate = self.message_meter.track(key, 1);
            if rate > self.message_meter.max_per_window() {
                warn!(?key, rate, "message rate over limit, frame dropped");
                self.session_observer.on_flood(key);
                self.message_meter.remove(key);
                return;
            }
        }

        if self.session_observer.heartbeat_supported(connection, session_id) {
            self.session_observer.keep_alive(connection, session_id);
        }

        match frame.frame_type() {
            FrameType::Control => {
                if let Err(error) = self.handle_control(&frame) {
                    warn!(%error, opcode = frame.frame_data(), "control frame failed");
                }
            }
            FrameType::Single => self.handle_single_frame(frame),
            FrameType::First | FrameType::Consecutive => {
                self.handle_multi_frame(frame, assembler)
            }
        }
    }

    fn handle_single_frame(&self, frame: Frame) {
        let key = self
            .session_observer
            .key_of(frame.connection_id, frame.session_id());
        self.notify_subscribers(Message {
            connection_key: key,
            protocol_version: frame.version(),
            service_type: frame.service_type(),
            payload: frame.payload,
        });
    }

    fn handle_multi_frame(&self, frame: Frame, assembler: &mut MultiFrameAssembler) {
        match assembler.accept(frame) {
            AssemblyOutcome::InProgress => {}
            AssemblyOutcome::Complete(complete) => self.handle_single_frame(complete),
            AssemblyOutcome::Error(reason) => {
                warn!(%reason, "multi-frame frame dropped");
            }
        }
    }

    // ---- control sub-protocol ----

    fn handle_control(&self, frame: &Frame) -> Result<()> {
        match frame.frame_data() {
            frame_data::START_SERVICE => self.handle_start_service(frame),
            frame_data::END_SERVICE => self.handle_end_service(frame),
            frame_data::HEART_BEAT => {
                debug!(connection = ?frame.connection_id, "heartbeat received");
                self.handle_heart_beat(frame)
            }
            frame_data::HEART_BEAT_ACK => {
                debug!(connection = ?frame.connection_id, "heartbeat ack consumed");
                Ok(())
            }
            opcode => {
                warn!(opcode, "control frame ignored");
                Ok(())
            }
        }
    }

    fn handle_start_service(&self, frame: &Frame) -> Result<()> {
        let connection = frame.connection_id;
        let service_type = frame.service_type();
        // Version 1 never supports protection.
        let protection = frame.version() > PROTOCOL_VERSION_1 && frame.header.protected;

        let started = self.session_observer.start_session(
            connection,
            frame.session_id(),
            service_type,
            protection,
        );
        let Some((session_id, hash_id)) = started else {
            warn!(?service_type, "service start refused");
            self.send_start_service_nack(
                connection,
                frame.session_id(),
                frame.version(),
                service_type,
            );
            return Ok(());
        };

        if protection {
            if let Some(security) = &self.security_manager {
                let key = self.session_observer.key_of(connection, session_id);
                let Some(context) = security.create_context(key) else {
                    error!(?key, "security context creation failed");
                    security.send_internal_error(
                        key,
                        SecurityError::Internal,
                        "security context creation failed",
                    );
                    // Best-effort degradation: the service starts without
                    // protection.
                    self.send_start_service_ack(connection, session_id, hash_id, service_type, false);
                    return Ok(());
                };
                if context.is_init_complete() {
                    self.session_observer.set_protection(key, service_type);
                    self.send_start_service_ack(connection, session_id, hash_id, service_type, true);
                } else {
                    self.pending_starts
                        .lock()
                        .expect("pending start lock poisoned")
                        .insert(
                            key,
                            PendingStart {
                                connection,
                                session_id,
                                protocol_version: frame.version(),
                                hash_id,
                                service_type,
                            },
                        );
                    if !context.is_handshake_pending() {
                        security.start_handshake(key);
                    }
                    debug!(?key, "protection establishment in progress");
                }
                return Ok(());
            }
        }

        self.send_start_service_ack(connection, session_id, hash_id, service_type, false);
        Ok(())
    }

    fn on_handshake_done(&self, key: ConnectionKey, success: bool) -> bool {
        let pending = self
            .pending_starts
            .lock()
            .expect("pending start lock poisoned")
            .remove(&key);
        let Some(pending) = pending else {
            return false;
        };

        let already_protected = self
            .session_observer
            .ssl_context_of(key, pending.service_type)
            .is_some();
        if already_protected {
            warn!(?key, "service is already protected, refusing start");
            self.send_start_service_nack(
                pending.connection,
                pending.session_id,
                pending.protocol_version,
                pending.service_type,
            );
        } else if success {
            self.session_observer.set_protection(key, pending.service_type);
            self.send_start_service_ack(
                pending.connection,
                pending.session_id,
                pending.hash_id,
                pending.service_type,
                true,
            );
        } else {
            warn!(?key, "handshake failed, refusing start");
            self.send_start_service_nack(
                pending.connection,
                pending.session_id,
                pending.protocol_version,
                pending.service_type,
            );
        }
        true
    }

    fn handle_end_service(&self, frame: &Frame) -> Result<()> {
        let connection = frame.connection_id;
        let session_id = frame.session_id();
        let service_type = frame.service_type();
        let hash_id = extract_hash_id(frame);

        let ended = self
            .session_observer
            .end_session(connection, session_id, hash_id, service_type);
        if ended.is_some() {
            self.send_end_service_ack(connection, session_id, frame.version(), service_type);
            self.counters
                .lock()
                .expect("counter lock poisoned")
                .remove(&session_id);
        } else {
            info!(?service_type, "refused to end session");
            self.send_end_service_nack(connection, session_id, frame.version(), service_type);
        }
        Ok(())
    }

    fn handle_heart_beat(&self, frame: &Frame) -> Result<()> {
        let connection = frame.connection_id;
        let session_id = frame.session_id();
        let version = self
            .session_observer
            .protocol_version_of(connection, session_id)
            .ok_or(ProtocolError::SessionNotFound)?;
        if version == PROTOCOL_VERSION_3 || version == PROTOCOL_VERSION_4 {
            // The ack echoes the inbound message id instead of drawing
            // from the session counter.
            self.post_frame(
                Frame::control(
                    connection,
                    version,
                    ServiceType::Control,
                    frame_data::HEART_BEAT_ACK,
                    session_id,
                    frame.message_id(),
                    Bytes::new(),
                ),
                false,
            );
            Ok(())
        } else {
            Err(ProtocolError::HeartbeatNotSupported)
        }
    }

    // ---- control frame builders ----

    fn send_start_service_ack(
        &self,
        connection: ConnectionId,
        session_id: u8,
        hash_id: u32,
        service_type: ServiceType,
        protection: bool,
    ) {
        let version = self.config.supported_version();
        let message_id = self.next_message_id(session_id);
        let mut frame = Frame::control(
            connection,
            version,
            service_type,
            frame_data::START_SERVICE_ACK,
            session_id,
            message_id,
            hash_id_payload(version, hash_id),
        );
        // The E bit on a start ack reports granted protection; the frame
        // itself stays cleartext.
        frame.header.protected = protection;
        self.post_frame(frame, false);
        info!(
            ?connection,
            session_id,
            ?service_type,
            protection,
            "start service ack queued"
        );
    }

    fn send_start_service_nack(
        &self,
        connection: ConnectionId,
        session_id: u8,
        protocol_version: u8,
        service_type: ServiceType,
    ) {
        let message_id = self.next_message_id(session_id);
        self.post_frame(
            Frame::control(
                connection,
                protocol_version,
                service_type,
                frame_data::START_SERVICE_NACK,
                session_id,
                message_id,
                Bytes::new(),
            ),
            false,
        );
        info!(?connection, session_id, ?service_type, "start service nack queued");
    }

    fn send_end_service_ack(
        &self,
        connection: ConnectionId,
        session_id: u8,
        protocol_version: u8,
        service_type: ServiceType,
    ) {
        let message_id = self.next_message_id(session_id);
        self.post_frame(
            Frame::control(
                connection,
                protocol_version,
                service_type,
                frame_data::END_SERVICE_ACK,
                session_id,
                message_id,
                Bytes::new(),
            ),
            false,
        );
        info!(?connection, session_id, ?service_type, "end service ack queued");
    }

    fn send_end_service_nack(
        &self,
        connection: ConnectionId,
        session_id: u8,
        protocol_version: u8,
        service_type: ServiceType,
    ) {
        let message_id = self.next_message_id(session_id);
        self.post_frame(
            Frame::control(
                connection,
                protocol_version,
                service_type,
                frame_data::END_SERVICE_NACK,
                session_id,
                message_id,
                Bytes::new(),
            ),
            false,
        );
        info!(?connection, session_id, ?service_type, "end service nack queued");
    }

    fn send_end_service(
        &self,
        connection: ConnectionId,
        session_id: u8,
        service_type: ServiceType,
    ) -> Result<()> {
        let version = self
            .session_observer
            .protocol_version_of(connection, session_id)
            .ok_or(ProtocolError::SessionNotFound)?;
        let message_id = self.next_message_id(session_id);
        self.post_frame(
            Frame::control(
                connection,
                version,
                service_type,
                frame_data::END_SERVICE,
                session_id,
                message_id,
                Bytes::new(),
            ),
            false,
        );
        info!(?connection, session_id, ?service_type, "end service queued");
        Ok(())
    }
}

/// Extract the resumption hash from an END_SERVICE payload.
///
/// Version 1 packets carry no hash. A short payload or a zero hash decode
/// to the "wrong" sentinel, which the session observer refuses.
fn extract_hash_id(frame: &Frame) -> u32 {
    if frame.version() < PROTOCOL_VERSION_2 {
        return HASH_ID_NOT_SUPPORTED;
    }
    let payload = frame.payload();
    if payload.len() < 4 {
        warn!("end service packet without hash data");
        return HASH_ID_WRONG;
    }
    let hash_id = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
    if hash_id == HASH_ID_NOT_SUPPORTED {
        HASH_ID_WRONG
    } else {
        hash_id
    }
}

/// Build the START_SERVICE_ACK payload: a big-endian hash id for version 2
/// and later, empty for version 1 and for the two sentinels.
fn hash_id_payload(version: u8, hash_id: u32) -> Bytes {
    if version < PROTOCOL_VERSION_2
        || hash_id == HASH_ID_NOT_SUPPORTED
        || hash_id == HASH_ID_WRONG
    {
        return Bytes::new();
    }
    Bytes::copy_from_slice(&hash_id.to_be_bytes())
}

async fn ingress_worker(inner: Arc<Inner>, mut rx: mpsc::UnboundedReceiver<IngressEvent>) {
    let mut assembler = MultiFrameAssembler::new(inner.config.maximum_payload_size);
    while let Some(event) = rx.recv().await {
        match event {
            IngressEvent::Frame(frame) => inner.handle_ingress_frame(frame, &mut assembler),
            IngressEvent::ConnectionClosed(connection) => {
                assembler.remove_connection(connection);
            }
            IngressEvent::Shutdown => break,
        }
    }
    debug!("ingress worker stopped");
}

async fn egress_worker(inner: Arc<Inner>, mut rx: mpsc::UnboundedReceiver<EgressEvent>) {
    // Both structures are owned here: delivery confirmations are the only
    // reader and writer, so no locking is needed.
    let mut last_message_ids: HashMap<u8, u32> = HashMap::new();
    let mut ready_to_close: Vec<ConnectionId> = Vec::new();
    while let Some(event) = rx.recv().await {
        match event {
            EgressEvent::Frame { frame, is_final } => {
                inner.process_egress_frame(frame, is_final, &mut last_message_ids);
            }
            EgressEvent::Sent { connection, data } => {
                inner.process_sent_confirmation(
                    connection,
                    data,
                    &mut last_message_ids,
                    &mut ready_to_close,
                );
            }
            EgressEvent::Shutdown => break,
        }
    }
    debug!("egress worker stopped");
}
