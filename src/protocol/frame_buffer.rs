//! Per-connection byte accumulation and frame extraction.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management. Each connection
//! owns an accumulator; transport reads are appended and as many complete
//! frames as possible are extracted per batch.
//!
//! Unlike a trusting parser, this one must survive garbage: a header that
//! fails validation advances the buffer by exactly one byte and keeps
//! scanning, so a well-formed frame after garbage in the same batch is
//! still emitted. The caller receives the malformed byte count for rate
//! accounting.

use std::collections::HashMap;

use bytes::{Buf, BytesMut};
use tracing::debug;

use super::frame::Frame;
use super::wire_format::{header_size, ConnectionId, FrameHeader};
use crate::error::{ProtocolError, Result};

/// Initial accumulator capacity per connection.
const INITIAL_CAPACITY: usize = 16 * 1024;

/// Outcome status of one processed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// The batch parsed cleanly.
    Ok,
    /// At least one byte-level resync happened in the batch.
    MalformedOccurs,
}

/// Frames and bookkeeping extracted from one batch of transport bytes.
#[derive(Debug)]
pub struct ProcessOutcome {
    /// Complete frames found in the batch, in wire order.
    pub frames: Vec<Frame>,
    /// Whether any resync happened.
    pub status: ProcessStatus,
    /// Number of bytes skipped while resynchronizing.
    pub malformed_bytes: usize,
}

/// Parser over per-connection accumulators.
///
/// Connections must be registered with [`add_connection`] before bytes for
/// them are processed; data for an unknown connection is an unrecoverable
/// bookkeeping error surfaced as [`ProtocolError::UnknownConnection`].
///
/// [`add_connection`]: IncomingDataHandler::add_connection
#[derive(Debug)]
pub struct IncomingDataHandler {
    max_payload_size: u32,
    connections: HashMap<ConnectionId, BytesMut>,
}

impl IncomingDataHandler {
    /// Create a handler enforcing the given payload ceiling.
    pub fn new(max_payload_size: u32) -> Self {
        Self {
            max_payload_size,
            connections: HashMap::new(),
        }
    }

    /// Register a connection and allocate its accumulator.
    pub fn add_connection(&mut self, connection: ConnectionId) {
        self.connections
            .entry(connection)
            .or_insert_with(|| BytesMut::with_capacity(INITIAL_CAPACITY));
    }

    /// Drop a connection and any buffered bytes.
    pub fn remove_connection(&mut self, connection: ConnectionId) {
        self.connections.remove(&connection);
    }

    /// Append a batch of transport bytes and extract complete frames.
    pub fn process(&mut self, connection: ConnectionId, data: &[u8]) -> Result<ProcessOutcome> {
        let buffer = self
            .connections
            .get_mut(&connection)
            .ok_or(ProtocolError::UnknownConnection(connection))?;
        buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        let mut malformed_bytes = 0usize;

        loop {
            let Some(&first) = buffer.first() else { break };
            // Header length follows from the version nibble.
            let header_len = header_size(first >> 4);
            if buffer.len() < header_len {
                break;
            }

            let header = FrameHeader::decode(&buffer[..header_len])
                .and_then(|h| h.validate(self.max_payload_size).map(|_| h));
            let header = match header {
                Ok(header) => header,
                Err(reason) => {
                    debug!(?connection, %reason, "skipping malformed byte");
                    buffer.advance(1);
                    malformed_bytes += 1;
                    continue;
                }
            };

            let frame_len = header_len + header.data_size as usize;
            if buffer.len() < frame_len {
                break;
            }

            let mut chunk = buffer.split_to(frame_len);
            let payload = chunk.split_off(header_len).freeze();
            frames.push(Frame::new(connection, header, payload));
        }

        let status = if malformed_bytes > 0 {
            ProcessStatus::MalformedOccurs
        } else {
            ProcessStatus::Ok
        };
        Ok(ProcessOutcome {
            frames,
            status,
            malformed_bytes,
        })
    }

    /// Number of bytes currently buffered for a connection.
    pub fn buffered(&self, connection: ConnectionId) -> usize {
        self.connections.get(&connection).map_or(0, BytesMut::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::wire_format::{
        FrameType, ServiceType, HEADER_SIZE_V2, PROTOCOL_VERSION_1, PROTOCOL_VERSION_2,
    };
    use bytes::Bytes;

    const CONN: ConnectionId = ConnectionId(1);

    fn handler() -> IncomingDataHandler {
        let mut handler = IncomingDataHandler::new(1024);
        handler.add_connection(CONN);
        handler
    }

    fn single_frame_bytes(session_id: u8, message_id: u32, payload: &'static [u8]) -> Bytes {
        let header = FrameHeader::new(
            PROTOCOL_VERSION_2,
            false,
            FrameType::Single,
            ServiceType::Rpc,
            0,
            session_id,
            payload.len() as u32,
            message_id,
        );
        Frame::new(CONN, header, Bytes::from_static(payload)).serialize()
    }

    #[test]
    fn test_single_complete_frame() {
        let mut handler = handler();
        let wire = single_frame_bytes(7, 42, b"PING");

        let out = handler.process(CONN, &wire).unwrap();

        assert_eq!(out.status, ProcessStatus::Ok);
        assert_eq!(out.malformed_bytes, 0);
        assert_eq!(out.frames.len(), 1);
        assert_eq!(out.frames[0].payload(), b"PING");
        assert_eq!(out.frames[0].message_id(), 42);
        assert_eq!(handler.buffered(CONN), 0);
    }

    #[test]
    fn test_multiple_frames_in_one_batch_preserve_order() {
        let mut handler = handler();
        let mut wire = Vec::new();
        for id in 1..=3u32 {
            wire.extend_from_slice(&single_frame_bytes(1, id, b"data"));
        }

        let out = handler.process(CONN, &wire).unwrap();

        assert_eq!(out.frames.len(), 3);
        let ids: Vec<u32> = out.frames.iter().map(Frame::message_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_partial_header_then_rest_matches_single_delivery() {
        let mut handler = handler();
        let wire = single_frame_bytes(1, 9, b"PART");

        // All but the last byte: nothing emitted.
        let out = handler.process(CONN, &wire[..wire.len() - 1]).unwrap();
        assert!(out.frames.is_empty());
        assert_eq!(out.status, ProcessStatus::Ok);

        // The final byte completes the frame.
        let out = handler.process(CONN, &wire[wire.len() - 1..]).unwrap();
        assert_eq!(out.frames.len(), 1);
        assert_eq!(out.frames[0].payload(), b"PART");
    }

    #[test]
    fn test_byte_at_a_time_delivery() {
        let mut handler = handler();
        let wire = single_frame_bytes(1, 5, b"hi");

        let mut collected = Vec::new();
        for byte in wire.iter() {
            let out = handler.process(CONN, &[*byte]).unwrap();
            assert_eq!(out.status, ProcessStatus::Ok);
            collected.extend(out.frames);
        }

        assert_eq!(collected.len(), 1);
        assert_eq!(collected[0].payload(), b"hi");
    }

    #[test]
    fn test_garbage_byte_then_valid_frame_resyncs() {
        let mut handler = handler();
        let mut wire = vec![0xFFu8];
        wire.extend_from_slice(&single_frame_bytes(1, 11, b"good"));

        let out = handler.process(CONN, &wire).unwrap();

        assert_eq!(out.status, ProcessStatus::MalformedOccurs);
        assert!(out.malformed_bytes >= 1);
        assert_eq!(out.frames.len(), 1);
        assert_eq!(out.frames[0].payload(), b"good");
    }

    #[test]
    fn test_oversize_payload_header_is_resynced_past() {
        let mut handler = IncomingDataHandler::new(8);
        handler.add_connection(CONN);

        let header = FrameHeader::new(
            PROTOCOL_VERSION_2,
            false,
            FrameType::Single,
            ServiceType::Rpc,
            0,
            1,
            9, // one past the ceiling
            0,
        );
        let mut wire = header.encode();
        wire.extend_from_slice(&[0u8; 9]);

        let out = handler.process(CONN, &wire).unwrap();
        assert_eq!(out.status, ProcessStatus::MalformedOccurs);
        assert!(out.frames.is_empty());
    }

    #[test]
    fn test_payload_exactly_at_ceiling_is_accepted() {
        let mut handler = IncomingDataHandler::new(4);
        handler.add_connection(CONN);
        let wire = single_frame_bytes(1, 1, b"full");

        let out = handler.process(CONN, &wire).unwrap();
        assert_eq!(out.status, ProcessStatus::Ok);
        assert_eq!(out.frames.len(), 1);
    }

    #[test]
    fn test_unknown_connection_fails() {
        let mut handler = IncomingDataHandler::new(1024);
        let result = handler.process(ConnectionId(99), b"data");
        assert!(matches!(
            result,
            Err(ProtocolError::UnknownConnection(ConnectionId(99)))
        ));
    }

    #[test]
    fn test_remove_connection_discards_buffer() {
        let mut handler = handler();
        let wire = single_frame_bytes(1, 1, b"data");
        handler.process(CONN, &wire[..4]).unwrap();
        assert!(handler.buffered(CONN) > 0);

        handler.remove_connection(CONN);
        assert!(handler.process(CONN, &wire[4..]).is_err());
    }

    #[test]
    fn test_v1_frame_uses_short_header() {
        let mut handler = handler();
        let header = FrameHeader::new(
            PROTOCOL_VERSION_1,
            false,
            FrameType::Single,
            ServiceType::Rpc,
            0,
            2,
            3,
            0,
        );
        let wire = Frame::new(CONN, header, Bytes::from_static(b"old")).serialize();
        assert_eq!(wire.len(), 8 + 3);

        let out = handler.process(CONN, &wire).unwrap();
        assert_eq!(out.frames.len(), 1);
        assert_eq!(out.frames[0].version(), PROTOCOL_VERSION_1);
        assert_eq!(out.frames[0].payload(), b"old");
    }

    #[test]
    fn test_frame_after_incomplete_payload_waits() {
        let mut handler = handler();
        let wire = single_frame_bytes(1, 3, b"late bytes");

        let out = handler.process(CONN, &wire[..HEADER_SIZE_V2 + 2]).unwrap();
        assert!(out.frames.is_empty());
        assert_eq!(handler.buffered(CONN), HEADER_SIZE_V2 + 2);

        let out = handler.process(CONN, &wire[HEADER_SIZE_V2 + 2..]).unwrap();
        assert_eq!(out.frames.len(), 1);
        assert_eq!(out.frames[0].payload(), b"late bytes");
    }
}
