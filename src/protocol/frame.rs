//! Frame struct with typed accessors.
//!
//! Represents a complete protocol frame: the owning connection, the decoded
//! header, and the payload. Uses `bytes::Bytes` for zero-copy payload
//! sharing between pipeline stages.

use bytes::{Bytes, BytesMut};

use super::wire_format::{
    frame_data, ConnectionId, FrameHeader, FrameType, MalformedHeader, ServiceType, header_size,
};

/// A complete protocol frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Connection the frame belongs to.
    pub connection_id: ConnectionId,
    /// Decoded header.
    pub header: FrameHeader,
    /// Payload bytes (zero-copy via `bytes::Bytes`).
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame from a header and payload.
    ///
    /// The header's `data_size` is normalized to the payload length.
    pub fn new(connection_id: ConnectionId, mut header: FrameHeader, payload: Bytes) -> Self {
        header.data_size = payload.len() as u32;
        Self {
            connection_id,
            header,
            payload,
        }
    }

    /// Build a control frame. Control frames are always cleartext.
    pub fn control(
        connection_id: ConnectionId,
        version: u8,
        service_type: ServiceType,
        opcode: u8,
        session_id: u8,
        message_id: u32,
        payload: Bytes,
    ) -> Self {
        let header = FrameHeader::new(
            version,
            false,
            FrameType::Control,
            service_type,
            opcode,
            session_id,
            payload.len() as u32,
            message_id,
        );
        Self::new(connection_id, header, payload)
    }

    /// Replace the payload, keeping `data_size` consistent.
    pub fn set_payload(&mut self, payload: Bytes) {
        self.header.data_size = payload.len() as u32;
        self.payload = payload;
    }

    /// Serialize header and payload into a contiguous wire buffer.
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.header.size() + self.payload.len());
        buf.extend_from_slice(&self.header.encode());
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Parse a complete frame back from wire bytes.
    ///
    /// Used when the transport echoes sent bytes in a delivery
    /// confirmation. The buffer must hold the whole frame.
    pub fn parse(connection_id: ConnectionId, data: &[u8]) -> Result<Self, MalformedHeader> {
        let header = FrameHeader::decode(data)?;
        let offset = header_size(header.version);
        let end = offset + header.data_size as usize;
        if data.len() < end {
            return Err(MalformedHeader::WrongPayloadSize);
        }
        Ok(Self {
            connection_id,
            header,
            payload: Bytes::copy_from_slice(&data[offset..end]),
        })
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Get the protocol version.
    #[inline]
    pub fn version(&self) -> u8 {
        self.header.version
    }

    /// Get the frame type.
    #[inline]
    pub fn frame_type(&self) -> FrameType {
        self.header.frame_type
    }

    /// Get the service type.
    #[inline]
    pub fn service_type(&self) -> ServiceType {
        self.header.service_type
    }

    /// Get the session identifier.
    #[inline]
    pub fn session_id(&self) -> u8 {
        self.header.session_id
    }

    /// Get the message identifier.
    #[inline]
    pub fn message_id(&self) -> u32 {
        self.header.message_id
    }

    /// Get the frame data byte (opcode or sequence).
    #[inline]
    pub fn frame_data(&self) -> u8 {
        self.header.frame_data
    }

    /// Check if this is a control frame.
    #[inline]
    pub fn is_control(&self) -> bool {
        self.header.frame_type == FrameType::Control
    }

    /// Check if this frame terminates a multi-frame message.
    #[inline]
    pub fn is_last_consecutive(&self) -> bool {
        self.header.frame_type == FrameType::Consecutive
            && self.header.frame_data == frame_data::LAST_CONSECUTIVE
    }
}
