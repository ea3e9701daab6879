//! Wire format encoding and decoding.
//!
//! Implements the link protocol header. Protocol version 2 and later use a
//! 12-byte header:
//!
//! ```text
//! ┌──────────────────┬─────────┬────────────┬─────────┬───────────┬────────────┐
//! │ ver │ E │ frame  │ service │ frame data │ session │ data size │ message id │
//! │ 4b    1b   3b    │ 1 byte  │ 1 byte     │ 1 byte  │ u32 BE    │ u32 BE     │
//! └──────────────────┴─────────┴────────────┴─────────┴───────────┴────────────┘
//! ```
//!
//! Version 1 uses the same layout without the trailing message id (8 bytes).
//! The `E` bit marks an encrypted payload. All multi-byte integers are
//! Big Endian.

use thiserror::Error;

/// Transport-level connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u32);

/// Opaque session token derived by the session observer from a
/// `(connection, session)` pair. Unique across connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionKey(pub u32);

/// First protocol version (8-byte header, no protection support).
pub const PROTOCOL_VERSION_1: u8 = 1;
/// Second protocol version (12-byte header).
pub const PROTOCOL_VERSION_2: u8 = 2;
/// Third protocol version (adds heartbeat).
pub const PROTOCOL_VERSION_3: u8 = 3;
/// Fourth protocol version.
pub const PROTOCOL_VERSION_4: u8 = 4;

/// Header size for protocol version 1.
pub const HEADER_SIZE_V1: usize = 8;
/// Header size for protocol version 2 and later.
pub const HEADER_SIZE_V2: usize = 12;

/// Payload size of a FIRST frame: `total_size:u32 || frame_count:u32`.
pub const FIRST_FRAME_DATA_SIZE: usize = 8;

/// Highest sequence byte of a consecutive frame before wrapping back to 1.
pub const MAX_CONSECUTIVE: u8 = 254;

/// Session hash sentinel: the peer does not support hash ids.
pub const HASH_ID_NOT_SUPPORTED: u32 = 0;
/// Session hash sentinel: the carried hash id could not be decoded.
pub const HASH_ID_WRONG: u32 = 0xFFFF_FFFF;

/// Header size in bytes for the given protocol version.
#[inline]
pub fn header_size(version: u8) -> usize {
    if version == PROTOCOL_VERSION_1 {
        HEADER_SIZE_V1
    } else {
        HEADER_SIZE_V2
    }
}

/// Sub-opcode constants carried in the `frame_data` byte.
pub mod frame_data {
    /// SINGLE frames carry no sub-opcode.
    pub const SINGLE: u8 = 0x00;
    /// FIRST frames carry no sub-opcode.
    pub const FIRST: u8 = 0x00;
    /// Sequence value of the terminating consecutive frame.
    pub const LAST_CONSECUTIVE: u8 = 0x00;

    // Control sub-protocol opcodes.

    /// Heartbeat request.
    pub const HEART_BEAT: u8 = 0x00;
    /// Service start request.
    pub const START_SERVICE: u8 = 0x01;
    /// Positive response to a service start.
    pub const START_SERVICE_ACK: u8 = 0x02;
    /// Negative response to a service start.
    pub const START_SERVICE_NACK: u8 = 0x03;
    /// Service end request.
    pub const END_SERVICE: u8 = 0x04;
    /// Positive response to a service end.
    pub const END_SERVICE_ACK: u8 = 0x05;
    /// Negative response to a service end.
    pub const END_SERVICE_NACK: u8 = 0x06;
    /// Flow-control acknowledgement for streaming services.
    pub const SERVICE_DATA_ACK: u8 = 0xFE;
    /// Heartbeat acknowledgement.
    pub const HEART_BEAT_ACK: u8 = 0xFF;
}

/// Frame type, packed into the low three bits of the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    /// Control sub-protocol frame.
    Control,
    /// Complete logical message in one frame.
    Single,
    /// Opening frame of a multi-frame message.
    First,
    /// Continuation frame of a multi-frame message.
    Consecutive,
}

impl FrameType {
    /// Decode from the low three bits of the first header byte.
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0x00 => Some(FrameType::Control),
            0x01 => Some(FrameType::Single),
            0x02 => Some(FrameType::First),
            0x03 => Some(FrameType::Consecutive),
            _ => None,
        }
    }

    /// Encode to the low three bits of the first header byte.
    #[inline]
    pub fn to_bits(self) -> u8 {
        match self {
            FrameType::Control => 0x00,
            FrameType::Single => 0x01,
            FrameType::First => 0x02,
            FrameType::Consecutive => 0x03,
        }
    }
}

/// Per-session sub-channel selector.
///
/// Unassigned byte values are carried through as [`ServiceType::Reserved`];
/// only values in the vendor extension space (`0x20` and above) validate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceType {
    /// Control service; never encrypted.
    Control,
    /// Remote procedure call service.
    Rpc,
    /// Audio streaming service.
    Audio,
    /// Video streaming service.
    Video,
    /// Bulk data (hybrid) service.
    Bulk,
    /// Unassigned service byte, passed through unchanged.
    Reserved(u8),
}

/// Start of the vendor extension space for service bytes.
const VENDOR_SERVICE_BASE: u8 = 0x20;

impl ServiceType {
    /// Map a wire byte to a service type.
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x00 => ServiceType::Control,
            0x07 => ServiceType::Rpc,
            0x0A => ServiceType::Audio,
            0x0B => ServiceType::Video,
            0x0F => ServiceType::Bulk,
            other => ServiceType::Reserved(other),
        }
    }

    /// Map a service type back to its wire byte.
    #[inline]
    pub fn to_byte(self) -> u8 {
        match self {
            ServiceType::Control => 0x00,
            ServiceType::Rpc => 0x07,
            ServiceType::Audio => 0x0A,
            ServiceType::Video => 0x0B,
            ServiceType::Bulk => 0x0F,
            ServiceType::Reserved(byte) => byte,
        }
    }

    /// Whether this is one of the streaming services exempt from
    /// well-formed rate metering.
    #[inline]
    pub fn is_streaming(self) -> bool {
        matches!(self, ServiceType::Audio | ServiceType::Video)
    }
}

/// Header validation failure reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MalformedHeader {
    /// Structurally invalid header fields (zero session on a data frame).
    #[error("wrong header")]
    WrongHeader,
    /// Unknown frame type bits.
    #[error("wrong frame type")]
    WrongFrameType,
    /// Service byte outside the known set and the vendor space.
    #[error("wrong service type")]
    WrongServiceType,
    /// Payload size out of bounds for the frame type.
    #[error("wrong payload size")]
    WrongPayloadSize,
    /// Protocol version outside the supported set.
    #[error("wrong version")]
    WrongVersion,
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Protocol version (1-4).
    pub version: u8,
    /// Encryption bit: payload is ciphertext.
    pub protected: bool,
    /// Frame type.
    pub frame_type: FrameType,
    /// Service selector.
    pub service_type: ServiceType,
    /// Control opcode, consecutive sequence byte, or zero.
    pub frame_data: u8,
    /// Session identifier within the connection.
    pub session_id: u8,
    /// Payload length in bytes.
    pub data_size: u32,
    /// Message identifier; absent on the wire for version 1.
    pub message_id: u32,
}

impl FrameHeader {
    /// Create a new header.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        version: u8,
        protected: bool,
        frame_type: FrameType,
        service_type: ServiceType,
        frame_data: u8,
        session_id: u8,
        data_size: u32,
        message_id: u32,
    ) -> Self {
        Self {
            version,
            protected,
            frame_type,
            service_type,
            frame_data,
            session_id,
            data_size,
            message_id,
        }
    }

    /// Encoded size of this header in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        header_size(self.version)
    }

    /// Encode the header to wire bytes (Big Endian).
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.size());
        buf.push((self.version << 4) | ((self.protected as u8) << 3) | self.frame_type.to_bits());
        buf.push(self.service_type.to_byte());
        buf.push(self.frame_data);
        buf.push(self.session_id);
        buf.extend_from_slice(&self.data_size.to_be_bytes());
        if self.version >= PROTOCOL_VERSION_2 {
            buf.extend_from_slice(&self.message_id.to_be_bytes());
        }
        buf
    }

    /// Decode a header from wire bytes.
    ///
    /// The buffer must hold at least [`header_size`] bytes for the version
    /// announced in the first byte; the caller derives that length by
    /// peeking the version nibble.
    pub fn decode(buf: &[u8]) -> Result<Self, MalformedHeader> {
        let first = *buf.first().ok_or(MalformedHeader::WrongHeader)?;
        let version = first >> 4;
        if !(PROTOCOL_VERSION_1..=PROTOCOL_VERSION_4).contains(&version) {
            return Err(MalformedHeader::WrongVersion);
        }
        if buf.len() < header_size(version) {
            return Err(MalformedHeader::WrongHeader);
        }
        let frame_type =
            FrameType::from_bits(first & 0x07).ok_or(MalformedHeader::WrongFrameType)?;
        let message_id = if version >= PROTOCOL_VERSION_2 {
            u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]])
        } else {
            0
        };
        Ok(Self {
            version,
            protected: first & 0x08 != 0,
            frame_type,
            service_type: ServiceType::from_byte(buf[1]),
            frame_data: buf[2],
            session_id: buf[3],
            data_size: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            message_id,
        })
    }

    /// Validate the header against the protocol rules.
    ///
    /// Stateless predicate: version in the supported set, known frame type,
    /// service byte either assigned or in the vendor space, payload within
    /// `max_payload_size` (and exactly 8 bytes for FIRST frames), non-zero
    /// session id on data frames.
    pub fn validate(&self, max_payload_size: u32) -> Result<(), MalformedHeader> {
        if !(PROTOCOL_VERSION_1..=PROTOCOL_VERSION_4).contains(&self.version) {
            return Err(MalformedHeader::WrongVersion);
        }
        if let ServiceType::Reserved(byte) = self.service_type {
            if byte < VENDOR_SERVICE_BASE {
                return Err(MalformedHeader::WrongServiceType);
            }
        }
        match self.frame_type {
            FrameType::First => {
                if self.data_size != FIRST_FRAME_DATA_SIZE as u32 {
                    return Err(MalformedHeader::WrongPayloadSize);
                }
            }
            _ => {
                if self.data_size > max_payload_size {
                    return Err(MalformedHeader::WrongPayloadSize);
                }
            }
        }
        if self.frame_type != FrameType::Control && self.session_id == 0 {
            return Err(MalformedHeader::WrongHeader);
        }
        Ok(())
    }
}
