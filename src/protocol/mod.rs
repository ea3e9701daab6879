//! Protocol module - wire format, framing, and reassembly.
//!
//! This module implements the binary protocol:
//! - Bit-packed header encoding/decoding with strict validation
//! - Per-connection frame buffers tolerant of garbage and partial reads
//! - Frame struct with typed accessors
//! - Multi-frame message reassembly

mod frame;
mod frame_buffer;
mod multiframe;
mod wire_format;

pub use frame::Frame;
pub use frame_buffer::{IncomingDataHandler, ProcessOutcome, ProcessStatus};
pub use multiframe::{AssemblyError, AssemblyOutcome, MultiFrameAssembler};
pub use wire_format::{
    frame_data, header_size, ConnectionId, ConnectionKey, FrameHeader, FrameType, MalformedHeader,
    ServiceType, FIRST_FRAME_DATA_SIZE, HASH_ID_NOT_SUPPORTED, HASH_ID_WRONG, HEADER_SIZE_V1,
    HEADER_SIZE_V2, MAX_CONSECUTIVE, PROTOCOL_VERSION_1, PROTOCOL_VERSION_2, PROTOCOL_VERSION_3,
    PROTOCOL_VERSION_4,
};
