//! Multi-frame message reassembly.
//!
//! A FIRST frame opens a reassembly slot for its `(connection, session)`
//! pair; its 8-byte payload announces the total payload size and frame
//! count. CONSECUTIVE frames append to the slot, and the frame with a zero
//! sequence byte completes the message. A completed message is handed back
//! as a single frame carrying the accumulated payload.
//!
//! Slots are owned by the single ingress worker, so no synchronization is
//! needed here.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tracing::{debug, warn};

use super::frame::Frame;
use super::wire_format::{frame_data, ConnectionId, FrameType, FIRST_FRAME_DATA_SIZE};

/// Reassembly failure reasons. Failed frames are dropped; other sessions
/// are unaffected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AssemblyError {
    /// CONSECUTIVE frame without a preceding FIRST.
    #[error("consecutive frame for a session with no message in progress")]
    OrphanConsecutive,
    /// FIRST payload is not the 8-byte size/count record.
    #[error("first frame payload is not a size/count record")]
    BadFirstPayload,
    /// FIRST announced more than the assembler accepts.
    #[error("announced message size {0} exceeds the reassembly ceiling")]
    TooLarge(u32),
    /// Accumulated bytes ran past the announced total.
    #[error("accumulated {actual} bytes, first frame announced {expected}")]
    Overflow {
        /// Total size announced by the FIRST frame.
        expected: u32,
        /// Bytes accumulated so far.
        actual: usize,
    },
    /// The terminating frame left the message short of the announced total.
    #[error("message completed with {actual} bytes, first frame announced {expected}")]
    SizeMismatch {
        /// Total size announced by the FIRST frame.
        expected: u32,
        /// Bytes accumulated at completion.
        actual: usize,
    },
    /// Frame type is not part of a multi-frame message.
    #[error("frame type does not belong to a multi-frame message")]
    NotMultiFrame,
}

/// Result of feeding one frame to the assembler.
#[derive(Debug, PartialEq)]
pub enum AssemblyOutcome {
    /// Frame accepted, message not yet complete.
    InProgress,
    /// The message is complete; the frame carries the full payload.
    Complete(Frame),
    /// The frame was rejected (and any affected slot destroyed).
    Error(AssemblyError),
}

#[derive(Debug)]
struct Slot {
    first: Frame,
    total_size: u32,
    total_frames: u32,
    buffer: BytesMut,
}

/// Reassembler for in-progress multi-frame messages.
#[derive(Debug)]
pub struct MultiFrameAssembler {
    /// Ceiling on the announced total size. The sequence byte is 8-bit, so
    /// a message can span at most 255 maximum-size frames.
    max_message_size: usize,
    slots: HashMap<(ConnectionId, u8), Slot>,
}

impl MultiFrameAssembler {
    /// Create an assembler for the given per-frame payload ceiling.
    pub fn new(max_payload_size: u32) -> Self {
        Self {
            max_message_size: max_payload_size as usize * 255,
            slots: HashMap::new(),
        }
    }

    /// Feed one FIRST or CONSECUTIVE frame.
    pub fn accept(&mut self, frame: Frame) -> AssemblyOutcome {
        match frame.frame_type() {
            FrameType::First => self.accept_first(frame),
            FrameType::Consecutive => self.accept_consecutive(frame),
            _ => AssemblyOutcome::Error(AssemblyError::NotMultiFrame),
        }
    }

    fn accept_first(&mut self, frame: Frame) -> AssemblyOutcome {
        if frame.payload.len() != FIRST_FRAME_DATA_SIZE {
            return AssemblyOutcome::Error(AssemblyError::BadFirstPayload);
        }
        let payload = frame.payload();
        let total_size = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let total_frames = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
        if total_size as usize > self.max_message_size {
            return AssemblyOutcome::Error(AssemblyError::TooLarge(total_size));
        }

        let key = (frame.connection_id, frame.session_id());
        debug!(
            ?key,
            total_size, total_frames, "opening multi-frame reassembly"
        );
        let slot = Slot {
            buffer: BytesMut::with_capacity(total_size as usize),
            first: frame,
            total_size,
            total_frames,
        };
        if self.slots.insert(key, slot).is_some() {
            warn!(?key, "replacing in-progress multi-frame message");
        }
        AssemblyOutcome::InProgress
    }

    fn accept_consecutive(&mut self, frame: Frame) -> AssemblyOutcome {
        let key = (frame.connection_id, frame.session_id());
        let Some(slot) = self.slots.get_mut(&key) else {
            return AssemblyOutcome::Error(AssemblyError::OrphanConsecutive);
        };

        slot.buffer.extend_from_slice(frame.payload());
        if slot.buffer.len() > slot.total_size as usize {
            let expected = slot.total_size;
            let actual = slot.buffer.len();
            self.slots.remove(&key);
            return AssemblyOutcome::Error(AssemblyError::Overflow { expected, actual });
        }

        if frame.frame_data() != frame_data::LAST_CONSECUTIVE {
            return AssemblyOutcome::InProgress;
        }

        let slot = self.slots.remove(&key).expect("slot present");
        if slot.buffer.len() != slot.total_size as usize {
            return AssemblyOutcome::Error(AssemblyError::SizeMismatch {
                expected: slot.total_size,
                actual: slot.buffer.len(),
            });
        }
        debug!(
            ?key,
            size = slot.total_size,
            frames = slot.total_frames,
            "multi-frame message complete"
        );
        let payload: Bytes = slot.buffer.freeze();
        AssemblyOutcome::Complete(Frame::new(frame.connection_id, slot.first.header, payload))
    }

    /// Drop every in-progress message of a connection.
    pub fn remove_connection(&mut self, connection: ConnectionId) {
        self.slots.retain(|(conn, _), _| *conn != connection);
    }

    /// Drop the in-progress message of one session, if any.
    pub fn remove_session(&mut self, connection: ConnectionId, session_id: u8) {
        self.slots.remove(&(connection, session_id));
    }

    /// Number of in-progress messages.
    pub fn in_progress(&self) -> usize {
        self.slots.len()
    }
}
