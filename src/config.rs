//! Protocol handler configuration.
//!
//! The core takes its knobs as a plain struct; loading it from a file is
//! the embedder's concern. Deserialization support keeps the struct
//! directly loadable from JSON configuration.

use serde::Deserialize;

use crate::protocol::{PROTOCOL_VERSION_2, PROTOCOL_VERSION_3, PROTOCOL_VERSION_4};

/// Default payload ceiling per frame (bytes).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 131_072;

/// Startup configuration for [`ProtocolHandler`](crate::ProtocolHandler).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum payload size of a single frame, in bytes. Must be larger
    /// than the 12-byte header.
    pub maximum_payload_size: u32,

    /// Well-formed rate window in milliseconds. Zero disables the meter.
    pub message_frequency_time: u64,
    /// Well-formed frames allowed per window. Zero disables the meter.
    pub message_frequency_count: usize,

    /// When false, a single malformed byte reports the connection
    /// immediately; when true, the malformed meter controls escalation.
    pub malformed_message_filtering: bool,
    /// Malformed rate window in milliseconds. Zero disables the meter.
    pub malformed_message_frequency_time: u64,
    /// Malformed bytes allowed per window. Zero disables the meter.
    pub malformed_message_frequency_count: usize,

    /// Whether heartbeat is negotiated for outbound sessions.
    pub heart_beat_enabled: bool,
    /// Whether protocol version 4 is offered for outbound sessions.
    pub enable_protocol_4: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            maximum_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            message_frequency_time: 1000,
            message_frequency_count: 256,
            malformed_message_filtering: true,
            malformed_message_frequency_time: 1000,
            malformed_message_frequency_count: 256,
            heart_beat_enabled: true,
            enable_protocol_4: false,
        }
    }
}

impl Config {
    /// Highest protocol version this configuration offers on outbound
    /// control responses.
    pub fn supported_version(&self) -> u8 {
        if self.enable_protocol_4 {
            PROTOCOL_VERSION_4
        } else if self.heart_beat_enabled {
            PROTOCOL_VERSION_3
        } else {
            PROTOCOL_VERSION_2
        }
    }
}
