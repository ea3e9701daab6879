//! # devicelink
//!
//! Protocol framing core for a vehicle head-unit / mobile device link.
//!
//! The crate sits between a transport layer, which delivers unframed byte
//! runs per connection, and an application layer, which consumes and
//! produces logical messages. It owns:
//!
//! - **Parsing** — strict header validation with byte-level resync past
//!   garbage, tolerant of arbitrarily fragmented reads
//! - **Reassembly** — multi-frame messages keyed by `(connection, session)`
//!   with per-connection ordering preserved end-to-end
//! - **Fragmentation** — outbound messages split against the encrypted
//!   payload ceiling
//! - **Session control** — the start/end-service and heartbeat
//!   sub-protocol, including the TLS-style handshake gate
//! - **Rate metering** — independent sliding windows for well-formed and
//!   malformed traffic per connection
//! - **Frame protection** — per-(connection, service) encryption contexts;
//!   control frames stay cleartext
//!
//! External collaborators (session observer, security manager, transport,
//! subscribers) are injected as trait objects; the core keeps no
//! process-wide state.
//!
//! ## Example
//!
//! ```ignore
//! use devicelink::{Config, ProtocolHandler};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let handler = ProtocolHandler::start(
//!         Config::default(),
//!         session_observer,
//!         Some(security_manager),
//!         transport,
//!     );
//!     handler.add_subscriber(subscriber);
//!
//!     // Wire transport callbacks to the handler:
//!     // on_connection_opened / on_bytes / on_bytes_sent / on_connection_closed
//!
//!     handler.stop().await;
//! }
//! ```

pub mod config;
pub mod crypto;
pub mod error;
pub mod meter;
pub mod observer;
pub mod protocol;
pub mod transport;

mod engine;

pub use config::Config;
pub use engine::ProtocolHandler;
pub use error::{ProtocolError, Result};
pub use observer::{Message, SessionObserver, Subscriber};
pub use transport::Transport;
