//! Worker Transport Layer
//!
//! Framing and connection handling for the persistent bidirectional channels
//! workers hold to the coordinator. A transport or protocol failure tears
//! down the offending connection; the registry then emits `NODE_LOST` for any
//! subtasks still assigned to it.

pub mod frame;
pub mod server;

pub use frame::{encode, FrameDecoder, MAX_FRAME_SIZE};
pub use server::WorkerListener;

use thiserror::Error;

/// Failures at the framing and socket layer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Underlying socket failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A frame's payload did not match its checksum.
    #[error("checksum mismatch (expected {expected:#010x}, got {actual:#010x})")]
    ChecksumMismatch {
        /// Checksum carried in the frame header.
        expected: u32,
        /// Checksum computed over the received payload.
        actual: u32,
    },

    /// The peer closed the channel.
    #[error("connection closed")]
    ConnectionClosed,

    /// The outgoing queue stayed full past the grace period.
    #[error("send queue full past grace period")]
    SendTimeout,
}
