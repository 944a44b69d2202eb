//! Frame Codec
//!
//! Wire format for worker channels: length-prefixed JSON with a CRC32
//! checksum so corrupted frames are detected before they reach the protocol
//! layer.
//!
//! ```text
//! +----------------+----------------+------------------------------------+
//! | Length (4)     | Checksum (4)   | JSON payload (variable)            |
//! | big-endian u32 | CRC32          | NodeMessage or CoordinatorMessage  |
//! +----------------+----------------+------------------------------------+
//! ```
//!
//! The length field counts the JSON payload only. Frames above
//! [`MAX_FRAME_SIZE`] are rejected before any buffer is allocated, so a
//! malformed or hostile length prefix cannot exhaust memory.

use serde::{de::DeserializeOwned, Serialize};

use super::TransportError;

/// Maximum frame size (10 MB). Large enough for an attachment-heavy
/// assignment, small enough to bound per-connection memory.
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Initial decoder buffer capacity.
const MIN_BUFFER_CAPACITY: usize = 4096;

/// Header size: 4 bytes length + 4 bytes checksum.
const HEADER_SIZE: usize = 8;

#[inline]
fn checksum(payload: &[u8]) -> u32 {
    crc32fast::hash(payload)
}

/// Encode a message into a framed byte vector.
///
/// # Errors
///
/// Returns [`TransportError::Serialization`] when JSON encoding fails or the
/// payload exceeds [`MAX_FRAME_SIZE`].
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, TransportError> {
    let json = serde_json::to_vec(msg).map_err(|e| TransportError::Serialization(e.to_string()))?;

    if json.len() > MAX_FRAME_SIZE {
        return Err(TransportError::Serialization(format!(
            "frame too large: {} bytes (max {MAX_FRAME_SIZE})",
            json.len()
        )));
    }

    let mut buf = Vec::with_capacity(HEADER_SIZE + json.len());
    buf.extend_from_slice(&(json.len() as u32).to_be_bytes());
    buf.extend_from_slice(&checksum(&json).to_be_bytes());
    buf.extend_from_slice(&json);
    Ok(buf)
}

/// Streaming frame decoder.
///
/// Accumulates bytes from the socket and yields complete messages as they
/// become available.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    read_pos: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Create an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(MIN_BUFFER_CAPACITY),
            read_pos: 0,
        }
    }

    /// Append raw bytes read from the socket.
    pub fn push(&mut self, data: &[u8]) {
        // Compact once the consumed prefix dominates the buffer.
        if self.read_pos > self.buffer.len() / 2 && self.read_pos > MIN_BUFFER_CAPACITY {
            self.buffer.drain(..self.read_pos);
            self.read_pos = 0;
        }
        self.buffer.extend_from_slice(data);
    }

    /// Bytes buffered but not yet consumed.
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffer.len() - self.read_pos
    }

    /// Try to decode the next complete frame.
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ChecksumMismatch`] on payload corruption and
    /// [`TransportError::Serialization`] on oversized or undecodable frames.
    pub fn decode<T: DeserializeOwned>(&mut self) -> Result<Option<T>, TransportError> {
        if self.available() < HEADER_SIZE {
            return Ok(None);
        }

        let len_bytes: [u8; 4] = self.buffer[self.read_pos..self.read_pos + 4]
            .try_into()
            .expect("slice of length 4");
        let len = u32::from_be_bytes(len_bytes) as usize;

        if len > MAX_FRAME_SIZE {
            return Err(TransportError::Serialization(format!(
                "declared frame size {len} exceeds maximum {MAX_FRAME_SIZE}"
            )));
        }

        if self.available() < HEADER_SIZE + len {
            return Ok(None);
        }

        let checksum_bytes: [u8; 4] = self.buffer[self.read_pos + 4..self.read_pos + 8]
            .try_into()
            .expect("slice of length 4");
        let expected = u32::from_be_bytes(checksum_bytes);

        let payload_start = self.read_pos + HEADER_SIZE;
        let payload = &self.buffer[payload_start..payload_start + len];

        let actual = checksum(payload);
        if actual != expected {
            return Err(TransportError::ChecksumMismatch { expected, actual });
        }

        let msg =
            serde_json::from_slice(payload).map_err(|e| TransportError::Serialization(e.to_string()))?;

        self.read_pos = payload_start + len;
        Ok(Some(msg))
    }

    /// Discard all buffered bytes.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.read_pos = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::NodeMessage;
    use crate::registry::NodeId;

    fn heartbeat(load: u32) -> NodeMessage {
        NodeMessage::NodeHeartbeat {
            node_id: NodeId::new("node-1"),
            current_load: load,
            uptime_seconds: 60,
            tokens_per_second: None,
        }
    }

    #[test]
    fn test_roundtrip() {
        let msg = heartbeat(3);
        let encoded = encode(&msg).unwrap();
        assert!(encoded.len() > HEADER_SIZE);

        let mut decoder = FrameDecoder::new();
        decoder.push(&encoded);

        let decoded: NodeMessage = decoder.decode().unwrap().unwrap();
        match decoded {
            NodeMessage::NodeHeartbeat { current_load, .. } => assert_eq!(current_load, 3),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_partial_frames_need_more_data() {
        let encoded = encode(&heartbeat(0)).unwrap();

        let mut decoder = FrameDecoder::new();
        decoder.push(&encoded[..3]);
        let result: Result<Option<NodeMessage>, _> = decoder.decode();
        assert!(matches!(result, Ok(None)));

        decoder.push(&encoded[3..encoded.len() - 1]);
        let result: Result<Option<NodeMessage>, _> = decoder.decode();
        assert!(matches!(result, Ok(None)));

        decoder.push(&encoded[encoded.len() - 1..]);
        let result: Result<Option<NodeMessage>, _> = decoder.decode();
        assert!(matches!(result, Ok(Some(_))));
    }

    #[test]
    fn test_multiple_frames_in_one_read() {
        let mut bytes = encode(&heartbeat(1)).unwrap();
        bytes.extend(encode(&heartbeat(2)).unwrap());

        let mut decoder = FrameDecoder::new();
        decoder.push(&bytes);

        let first: NodeMessage = decoder.decode().unwrap().unwrap();
        let second: NodeMessage = decoder.decode().unwrap().unwrap();
        let done: Option<NodeMessage> = decoder.decode().unwrap();

        assert!(matches!(
            first,
            NodeMessage::NodeHeartbeat { current_load: 1, .. }
        ));
        assert!(matches!(
            second,
            NodeMessage::NodeHeartbeat { current_load: 2, .. }
        ));
        assert!(done.is_none());
    }

    #[test]
    fn test_corrupted_payload_detected() {
        let mut encoded = encode(&heartbeat(1)).unwrap();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xFF;

        let mut decoder = FrameDecoder::new();
        decoder.push(&encoded);

        let result: Result<Option<NodeMessage>, _> = decoder.decode();
        assert!(matches!(
            result,
            Err(TransportError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_hostile_length_prefix_rejected() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&((MAX_FRAME_SIZE as u32 + 1).to_be_bytes()));
        decoder.push(&[0u8; 4]);

        let result: Result<Option<NodeMessage>, _> = decoder.decode();
        assert!(matches!(result, Err(TransportError::Serialization(_))));
    }

    #[test]
    fn test_invalid_json_rejected() {
        let payload = b"not a frame";
        let mut decoder = FrameDecoder::new();
        decoder.push(&(payload.len() as u32).to_be_bytes());
        decoder.push(&checksum(payload).to_be_bytes());
        decoder.push(payload);

        let result: Result<Option<NodeMessage>, _> = decoder.decode();
        assert!(matches!(result, Err(TransportError::Serialization(_))));
    }
}
