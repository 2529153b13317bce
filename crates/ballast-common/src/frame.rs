//! The ballast wire frame.
//!
//! Messages are a fixed 24-byte header followed by `payload_size` opaque
//! bytes. The header carries everything the proxy needs: a per-client
//! sequence number for response correlation, an echoed client timestamp,
//! the payload length and the 64-bit L7 identifier consumed by the hashing
//! selectors.
//!
//! # Wire Layout
//!
//! All integers are big-endian:
//!
//! ```text
//! offset 0   seq           u32
//! offset 4   timestamp_ns  i64
//! offset 12  payload_size  u32
//! offset 16  l7_id         u64
//! ```
//!
//! The codec never allocates: encoding writes into a caller-provided buffer
//! and parsing peeks at a byte slice without consuming it.

use std::fmt;

/// Serialized size of [`FrameHeader`] in bytes.
pub const HEADER_LEN: usize = 24;

/// Upper bound on a single frame's declared payload.
///
/// A header declaring more than this is treated as a protocol violation and
/// the connection carrying it is dropped, bounding memory per connection.
pub const MAX_FRAME_PAYLOAD: u32 = 64 * 1024 * 1024;

/// The fixed-size header prefixed to every request and response.
///
/// Responses reuse the request's header verbatim with `payload_size = 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Monotonic per-client sequence number.
    pub seq: u32,
    /// Client send time in nanoseconds. Opaque to the proxy; echoed back.
    pub timestamp_ns: i64,
    /// Number of payload bytes following the header.
    pub payload_size: u32,
    /// Identifier consumed by the hashing selectors (RingHash, Maglev).
    pub l7_id: u64,
}

impl FrameHeader {
    /// Serializes the header into a fixed array.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&self.seq.to_be_bytes());
        out[4..12].copy_from_slice(&self.timestamp_ns.to_be_bytes());
        out[12..16].copy_from_slice(&self.payload_size.to_be_bytes());
        out[16..24].copy_from_slice(&self.l7_id.to_be_bytes());
        out
    }

    /// Appends the serialized header to `out`.
    ///
    /// Writes exactly [`HEADER_LEN`] bytes.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.encode());
    }

    /// Parses a header from the start of `buf` without consuming it.
    ///
    /// Returns `None` when fewer than [`HEADER_LEN`] bytes are available;
    /// the caller is expected to wait for more data. The byte stream carries
    /// no message boundaries, so this is the only legal way to discover
    /// where the next frame ends.
    pub fn peek(buf: &[u8]) -> Option<FrameHeader> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        Some(FrameHeader {
            seq: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            timestamp_ns: i64::from_be_bytes([
                buf[4], buf[5], buf[6], buf[7], buf[8], buf[9], buf[10], buf[11],
            ]),
            payload_size: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
            l7_id: u64::from_be_bytes([
                buf[16], buf[17], buf[18], buf[19], buf[20], buf[21], buf[22], buf[23],
            ]),
        })
    }

    /// Total on-wire length of the frame this header describes.
    pub fn total_len(&self) -> usize {
        HEADER_LEN + self.payload_size as usize
    }
}

impl fmt::Display for FrameHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Seq={}, Timestamp={}ns, PayloadSize={}, L7Id={}",
            self.seq, self.timestamp_ns, self.payload_size, self.l7_id
        )
    }
}
