//! Frame layout shared by requests and responses.
//!
//! Every frame starts with a fixed 15-byte preamble:
//!
//! ```text
//! +-------------+-------------+-------------+---------+------------+------------+
//! | head_length | body_length | request_id  | version | compressor | serializer |
//! |  u32 (BE)   |  u32 (BE)   |  u32 (BE)   |   u8    |     u8     |     u8     |
//! +-------------+-------------+-------------+---------+------------+------------+
//! ```
//!
//! `head_length` counts the preamble plus the variable header section, and
//! `body_length` counts the payload that follows it. A frame is exactly
//! `head_length + body_length` bytes long.

use super::error::{ImrpcError, Result};

/// Wire protocol version. Frames carrying any other version are rejected.
pub const PROTOCOL_VERSION: u8 = 1;

/// Size of the fixed preamble.
pub const PREAMBLE_LEN: usize = 15;

/// Size of the two length fields that open every frame.
pub const LENGTH_PREFIX_LEN: usize = 8;

/// Ends a service name, a method name, a metadata pair, and the metadata section.
pub const PAIR_SEPARATOR: u8 = b'\n';

/// Splits a metadata key from its value.
pub const KV_SEPARATOR: u8 = b'\r';

/// Default upper bound on a single frame (16 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Decoded fixed preamble of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preamble {
    pub head_length: u32,
    pub body_length: u32,
    pub request_id: u32,
    pub version: u8,
    pub compressor: u8,
    pub serializer: u8,
}

impl Preamble {
    /// Parses and validates the preamble of a complete frame.
    ///
    /// Fails with a framing error if the buffer is shorter than the preamble,
    /// if the length fields disagree with the buffer size, or if the version
    /// byte does not match [`PROTOCOL_VERSION`].
    pub fn parse(frame: &[u8]) -> Result<Self> {
        if frame.len() < PREAMBLE_LEN {
            return Err(ImrpcError::Framing(format!(
                "frame of {} bytes is shorter than the {} byte preamble",
                frame.len(),
                PREAMBLE_LEN
            )));
        }

        let (head_length, body_length) = split_lengths(frame);
        let preamble = Preamble {
            head_length,
            body_length,
            request_id: read_u32(&frame[8..12]),
            version: frame[12],
            compressor: frame[13],
            serializer: frame[14],
        };

        if (head_length as usize) < PREAMBLE_LEN {
            return Err(ImrpcError::Framing(format!(
                "head length {} is shorter than the preamble",
                head_length
            )));
        }

        let expected = preamble.frame_len();
        if expected != frame.len() {
            return Err(ImrpcError::Framing(format!(
                "length fields announce {} bytes but frame has {}",
                expected,
                frame.len()
            )));
        }

        if preamble.version != PROTOCOL_VERSION {
            return Err(ImrpcError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                actual: preamble.version,
            });
        }

        Ok(preamble)
    }

    /// Total frame length announced by the length fields.
    pub fn frame_len(&self) -> usize {
        self.head_length as usize + self.body_length as usize
    }

    pub(crate) fn write(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.head_length.to_be_bytes());
        buf.extend_from_slice(&self.body_length.to_be_bytes());
        buf.extend_from_slice(&self.request_id.to_be_bytes());
        buf.push(self.version);
        buf.push(self.compressor);
        buf.push(self.serializer);
    }
}

/// Reads the two big-endian length fields from the first eight bytes.
///
/// # Panics
///
/// Panics if `prefix` is shorter than [`LENGTH_PREFIX_LEN`].
pub fn split_lengths(prefix: &[u8]) -> (u32, u32) {
    (read_u32(&prefix[0..4]), read_u32(&prefix[4..8]))
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Converts a section length to its `u32` wire representation.
pub(crate) fn wire_len(len: usize, what: &str) -> Result<u32> {
    u32::try_from(len)
        .map_err(|_| ImrpcError::Framing(format!("{} of {} bytes overflows u32", what, len)))
}
