//! Network frames carrying buffer snapshots
//!
//! A frame is a fixed 16-byte header followed by a payload. All integers are little-endian:
//!
//! ```text
//! +-------+------+------+----------+=========+
//! | magic | type | size | checksum | payload |
//! +-------+------+------+----------+=========+
//!    u32    u32    u32      u32      `size` bytes
//! ```
//!
//! `checksum` is the sum of all payload bytes, truncated to 32 bits. A buffer snapshot payload
//! is six `u32` fields (`width`, `height`, `kind`, `format`, `size`, `stride`) followed by
//! `size` bytes of pixel data.

use super::BufferKind;
use crate::shm::{BufferData, Fourcc};

/// Marks the start of every frame, "TESS" read as a big-endian integer
pub const FRAME_MAGIC: u32 = 0x5445_5353;
/// Frame type of a buffer snapshot
pub const FRAME_TYPE_BUFFER: u32 = 1;
/// Length of the frame header in bytes
pub const FRAME_HEADER_LEN: usize = 16;

const SNAPSHOT_FIELDS_LEN: usize = 24;

/// Errors when decoding a frame
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// Not enough bytes for what the frame declares
    #[error("frame truncated: need {needed} bytes, got {got}")]
    Truncated {
        /// Bytes needed
        needed: usize,
        /// Bytes available
        got: usize,
    },
    /// The frame does not start with [`FRAME_MAGIC`]
    #[error("bad frame magic {0:#010x}")]
    BadMagic(u32),
    /// The declared payload size does not match the received one
    #[error("frame declares {declared} payload bytes, carries {actual}")]
    LengthMismatch {
        /// Size from the header
        declared: usize,
        /// Size received
        actual: usize,
    },
    /// The payload does not sum up to the header checksum
    #[error("checksum mismatch: header says {expected:#010x}, payload sums to {actual:#010x}")]
    ChecksumMismatch {
        /// Checksum from the header
        expected: u32,
        /// Checksum of the received payload
        actual: u32,
    },
    /// Unknown buffer kind tag
    #[error("unknown buffer kind {0}")]
    UnknownKind(u32),
    /// Unknown fourcc code
    #[error("unknown pixel format {0:#010x}")]
    UnknownFormat(u32),
}

/// Header of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Always [`FRAME_MAGIC`] for a valid frame
    pub magic: u32,
    /// Kind of payload
    pub frame_type: u32,
    /// Payload length in bytes
    pub size: u32,
    /// Wrapping sum of the payload bytes
    pub checksum: u32,
}

impl FrameHeader {
    /// Serialize the header
    pub fn to_bytes(&self) -> [u8; FRAME_HEADER_LEN] {
        let mut bytes = [0u8; FRAME_HEADER_LEN];
        bytes[0..4].copy_from_slice(&self.magic.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.frame_type.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.size.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Parse and validate the magic of a header
    pub fn parse(bytes: &[u8]) -> Result<FrameHeader, FrameError> {
        if bytes.len() < FRAME_HEADER_LEN {
            return Err(FrameError::Truncated {
                needed: FRAME_HEADER_LEN,
                got: bytes.len(),
            });
        }
        let header = FrameHeader {
            magic: read_u32(bytes, 0),
            frame_type: read_u32(bytes, 4),
            size: read_u32(bytes, 8),
            checksum: read_u32(bytes, 12),
        };
        if header.magic != FRAME_MAGIC {
            return Err(FrameError::BadMagic(header.magic));
        }
        Ok(header)
    }
}

/// A plain, copyable snapshot of a committed buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferSnapshot {
    /// Width in pixels
    pub width: i32,
    /// Height in pixels
    pub height: i32,
    /// Kind of buffer the snapshot was taken from
    pub kind: BufferKind,
    /// Pixel format
    pub format: Fourcc,
    /// Length of `data`
    pub size: u32,
    /// Stride in bytes
    pub stride: i32,
    /// Raw pixel bytes
    pub data: Vec<u8>,
}

impl BufferSnapshot {
    /// Copy the contents of a shared-memory buffer
    pub fn from_shm(data: BufferData, bytes: &[u8]) -> BufferSnapshot {
        BufferSnapshot {
            width: data.width,
            height: data.height,
            kind: BufferKind::Shm,
            format: data.format,
            size: bytes.len() as u32,
            stride: data.stride,
            data: bytes.to_vec(),
        }
    }

    /// Serialize into a frame payload
    pub fn to_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(SNAPSHOT_FIELDS_LEN + self.data.len());
        for field in [
            self.width as u32,
            self.height as u32,
            self.kind.tag(),
            self.format as u32,
            self.size,
            self.stride as u32,
        ] {
            payload.extend_from_slice(&field.to_le_bytes());
        }
        payload.extend_from_slice(&self.data);
        payload
    }

    /// Parse a frame payload
    pub fn from_payload(payload: &[u8]) -> Result<BufferSnapshot, FrameError> {
        if payload.len() < SNAPSHOT_FIELDS_LEN {
            return Err(FrameError::Truncated {
                needed: SNAPSHOT_FIELDS_LEN,
                got: payload.len(),
            });
        }
        let kind_tag = read_u32(payload, 8);
        let kind = BufferKind::from_tag(kind_tag).ok_or(FrameError::UnknownKind(kind_tag))?;
        let format_code = read_u32(payload, 12);
        let format = Fourcc::try_from(format_code).map_err(|_| FrameError::UnknownFormat(format_code))?;
        let size = read_u32(payload, 16);

        let data = &payload[SNAPSHOT_FIELDS_LEN..];
        if data.len() != size as usize {
            return Err(FrameError::LengthMismatch {
                declared: size as usize,
                actual: data.len(),
            });
        }

        Ok(BufferSnapshot {
            width: read_u32(payload, 0) as i32,
            height: read_u32(payload, 4) as i32,
            kind,
            format,
            size,
            stride: read_u32(payload, 20) as i32,
            data: data.to_vec(),
        })
    }
}

/// Sum of all bytes, truncated to 32 bits
pub fn checksum(payload: &[u8]) -> u32 {
    payload
        .iter()
        .fold(0u32, |sum, byte| sum.wrapping_add(*byte as u32))
}

/// Wrap a payload into a frame
pub fn encode_frame(frame_type: u32, payload: &[u8]) -> Vec<u8> {
    let header = FrameHeader {
        magic: FRAME_MAGIC,
        frame_type,
        size: payload.len() as u32,
        checksum: checksum(payload),
    };
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&header.to_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Encode a buffer snapshot frame
pub fn encode_snapshot(snapshot: &BufferSnapshot) -> Vec<u8> {
    encode_frame(FRAME_TYPE_BUFFER, &snapshot.to_payload())
}

/// Validate a complete frame and split it into header and payload
pub fn decode_frame(frame: &[u8]) -> Result<(FrameHeader, &[u8]), FrameError> {
    let header = FrameHeader::parse(frame)?;
    let payload = &frame[FRAME_HEADER_LEN..];
    if payload.len() != header.size as usize {
        return Err(FrameError::LengthMismatch {
            declared: header.size as usize,
            actual: payload.len(),
        });
    }
    let actual = checksum(payload);
    if actual != header.checksum {
        return Err(FrameError::ChecksumMismatch {
            expected: header.checksum,
            actual,
        });
    }
    Ok((header, payload))
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}
