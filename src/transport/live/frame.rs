use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const HEADER_SIZE: usize = 16;

/// Upper bound on a single frame, compressed batches included.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 10_000_000;

/// Body encodings (header `protocol_version`).
pub mod version {
    pub const PLAIN: u16 = 0;
    pub const CONTROL: u16 = 1;
    pub const DEFLATE: u16 = 2;
    pub const BROTLI: u16 = 3;
}

/// Frame purposes (header `opcode`).
pub mod op {
    pub const HEARTBEAT: u32 = 2;
    pub const HEARTBEAT_REPLY: u32 = 3;
    pub const MESSAGE: u32 = 5;
    pub const AUTH: u32 = 7;
    pub const AUTH_REPLY: u32 = 8;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("header needs 16 bytes, got {0}")]
    ShortHeader(usize),
    #[error("invalid header size {header_size} for frame of {total_size} bytes")]
    BadHeaderSize { header_size: u16, total_size: u32 },
    #[error("frame declares {declared} bytes but only {available} are available")]
    Truncated { declared: usize, available: usize },
    #[error("frame of {0} bytes exceeds limit")]
    TooLarge(usize),
}

/// Fixed 16-byte big-endian header in front of every body:
///
/// ```text
/// +------------+-------------+-----------+----------+-----------+--------+
/// | total_size | header_size | proto_ver | opcode   | sequence  | body   |
/// | u32        | u16 (=16)   | u16       | u32      | u32       | ...    |
/// +------------+-------------+-----------+----------+-----------+--------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub total_size: u32,
    pub header_size: u16,
    pub protocol_version: u16,
    pub opcode: u32,
    pub sequence: u32,
}

impl FrameHeader {
    /// Reads the header at the start of `buf`. Only the header bytes are
    /// checked here; use [`slice_body`] to validate the body bounds.
    pub fn decode(mut buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < HEADER_SIZE {
            return Err(FrameError::ShortHeader(buf.len()));
        }
        let header = Self {
            total_size: buf.get_u32(),
            header_size: buf.get_u16(),
            protocol_version: buf.get_u16(),
            opcode: buf.get_u32(),
            sequence: buf.get_u32(),
        };
        if (header.header_size as usize) < HEADER_SIZE
            || header.header_size as u32 > header.total_size
        {
            return Err(FrameError::BadHeaderSize {
                header_size: header.header_size,
                total_size: header.total_size,
            });
        }
        Ok(header)
    }

    fn put(&self, dst: &mut BytesMut) {
        dst.put_u32(self.total_size);
        dst.put_u16(self.header_size);
        dst.put_u16(self.protocol_version);
        dst.put_u32(self.opcode);
        dst.put_u32(self.sequence);
    }
}

/// Body of the frame starting at `buf[0]`, i.e. `buf[header_size..total_size]`.
pub fn slice_body<'a>(buf: &'a [u8], header: &FrameHeader) -> Result<&'a [u8], FrameError> {
    let end = header.total_size as usize;
    if end > buf.len() {
        return Err(FrameError::Truncated {
            declared: end,
            available: buf.len(),
        });
    }
    Ok(&buf[header.header_size as usize..end])
}

/// Decodes one complete frame, rejecting anything over `max_size`.
pub fn decode_frame(buf: &[u8], max_size: usize) -> Result<(FrameHeader, &[u8]), FrameError> {
    let header = FrameHeader::decode(buf)?;
    if header.total_size as usize > max_size {
        return Err(FrameError::TooLarge(header.total_size as usize));
    }
    let body = slice_body(buf, &header)?;
    Ok((header, body))
}

/// Builds outgoing frames. Owns the per-connection sequence counter, which
/// starts at 0 and never resets.
#[derive(Debug, Default)]
pub struct FrameEncoder {
    sequence: u32,
}

impl FrameEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence number the next encoded frame will carry.
    #[cfg(test)]
    pub fn next_sequence(&self) -> u32 {
        self.sequence
    }

    pub fn encode(&mut self, body: impl AsRef<[u8]>, protocol_version: u16, opcode: u32) -> Bytes {
        let body = body.as_ref();
        let header = FrameHeader {
            total_size: (HEADER_SIZE + body.len()) as u32,
            header_size: HEADER_SIZE as u16,
            protocol_version,
            opcode,
            sequence: self.sequence,
        };
        self.sequence = self.sequence.wrapping_add(1);

        let mut dst = BytesMut::with_capacity(HEADER_SIZE + body.len());
        header.put(&mut dst);
        dst.extend_from_slice(body);
        dst.freeze()
    }
}
