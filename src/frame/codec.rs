use super::{FrameHeader, RawFrame};
use crate::error::{GeminoError, Result};
use bytes::{Buf, BytesMut};

const HEADER_LEN: usize = 9;

/// Hard cap on a single frame body; the native protocol allows 256MB.
const MAX_BODY_LEN: u32 = 256 * 1024 * 1024;

/// Incremental frame decoder.
///
/// Callers append raw socket bytes to the internal buffer (typically via
/// `read_buf` on `buffer_mut()`) and call `parse()` until it yields `None`,
/// meaning a complete frame is not available yet.
pub struct FrameCodec {
    buffer: BytesMut,
}

impl FrameCodec {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
        }
    }

    /// Add data to the codec buffer.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Get a mutable reference to the buffer.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Try to split one complete frame off the buffer.
    pub fn parse(&mut self) -> Result<Option<RawFrame>> {
        if self.buffer.len() < HEADER_LEN {
            return Ok(None);
        }

        let header = FrameHeader {
            version: self.buffer[0],
            flags: self.buffer[1],
            stream_id: i16::from_be_bytes([self.buffer[2], self.buffer[3]]),
            opcode: self.buffer[4],
            body_length: u32::from_be_bytes([
                self.buffer[5],
                self.buffer[6],
                self.buffer[7],
                self.buffer[8],
            ]),
        };

        let version = header.protocol_version();
        if !(3..=5).contains(&version) {
            return Err(GeminoError::Protocol(format!(
                "unsupported protocol version: {}",
                version
            )));
        }
        if header.body_length > MAX_BODY_LEN {
            return Err(GeminoError::Protocol(format!(
                "frame body length {} exceeds maximum",
                header.body_length
            )));
        }

        let total = HEADER_LEN + header.body_length as usize;
        if self.buffer.len() < total {
            return Ok(None);
        }

        self.buffer.advance(HEADER_LEN);
        let body = self.buffer.split_to(header.body_length as usize).freeze();
        Ok(Some(RawFrame { header, body }))
    }
}
