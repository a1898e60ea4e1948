//! Native-protocol frame model.
//!
//! A frame is a 9-byte header followed by an opaque body:
//! `{version:1, flags:1, streamId:2, opcode:1, length:4, body[length]}`.
//! The proxy treats bodies as opaque except where classification or
//! rewriting needs to look inside; the only header field it ever rewrites
//! is the stream id.

pub mod codec;
pub mod wire;

pub use codec::FrameCodec;

use bytes::{BufMut, Bytes, BytesMut};

/// Request/response opcodes of the native protocol (v3-v5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Error = 0x00,
    Startup = 0x01,
    Ready = 0x02,
    Authenticate = 0x03,
    Options = 0x05,
    Supported = 0x06,
    Query = 0x07,
    Result = 0x08,
    Prepare = 0x09,
    Execute = 0x0A,
    Register = 0x0B,
    Event = 0x0C,
    Batch = 0x0D,
    AuthChallenge = 0x0E,
    AuthResponse = 0x0F,
    AuthSuccess = 0x10,
}

impl Opcode {
    /// Decode a wire opcode byte. Unknown opcodes stay raw so the proxy can
    /// pass them through untouched.
    pub fn from_u8(byte: u8) -> Option<Opcode> {
        match byte {
            0x00 => Some(Opcode::Error),
            0x01 => Some(Opcode::Startup),
            0x02 => Some(Opcode::Ready),
            0x03 => Some(Opcode::Authenticate),
            0x05 => Some(Opcode::Options),
            0x06 => Some(Opcode::Supported),
            0x07 => Some(Opcode::Query),
            0x08 => Some(Opcode::Result),
            0x09 => Some(Opcode::Prepare),
            0x0A => Some(Opcode::Execute),
            0x0B => Some(Opcode::Register),
            0x0C => Some(Opcode::Event),
            0x0D => Some(Opcode::Batch),
            0x0E => Some(Opcode::AuthChallenge),
            0x0F => Some(Opcode::AuthResponse),
            0x10 => Some(Opcode::AuthSuccess),
            _ => None,
        }
    }
}

/// CQL error codes the proxy synthesizes or inspects.
pub mod error_codes {
    pub const SERVER_ERROR: i32 = 0x0000;
    pub const PROTOCOL_ERROR: i32 = 0x000A;
    pub const UNAVAILABLE: i32 = 0x1000;
    pub const OVERLOADED: i32 = 0x1001;
    pub const WRITE_TIMEOUT: i32 = 0x1100;
    pub const READ_TIMEOUT: i32 = 0x1200;
    pub const UNPREPARED: i32 = 0x2500;
}

/// The fixed 9-byte frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub flags: u8,
    pub stream_id: i16,
    pub opcode: u8,
    pub body_length: u32,
}

impl FrameHeader {
    /// Protocol version with the response direction bit stripped.
    pub fn protocol_version(&self) -> u8 {
        self.version & 0x7F
    }

    /// Response frames have the high bit of the version byte set.
    pub fn is_response(&self) -> bool {
        self.version & 0x80 != 0
    }
}

/// An undecoded frame: header plus opaque body bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub header: FrameHeader,
    pub body: Bytes,
}

impl RawFrame {
    pub fn new(version: u8, flags: u8, stream_id: i16, opcode: u8, body: Bytes) -> RawFrame {
        RawFrame {
            header: FrameHeader {
                version,
                flags,
                stream_id,
                opcode,
                body_length: body.len() as u32,
            },
            body,
        }
    }

    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_u8(self.header.opcode)
    }

    /// Cheap copy with a different stream id; the body is shared.
    pub fn with_stream_id(&self, stream_id: i16) -> RawFrame {
        let mut header = self.header;
        header.stream_id = stream_id;
        RawFrame {
            header,
            body: self.body.clone(),
        }
    }

    /// Copy with a replacement body; all other header fields are preserved.
    pub fn with_body(&self, body: Bytes) -> RawFrame {
        let mut header = self.header;
        header.body_length = body.len() as u32;
        RawFrame { header, body }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(9 + self.body.len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u8(self.header.version);
        buf.put_u8(self.header.flags);
        buf.put_i16(self.header.stream_id);
        buf.put_u8(self.header.opcode);
        buf.put_u32(self.body.len() as u32);
        buf.put_slice(&self.body);
    }

    /// Error code of an ERROR frame body, if this is one.
    pub fn error_code(&self) -> Option<i32> {
        if self.opcode() == Some(Opcode::Error) && self.body.len() >= 4 {
            Some(i32::from_be_bytes([
                self.body[0],
                self.body[1],
                self.body[2],
                self.body[3],
            ]))
        } else {
            None
        }
    }
}

/// Build a synthetic ERROR response frame addressed to `stream_id`.
///
/// The version byte gets the response bit; `request_version` should be the
/// version of the request being answered so the client's codec accepts it.
pub fn error_frame(request_version: u8, stream_id: i16, code: i32, message: &str) -> RawFrame {
    let mut body = BytesMut::with_capacity(4 + 2 + message.len());
    body.put_i32(code);
    wire::put_string(&mut body, message);
    RawFrame::new(
        (request_version & 0x7F) | 0x80,
        0,
        stream_id,
        Opcode::Error as u8,
        body.freeze(),
    )
}

/// Severity ranking used when both clusters answer with an ERROR:
/// UNAVAILABLE outranks timeouts, which outrank everything else.
pub fn error_strength(code: i32) -> u8 {
    match code {
        error_codes::UNAVAILABLE => 3,
        error_codes::READ_TIMEOUT | error_codes::WRITE_TIMEOUT => 2,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_id_rewrite_preserves_everything_else() {
        let frame = RawFrame::new(0x04, 0x00, 17, Opcode::Query as u8, Bytes::from("body"));
        let rewritten = frame.with_stream_id(-3);

        assert_eq!(rewritten.header.stream_id, -3);
        assert_eq!(rewritten.header.version, frame.header.version);
        assert_eq!(rewritten.header.flags, frame.header.flags);
        assert_eq!(rewritten.header.opcode, frame.header.opcode);
        assert_eq!(rewritten.body, frame.body);
    }

    #[test]
    fn test_error_frame_roundtrip() {
        let frame = error_frame(0x04, 5, error_codes::OVERLOADED, "cluster down");
        assert!(frame.header.is_response());
        assert_eq!(frame.header.protocol_version(), 0x04);
        assert_eq!(frame.header.stream_id, 5);
        assert_eq!(frame.error_code(), Some(error_codes::OVERLOADED));
    }

    #[test]
    fn test_error_strength_ordering() {
        assert!(error_strength(error_codes::UNAVAILABLE) > error_strength(error_codes::READ_TIMEOUT));
        assert!(error_strength(error_codes::WRITE_TIMEOUT) > error_strength(error_codes::SERVER_ERROR));
    }

    #[test]
    fn test_unknown_opcode_stays_raw() {
        let frame = RawFrame::new(0x04, 0, 1, 0x42, Bytes::new());
        assert_eq!(frame.opcode(), None);
        assert_eq!(frame.header.opcode, 0x42);
    }
}
