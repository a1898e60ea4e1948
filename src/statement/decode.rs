use crate::cql::{parse_query, QueryInfo};
use crate::error::{GeminoError, Result};
use crate::frame::{wire::Reader, Opcode, RawFrame};
use bytes::Bytes;
use std::ops::Range;

/// One entry of a BATCH request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchChild {
    /// Inline query; `range` covers the `[long string]` (length prefix
    /// included) inside the frame body, so the rewriter can splice a
    /// replacement without re-encoding the rest of the batch.
    Query { cql: String, range: Range<usize> },
    Prepared { id: Bytes },
}

/// A request frame decoded just deep enough for classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedRequest {
    Query { cql: String },
    Prepare { cql: String },
    Execute { prepared_id: Bytes },
    Batch { children: Vec<BatchChild> },
    Register { events: Vec<String> },
    Startup,
    Options,
    AuthResponse,
    /// Anything the proxy does not look inside, including unknown opcodes.
    Other,
}

/// Bit set on the frame flags byte when the body is compressed; compressed
/// bodies cannot be inspected and fall back to per-opcode defaults.
const FLAG_COMPRESSED: u8 = 0x01;

fn decode_request(frame: &RawFrame) -> Result<DecodedRequest> {
    if frame.header.flags & FLAG_COMPRESSED != 0 {
        return Ok(DecodedRequest::Other);
    }

    let mut reader = Reader::new(&frame.body);
    let decoded = match frame.opcode() {
        Some(Opcode::Query) => DecodedRequest::Query {
            cql: reader.get_long_string()?,
        },
        Some(Opcode::Prepare) => DecodedRequest::Prepare {
            cql: reader.get_long_string()?,
        },
        Some(Opcode::Execute) => DecodedRequest::Execute {
            prepared_id: Bytes::copy_from_slice(reader.get_short_bytes()?),
        },
        Some(Opcode::Batch) => DecodedRequest::Batch {
            children: decode_batch_children(&mut reader)?,
        },
        Some(Opcode::Register) => DecodedRequest::Register {
            events: reader.get_string_list()?,
        },
        Some(Opcode::Startup) => DecodedRequest::Startup,
        Some(Opcode::Options) => DecodedRequest::Options,
        Some(Opcode::AuthResponse) => DecodedRequest::AuthResponse,
        _ => DecodedRequest::Other,
    };
    Ok(decoded)
}

fn decode_batch_children(reader: &mut Reader<'_>) -> Result<Vec<BatchChild>> {
    let _batch_type = reader.get_u8()?;
    let count = reader.get_u16()? as usize;
    let mut children = Vec::with_capacity(count);

    for _ in 0..count {
        let kind = reader.get_u8()?;
        match kind {
            0 => {
                let start = reader.position();
                let cql = reader.get_long_string()?;
                let range = start..reader.position();
                children.push(BatchChild::Query { cql, range });
            }
            1 => {
                let id = Bytes::copy_from_slice(reader.get_short_bytes()?);
                children.push(BatchChild::Prepared { id });
            }
            other => {
                return Err(GeminoError::Protocol(format!(
                    "unknown batch child kind: {}",
                    other
                )));
            }
        }
        // Skip this child's value list to reach the next child.
        let values = reader.get_u16()? as usize;
        for _ in 0..values {
            reader.get_bytes()?;
        }
    }

    Ok(children)
}

/// Wraps a RawFrame and memoises its decoded form and CQL inspection, so
/// every consumer along the classify/rewrite chain sees the same result and
/// the body is parsed at most once.
#[derive(Debug)]
pub struct FrameDecodeContext {
    frame: RawFrame,
    /// Decode outcome, failures included, so a malformed body is decoded
    /// exactly once no matter how many consumers ask.
    decoded: Option<std::result::Result<DecodedRequest, String>>,
    query_info: Option<QueryInfo>,
    batch_infos: Option<Vec<Option<QueryInfo>>>,
}

impl FrameDecodeContext {
    pub fn new(frame: RawFrame) -> FrameDecodeContext {
        FrameDecodeContext {
            frame,
            decoded: None,
            query_info: None,
            batch_infos: None,
        }
    }

    pub fn frame(&self) -> &RawFrame {
        &self.frame
    }

    pub fn into_frame(self) -> RawFrame {
        self.frame
    }

    pub fn get_or_decode(&mut self) -> Result<&DecodedRequest> {
        if self.decoded.is_none() {
            let decoded = decode_request(&self.frame).map_err(|e| match e {
                GeminoError::Protocol(message) => message,
                other => other.to_string(),
            });
            self.decoded = Some(decoded);
        }
        match self.decoded.as_ref().unwrap() {
            Ok(decoded) => Ok(decoded),
            Err(message) => Err(GeminoError::Protocol(message.clone())),
        }
    }

    /// The parsed CQL of a QUERY or PREPARE frame; errors for other opcodes.
    pub fn get_or_inspect_query(&mut self) -> Result<&QueryInfo> {
        if self.query_info.is_none() {
            let cql = match self.get_or_decode()? {
                DecodedRequest::Query { cql } | DecodedRequest::Prepare { cql } => cql.clone(),
                other => {
                    return Err(GeminoError::Protocol(format!(
                        "no inline query in {:?} frame",
                        other
                    )));
                }
            };
            self.query_info = Some(parse_query(&cql));
        }
        Ok(self.query_info.as_ref().unwrap())
    }

    /// Per-child parse results of a BATCH frame; `None` entries are
    /// prepared-id children with no inline CQL.
    pub fn get_or_inspect_batch(&mut self) -> Result<&[Option<QueryInfo>]> {
        if self.batch_infos.is_none() {
            let infos = match self.get_or_decode()? {
                DecodedRequest::Batch { children } => children
                    .iter()
                    .map(|child| match child {
                        BatchChild::Query { cql, .. } => Some(parse_query(cql)),
                        BatchChild::Prepared { .. } => None,
                    })
                    .collect(),
                other => {
                    return Err(GeminoError::Protocol(format!(
                        "not a batch frame: {:?}",
                        other
                    )));
                }
            };
            self.batch_infos = Some(infos);
        }
        Ok(self.batch_infos.as_deref().unwrap())
    }
}

/// Builders for the request frames the proxy itself originates (the
/// upstream handshake) and for tests.
pub mod build {
    use crate::frame::{wire, Opcode, RawFrame};
    use bytes::BytesMut;

    pub fn query_frame(version: u8, stream_id: i16, cql: &str) -> RawFrame {
        let mut body = BytesMut::new();
        wire::put_long_string(&mut body, cql);
        // Consistency ONE, no flags: the minimal v3/v4 query parameters.
        body.extend_from_slice(&[0x00, 0x01, 0x00]);
        RawFrame::new(version, 0, stream_id, Opcode::Query as u8, body.freeze())
    }

    pub fn prepare_frame(version: u8, stream_id: i16, cql: &str) -> RawFrame {
        let mut body = BytesMut::new();
        wire::put_long_string(&mut body, cql);
        RawFrame::new(version, 0, stream_id, Opcode::Prepare as u8, body.freeze())
    }

    pub fn execute_frame(version: u8, stream_id: i16, prepared_id: &[u8]) -> RawFrame {
        let mut body = BytesMut::new();
        wire::put_short_bytes(&mut body, prepared_id);
        body.extend_from_slice(&[0x00, 0x01, 0x00]);
        RawFrame::new(version, 0, stream_id, Opcode::Execute as u8, body.freeze())
    }

    pub fn startup_frame(version: u8, stream_id: i16) -> RawFrame {
        let mut body = BytesMut::new();
        body.extend_from_slice(&1u16.to_be_bytes());
        wire::put_string(&mut body, "CQL_VERSION");
        wire::put_string(&mut body, "3.0.0");
        RawFrame::new(version, 0, stream_id, Opcode::Startup as u8, body.freeze())
    }

    pub fn options_frame(version: u8, stream_id: i16) -> RawFrame {
        RawFrame::new(version, 0, stream_id, Opcode::Options as u8, bytes::Bytes::new())
    }

    pub fn batch_frame(version: u8, stream_id: i16, queries: &[&str]) -> RawFrame {
        let mut body = BytesMut::new();
        body.extend_from_slice(&[0x00]); // logged batch
        body.extend_from_slice(&(queries.len() as u16).to_be_bytes());
        for cql in queries {
            body.extend_from_slice(&[0x00]); // inline query child
            wire::put_long_string(&mut body, cql);
            body.extend_from_slice(&0u16.to_be_bytes()); // no values
        }
        body.extend_from_slice(&[0x00, 0x01, 0x00]); // consistency ONE, flags 0
        RawFrame::new(version, 0, stream_id, Opcode::Batch as u8, body.freeze())
    }

    pub fn register_frame(version: u8, stream_id: i16, events: &[&str]) -> RawFrame {
        let mut body = BytesMut::new();
        let events: Vec<String> = events.iter().map(|e| e.to_string()).collect();
        wire::put_string_list(&mut body, &events);
        RawFrame::new(version, 0, stream_id, Opcode::Register as u8, body.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cql::StatementType;

    #[test]
    fn test_decode_query_frame() {
        let frame = build::query_frame(4, 1, "SELECT * FROM ks.t");
        let mut ctx = FrameDecodeContext::new(frame);

        match ctx.get_or_decode().unwrap() {
            DecodedRequest::Query { cql } => assert_eq!(cql, "SELECT * FROM ks.t"),
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn test_inspection_is_memoised() {
        let frame = build::query_frame(4, 1, "SELECT * FROM ks.t");
        let mut ctx = FrameDecodeContext::new(frame);

        let first = ctx.get_or_inspect_query().unwrap() as *const QueryInfo;
        let second = ctx.get_or_inspect_query().unwrap() as *const QueryInfo;
        assert_eq!(first, second);
    }

    #[test]
    fn test_decode_execute_frame() {
        let frame = build::execute_frame(4, 1, b"SOMEID");
        let mut ctx = FrameDecodeContext::new(frame);

        match ctx.get_or_decode().unwrap() {
            DecodedRequest::Execute { prepared_id } => {
                assert_eq!(prepared_id.as_ref(), b"SOMEID")
            }
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn test_decode_batch_children_with_ranges() {
        let frame = build::batch_frame(4, 1, &["INSERT INTO t (a) VALUES (1)", "DELETE FROM t WHERE a = 1"]);
        let body = frame.body.clone();
        let mut ctx = FrameDecodeContext::new(frame);

        let children = match ctx.get_or_decode().unwrap() {
            DecodedRequest::Batch { children } => children.clone(),
            other => panic!("unexpected decode: {:?}", other),
        };
        assert_eq!(children.len(), 2);

        for child in &children {
            match child {
                BatchChild::Query { cql, range } => {
                    let slice = &body[range.start + 4..range.end];
                    assert_eq!(std::str::from_utf8(slice).unwrap(), cql);
                }
                BatchChild::Prepared { .. } => panic!("expected inline child"),
            }
        }

        let infos = ctx.get_or_inspect_batch().unwrap();
        assert_eq!(
            infos[0].as_ref().unwrap().statement_type,
            StatementType::Insert
        );
        assert_eq!(
            infos[1].as_ref().unwrap().statement_type,
            StatementType::Delete
        );
    }

    #[test]
    fn test_compressed_body_degrades_to_other() {
        let mut frame = build::query_frame(4, 1, "SELECT * FROM ks.t");
        frame.header.flags |= FLAG_COMPRESSED;
        let mut ctx = FrameDecodeContext::new(frame);

        assert_eq!(ctx.get_or_decode().unwrap(), &DecodedRequest::Other);
    }

    #[test]
    fn test_truncated_query_body_is_an_error() {
        let frame = RawFrame::new(4, 0, 1, Opcode::Query as u8, Bytes::from_static(&[0, 0]));
        let mut ctx = FrameDecodeContext::new(frame);

        assert!(ctx.get_or_decode().is_err());
    }

    #[test]
    fn test_decode_failure_is_memoised() {
        let frame = RawFrame::new(4, 0, 1, Opcode::Query as u8, Bytes::from_static(&[0, 0]));
        let mut ctx = FrameDecodeContext::new(frame);

        let first = ctx.get_or_decode().unwrap_err().to_string();
        let second = ctx.get_or_decode().unwrap_err().to_string();
        assert_eq!(first, second);

        // The query-inspection path sees the same cached failure.
        assert!(ctx.get_or_inspect_query().is_err());
    }
}
