use super::decode::{BatchChild, DecodedRequest, FrameDecodeContext};
use crate::cql::{AssignmentKind, QueryInfo};
use crate::error::Result;
use crate::frame::{wire, Opcode};
use bytes::BytesMut;
use chrono::{DateTime, Utc};
use std::ops::Range;
use uuid::Uuid;

/// Function names whose results differ between clusters if evaluated
/// server-side; compared lower-cased.
const NON_DETERMINISTIC_FUNCTIONS: &[&str] = &[
    "now",
    "uuid",
    "currenttimestamp",
    "currentdate",
    "currenttime",
    "currenttimeuuid",
];

/// Source of the UUID/timestamp samples substituted for non-deterministic
/// function calls. Injectable so tests can pin the generated values.
pub trait NonceSource: Send + Sync {
    fn time_uuid(&self) -> Uuid;
    fn random_uuid(&self) -> Uuid;
    fn now(&self) -> DateTime<Utc>;
}

/// Production source: system clock plus a per-process random node id for
/// version-1 UUIDs.
pub struct SystemNonceSource {
    node_id: [u8; 6],
}

impl SystemNonceSource {
    pub fn new() -> SystemNonceSource {
        SystemNonceSource {
            node_id: rand::random(),
        }
    }
}

impl Default for SystemNonceSource {
    fn default() -> Self {
        Self::new()
    }
}

impl NonceSource for SystemNonceSource {
    fn time_uuid(&self) -> Uuid {
        Uuid::now_v1(&self.node_id)
    }

    fn random_uuid(&self) -> Uuid {
        Uuid::new_v4()
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

fn replacement_literal(name: &str, nonces: &dyn NonceSource) -> Option<String> {
    let literal = match name {
        "now" | "currenttimeuuid" => nonces.time_uuid().to_string(),
        "uuid" => nonces.random_uuid().to_string(),
        "currenttimestamp" => nonces.now().timestamp_millis().to_string(),
        "currentdate" => format!("'{}'", nonces.now().format("%Y-%m-%d")),
        "currenttime" => format!("'{}'", nonces.now().format("%H:%M:%S%.9f")),
        _ => return None,
    };
    Some(literal)
}

/// Collect `(span, literal)` replacements for one query text. `base` is the
/// flattened assignment index of this text's first assignment, so positions
/// stay globally numbered across BATCH children.
fn collect_replacements(
    info: &QueryInfo,
    base: usize,
    nonces: &dyn NonceSource,
    positions: &mut Vec<usize>,
) -> Vec<(Range<usize>, String)> {
    let mut replacements = Vec::new();
    for (offset, assignment) in info.assignments().enumerate() {
        if let AssignmentKind::FunctionCall { name } = &assignment.kind {
            if NON_DETERMINISTIC_FUNCTIONS.contains(&name.as_str()) {
                if let Some(literal) = replacement_literal(name, nonces) {
                    positions.push(base + offset);
                    replacements.push((assignment.value_span.clone(), literal));
                }
            }
        }
    }
    replacements
}

fn splice_text(original: &str, mut replacements: Vec<(Range<usize>, String)>) -> String {
    replacements.sort_by_key(|(range, _)| range.start);
    let mut out = String::with_capacity(original.len());
    let mut copied = 0;
    for (range, text) in replacements {
        out.push_str(&original[copied..range.start]);
        out.push_str(&text);
        copied = range.end;
    }
    out.push_str(&original[copied..]);
    out
}

/// Replace non-deterministic function calls in a request with literals
/// computed once, so Origin and Target observe identical data.
///
/// Returns the flattened assignment positions that were replaced; an empty
/// list means the context (and its frame bytes) were left untouched. Every
/// header field except the body length is preserved. Bind-marker positions
/// are unaffected: function calls are not bind markers, and the rewritten
/// text is re-inspected from scratch.
pub fn modify_frame(
    ctx: &mut FrameDecodeContext,
    nonces: &dyn NonceSource,
) -> Result<Vec<usize>> {
    match ctx.frame().opcode() {
        Some(Opcode::Query) | Some(Opcode::Prepare) => modify_query_frame(ctx, nonces),
        Some(Opcode::Batch) => modify_batch_frame(ctx, nonces),
        _ => Ok(Vec::new()),
    }
}

fn modify_query_frame(
    ctx: &mut FrameDecodeContext,
    nonces: &dyn NonceSource,
) -> Result<Vec<usize>> {
    let mut positions = Vec::new();
    let (replacements, old_query) = {
        let info = ctx.get_or_inspect_query()?;
        let replacements = collect_replacements(info, 0, nonces, &mut positions);
        (replacements, info.query().to_string())
    };
    if replacements.is_empty() {
        return Ok(positions);
    }

    let new_query = splice_text(&old_query, replacements);

    // The body starts with the `[long string]` query; everything after it
    // (consistency, flags, values) is carried over verbatim.
    let old_body = &ctx.frame().body;
    let old_query_len = 4 + old_query.len();
    let mut body = BytesMut::with_capacity(old_body.len() - old_query.len() + new_query.len());
    wire::put_long_string(&mut body, &new_query);
    body.extend_from_slice(&old_body[old_query_len..]);

    let frame = ctx.frame().with_body(body.freeze());
    *ctx = FrameDecodeContext::new(frame);
    Ok(positions)
}

fn modify_batch_frame(
    ctx: &mut FrameDecodeContext,
    nonces: &dyn NonceSource,
) -> Result<Vec<usize>> {
    let children = match ctx.get_or_decode()? {
        DecodedRequest::Batch { children } => children.clone(),
        _ => return Ok(Vec::new()),
    };
    let infos = ctx.get_or_inspect_batch()?;

    // Every child is rewritten, not just the first group, so dual-written
    // batches stay byte-identical on both clusters.
    let mut positions = Vec::new();
    let mut base = 0usize;
    let mut body_splices: Vec<(Range<usize>, String)> = Vec::new();
    for (child, info) in children.iter().zip(infos.iter()) {
        let (range, info) = match (child, info) {
            (BatchChild::Query { range, .. }, Some(info)) => (range.clone(), info),
            _ => continue,
        };
        let replacements = collect_replacements(info, base, nonces, &mut positions);
        base += info.assignment_count();
        if replacements.is_empty() {
            continue;
        }
        body_splices.push((range, splice_text(info.query(), replacements)));
    }

    if body_splices.is_empty() {
        return Ok(Vec::new());
    }

    body_splices.sort_by_key(|(range, _)| range.start);
    let old_body = &ctx.frame().body;
    let mut body = BytesMut::with_capacity(old_body.len());
    let mut copied = 0;
    for (range, new_query) in body_splices {
        body.extend_from_slice(&old_body[copied..range.start]);
        wire::put_long_string(&mut body, &new_query);
        copied = range.end;
    }
    body.extend_from_slice(&old_body[copied..]);

    let frame = ctx.frame().with_body(body.freeze());
    *ctx = FrameDecodeContext::new(frame);
    Ok(positions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cql::StatementType;
    use crate::statement::decode::build;
    use chrono::TimeZone;

    /// Deterministic source used across the rewrite tests.
    pub struct FixedNonceSource;

    impl NonceSource for FixedNonceSource {
        fn time_uuid(&self) -> Uuid {
            Uuid::parse_str("11111111-2222-1333-8444-555555555555").unwrap()
        }

        fn random_uuid(&self) -> Uuid {
            Uuid::parse_str("aaaaaaaa-bbbb-4ccc-8ddd-eeeeeeeeeeee").unwrap()
        }

        fn now(&self) -> DateTime<Utc> {
            Utc.with_ymd_and_hms(2023, 5, 17, 10, 30, 0).unwrap()
        }
    }

    #[test]
    fn test_select_is_left_untouched() {
        let frame = build::query_frame(4, 1, "SELECT blah FROM ks1.t2");
        let mut ctx = FrameDecodeContext::new(frame.clone());

        let positions = modify_frame(&mut ctx, &FixedNonceSource).unwrap();
        assert!(positions.is_empty());
        assert_eq!(ctx.frame(), &frame);
    }

    #[test]
    fn test_insert_now_is_replaced_with_literal() {
        let frame = build::query_frame(4, 7, "INSERT INTO blah (a, b) VALUES (now(), 1)");
        let mut ctx = FrameDecodeContext::new(frame.clone());

        let positions = modify_frame(&mut ctx, &FixedNonceSource).unwrap();
        assert_eq!(positions, vec![0]);

        // Header fields carry over; only the body changed.
        let new_frame = ctx.frame();
        assert_eq!(new_frame.header.version, frame.header.version);
        assert_eq!(new_frame.header.flags, frame.header.flags);
        assert_eq!(new_frame.header.stream_id, frame.header.stream_id);
        assert_eq!(new_frame.header.opcode, frame.header.opcode);
        assert_ne!(new_frame.body, frame.body);

        let info = ctx.get_or_inspect_query().unwrap();
        assert_eq!(info.statement_type, StatementType::Insert);
        assert_eq!(
            info.query(),
            "INSERT INTO blah (a, b) VALUES (11111111-2222-1333-8444-555555555555, 1)"
        );
        let assignments: Vec<_> = info.assignments().collect();
        assert_eq!(assignments.len(), 2);
        assert!(assignments[0].is_literal());
        assert!(!assignments[0].is_function_call());
        assert!(assignments[1].is_literal());
    }

    #[test]
    fn test_rewrite_preserves_assignment_indices_and_markers() {
        let frame = build::query_frame(4, 1, "INSERT INTO t (a, b, c) VALUES (?, now(), ?)");
        let mut ctx = FrameDecodeContext::new(frame);

        let original = {
            let mut probe =
                FrameDecodeContext::new(build::query_frame(4, 1, "INSERT INTO t (a, b, c) VALUES (?, now(), ?)"));
            probe.get_or_inspect_query().unwrap().clone()
        };

        let positions = modify_frame(&mut ctx, &FixedNonceSource).unwrap();
        assert_eq!(positions, vec![1]);

        let rewritten = ctx.get_or_inspect_query().unwrap();
        assert_eq!(rewritten.assignment_count(), original.assignment_count());

        let orig: Vec<_> = original.assignments().collect();
        let new: Vec<_> = rewritten.assignments().collect();
        assert_eq!(orig[0].kind, new[0].kind);
        assert_eq!(orig[2].kind, new[2].kind);
        assert_eq!(rewritten.bind_marker_count, original.bind_marker_count);
    }

    #[test]
    fn test_each_function_kind_gets_its_literal_form() {
        let frame = build::query_frame(
            4,
            1,
            "INSERT INTO t (a, b, c, d) VALUES (uuid(), currentTimestamp(), currentDate(), currentTime())",
        );
        let mut ctx = FrameDecodeContext::new(frame);

        let positions = modify_frame(&mut ctx, &FixedNonceSource).unwrap();
        assert_eq!(positions, vec![0, 1, 2, 3]);

        let query = ctx.get_or_inspect_query().unwrap().query().to_string();
        assert!(query.contains("aaaaaaaa-bbbb-4ccc-8ddd-eeeeeeeeeeee"));
        assert!(query.contains("1684319400000"));
        assert!(query.contains("'2023-05-17'"));
        assert!(query.contains("'10:30:00.000000000'"));
    }

    #[test]
    fn test_deterministic_function_calls_are_left_alone() {
        let cql = "INSERT INTO t (a, b) VALUES (toTimestamp('x'), 1)";
        let frame = build::query_frame(4, 1, cql);
        let mut ctx = FrameDecodeContext::new(frame.clone());

        let positions = modify_frame(&mut ctx, &FixedNonceSource).unwrap();
        assert!(positions.is_empty());
        assert_eq!(ctx.frame(), &frame);
    }

    #[test]
    fn test_prepare_frames_are_rewritten_too() {
        let frame = build::prepare_frame(4, 1, "UPDATE t SET v = now() WHERE k = 1");
        let mut ctx = FrameDecodeContext::new(frame);

        let positions = modify_frame(&mut ctx, &FixedNonceSource).unwrap();
        assert_eq!(positions, vec![0]);
        assert!(ctx
            .get_or_inspect_query()
            .unwrap()
            .query()
            .contains("11111111-2222-1333-8444-555555555555"));
    }

    #[test]
    fn test_batch_rewrites_every_child() {
        let frame = build::batch_frame(
            4,
            1,
            &[
                "INSERT INTO t (a, b) VALUES (now(), 1)",
                "INSERT INTO t (a, b) VALUES (2, 3)",
                "UPDATE t SET v = uuid() WHERE k = 1",
            ],
        );
        let mut ctx = FrameDecodeContext::new(frame.clone());

        let positions = modify_frame(&mut ctx, &FixedNonceSource).unwrap();
        // Child 1 assignment 0, then child 3's single assignment at
        // flattened position 4 (2 + 2 assignments before it).
        assert_eq!(positions, vec![0, 4]);

        let children = match ctx.get_or_decode().unwrap() {
            DecodedRequest::Batch { children } => children.clone(),
            other => panic!("unexpected decode: {:?}", other),
        };
        match &children[0] {
            BatchChild::Query { cql, .. } => {
                assert_eq!(
                    cql,
                    "INSERT INTO t (a, b) VALUES (11111111-2222-1333-8444-555555555555, 1)"
                );
            }
            other => panic!("unexpected child: {:?}", other),
        }
        match &children[1] {
            BatchChild::Query { cql, .. } => {
                assert_eq!(cql, "INSERT INTO t (a, b) VALUES (2, 3)")
            }
            other => panic!("unexpected child: {:?}", other),
        }
        match &children[2] {
            BatchChild::Query { cql, .. } => {
                assert_eq!(
                    cql,
                    "UPDATE t SET v = aaaaaaaa-bbbb-4ccc-8ddd-eeeeeeeeeeee WHERE k = 1"
                );
            }
            other => panic!("unexpected child: {:?}", other),
        }

        // The trailing consistency/flags bytes survive the splice.
        let old_tail = &frame.body[frame.body.len() - 3..];
        let new_body = &ctx.frame().body;
        assert_eq!(&new_body[new_body.len() - 3..], old_tail);
    }

    #[test]
    fn test_execute_frames_are_never_rewritten() {
        let frame = build::execute_frame(4, 1, b"SOMEID");
        let mut ctx = FrameDecodeContext::new(frame.clone());

        let positions = modify_frame(&mut ctx, &FixedNonceSource).unwrap();
        assert!(positions.is_empty());
        assert_eq!(ctx.frame(), &frame);
    }
}
