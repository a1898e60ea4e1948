//! Table-driven classification scenarios, exercising the classifier the
//! same way the proxy's request path does.

use bytes::Bytes;
use gemino::cql::{QueryInfo, StatementType};
use gemino::frame::RawFrame;
use gemino::statement::decode::build;
use gemino::statement::{
    inspect_frame, ForwardDecision, FrameDecodeContext, PreparedStatementCache,
    PreparedStatementInfo, StatementInfo,
};

fn seeded_cache() -> PreparedStatementCache {
    let cache = PreparedStatementCache::new(64);
    for (id, decision) in [
        ("BOTH", ForwardDecision::Both),
        ("ORIGIN", ForwardDecision::Origin),
        ("TARGET", ForwardDecision::Target),
    ] {
        cache.insert(
            Bytes::from_static(id.as_bytes()),
            PreparedStatementInfo {
                decision,
                replaced_positions: Vec::new(),
                query_info: QueryInfo::new(String::new(), StatementType::Other),
            },
        );
    }
    cache
}

fn classify(frame: RawFrame, forward_reads_to_target: bool) -> ForwardDecision {
    let cache = seeded_cache();
    let mut ctx = FrameDecodeContext::new(frame);
    inspect_frame(&mut ctx, &cache, forward_reads_to_target, None)
        .unwrap()
        .decision()
}

#[test]
fn query_decision_table() {
    let cases: Vec<(&str, bool, ForwardDecision)> = vec![
        ("SELECT blah FROM ks1.t2", false, ForwardDecision::Origin),
        ("SELECT blah FROM ks1.t1", true, ForwardDecision::Target),
        ("SELECT * FROM system.local", true, ForwardDecision::Target),
        ("SELECT * FROM system.local", false, ForwardDecision::Target),
        ("SELECT * FROM system.peers", false, ForwardDecision::Target),
        ("SELECT * FROM system.peers_v2", false, ForwardDecision::Target),
        ("SELECT * FROM system_auth.roles", false, ForwardDecision::Target),
        ("SELECT * FROM dse_insights.tokens", false, ForwardDecision::Target),
        ("INSERT blah", false, ForwardDecision::Both),
        ("UPDATE ks.t SET a = 1 WHERE k = 1", false, ForwardDecision::Both),
        ("USE ks1", false, ForwardDecision::Both),
        ("CREATE TABLE ks.t (a int PRIMARY KEY)", false, ForwardDecision::Both),
    ];

    for (cql, forward_reads, expected) in cases {
        let decision = classify(build::query_frame(4, 1, cql), forward_reads);
        assert_eq!(decision, expected, "QUERY {:?}", cql);
    }
}

#[test]
fn prepare_decision_table() {
    let cases: Vec<(&str, ForwardDecision)> = vec![
        ("SELECT blah FROM ks1.t1", ForwardDecision::Origin),
        ("SELECT * FROM system.local", ForwardDecision::Target),
        ("SELECT * FROM system.peers", ForwardDecision::Target),
        ("SELECT * FROM system.peers_v2", ForwardDecision::Target),
        ("SELECT * FROM system_auth.roles", ForwardDecision::Target),
        ("SELECT * FROM dse_insights.tokens", ForwardDecision::Target),
        ("INSERT blah", ForwardDecision::Both),
    ];

    for (cql, expected) in cases {
        let cache = seeded_cache();
        let mut ctx = FrameDecodeContext::new(build::prepare_frame(4, 1, cql));
        let info = inspect_frame(&mut ctx, &cache, false, None).unwrap();
        match info {
            StatementInfo::Prepared(prepared) => {
                assert_eq!(prepared.decision, expected, "PREPARE {:?}", cql);
            }
            other => panic!("PREPARE {:?} produced {:?}", cql, other),
        }
    }
}

#[test]
fn execute_uses_the_decision_the_prepare_was_classified_to() {
    for (id, expected) in [
        ("ORIGIN", ForwardDecision::Origin),
        ("TARGET", ForwardDecision::Target),
        ("BOTH", ForwardDecision::Both),
    ] {
        let decision = classify(build::execute_frame(4, 1, id.as_bytes()), false);
        assert_eq!(decision, expected, "EXECUTE {:?}", id);
    }
}

#[test]
fn execute_unknown_prepared_id_reports_the_exact_message() {
    let cache = seeded_cache();
    let mut ctx = FrameDecodeContext::new(build::execute_frame(4, 1, b"UNKNOWN"));
    let err = inspect_frame(&mut ctx, &cache, false, None).unwrap_err();
    assert_eq!(
        err.to_string(),
        "The preparedID of the statement to be executed (UNKNOWN) does not exist in the proxy cache"
    );
}

#[test]
fn opcode_defaults() {
    let batch = build::batch_frame(4, 1, &["INSERT INTO t (a) VALUES (1)"]);
    assert_eq!(classify(batch, false), ForwardDecision::Both);

    assert_eq!(
        classify(build::startup_frame(4, 1), false),
        ForwardDecision::Origin
    );
    assert_eq!(
        classify(build::options_frame(4, 1), false),
        ForwardDecision::Both
    );
    assert_eq!(
        classify(build::register_frame(4, 1, &["SCHEMA_CHANGE"]), false),
        ForwardDecision::Both
    );
}

#[test]
fn classification_is_pure_given_frame_cache_and_config() {
    let frame = build::query_frame(4, 9, "SELECT blah FROM ks1.t2");
    let first = classify(frame.clone(), false);
    for _ in 0..5 {
        assert_eq!(classify(frame.clone(), false), first);
    }
}

#[test]
fn prepare_then_manual_insert_then_execute_roundtrip() {
    // PREPARE classifies, the response handler caches under the returned
    // id, and the EXECUTE must come back with the exact same decision.
    let cache = PreparedStatementCache::new(8);
    let mut prepare_ctx =
        FrameDecodeContext::new(build::prepare_frame(4, 1, "SELECT a FROM ks1.t1"));
    let prepared = match inspect_frame(&mut prepare_ctx, &cache, false, None).unwrap() {
        StatementInfo::Prepared(info) => info,
        other => panic!("unexpected classification: {:?}", other),
    };

    cache.insert(
        Bytes::from_static(b"\x10\x11"),
        PreparedStatementInfo {
            decision: prepared.decision,
            replaced_positions: Vec::new(),
            query_info: prepared.query_info.clone(),
        },
    );

    let mut execute_ctx = FrameDecodeContext::new(build::execute_frame(4, 2, b"\x10\x11"));
    let info = inspect_frame(&mut execute_ctx, &cache, false, None).unwrap();
    assert_eq!(info.decision(), ForwardDecision::Origin);
    assert_eq!(info.statement_type(), Some(StatementType::Select));
}
