use super::cache::PreparedStatementCache;
use super::decode::{DecodedRequest, FrameDecodeContext};
use crate::cql::{QueryInfo, StatementType, TableRef};
use crate::error::{GeminoError, Result};
use crate::frame::Opcode;
use std::sync::Arc;
use tracing::warn;

/// Which cluster(s) a request must be forwarded to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardDecision {
    Origin,
    Target,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenericStatementInfo {
    pub decision: ForwardDecision,
}

/// Classification and rewrite metadata for a prepared statement, created at
/// PREPARE time and immutable once cached.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedStatementInfo {
    pub decision: ForwardDecision,
    /// Flattened assignment indices whose function calls were replaced with
    /// literals before the PREPARE was forwarded.
    pub replaced_positions: Vec<usize>,
    pub query_info: QueryInfo,
}

/// The classification result: either a one-shot decision or the cached
/// metadata of a prepared statement.
#[derive(Debug, Clone)]
pub enum StatementInfo {
    Generic(GenericStatementInfo),
    Prepared(Arc<PreparedStatementInfo>),
}

impl StatementInfo {
    pub fn generic(decision: ForwardDecision) -> StatementInfo {
        StatementInfo::Generic(GenericStatementInfo { decision })
    }

    pub fn decision(&self) -> ForwardDecision {
        match self {
            StatementInfo::Generic(info) => info.decision,
            StatementInfo::Prepared(info) => info.decision,
        }
    }

    /// Statement type for response arbitration; EXECUTEs report the type of
    /// the statement they were prepared from.
    pub fn statement_type(&self) -> Option<StatementType> {
        match self {
            StatementInfo::Generic(_) => None,
            StatementInfo::Prepared(info) => Some(info.query_info.statement_type),
        }
    }
}

/// Tables whose reads are always served from Target because their contents
/// describe the topology the client will ultimately be connected to.
fn is_intercepted_system_table(table: &TableRef, current_keyspace: Option<&str>) -> bool {
    let keyspace = match table.keyspace.as_deref().or(current_keyspace) {
        Some(ks) => ks.to_ascii_lowercase(),
        None => return false,
    };
    let table = table.table.to_ascii_lowercase();

    match keyspace.as_str() {
        "system" => matches!(table.as_str(), "local" | "peers" | "peers_v2"),
        "system_auth" => true,
        "dse_insights" => table == "tokens",
        _ => false,
    }
}

fn select_decision(
    info: &QueryInfo,
    forward_reads_to_target: bool,
    current_keyspace: Option<&str>,
) -> ForwardDecision {
    if info.statement_type != StatementType::Select {
        return ForwardDecision::Both;
    }
    let intercepted = info
        .table
        .as_ref()
        .is_some_and(|t| is_intercepted_system_table(t, current_keyspace));
    if intercepted || forward_reads_to_target {
        ForwardDecision::Target
    } else {
        ForwardDecision::Origin
    }
}

/// Render a prepared id for the cache-miss error message: ASCII when every
/// byte is printable, hex otherwise.
fn format_prepared_id(id: &[u8]) -> String {
    if !id.is_empty() && id.iter().all(|b| (0x20..0x7F).contains(b)) {
        String::from_utf8_lossy(id).to_string()
    } else {
        id.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

/// Decide where a request frame must be forwarded.
///
/// Pure with respect to the frame bytes, the cache contents and the
/// configuration; body-decode failures fall back to the per-opcode default
/// so classification is never fatal.
pub fn inspect_frame(
    ctx: &mut FrameDecodeContext,
    cache: &PreparedStatementCache,
    forward_reads_to_target: bool,
    current_keyspace: Option<&str>,
) -> Result<StatementInfo> {
    let opcode = ctx.frame().opcode();
    match opcode {
        Some(Opcode::Query) => {
            let decision = match ctx.get_or_inspect_query() {
                Ok(info) => select_decision(info, forward_reads_to_target, current_keyspace),
                Err(e) => {
                    warn!("falling back to dual forwarding for undecodable QUERY: {}", e);
                    ForwardDecision::Both
                }
            };
            Ok(StatementInfo::generic(decision))
        }
        Some(Opcode::Prepare) => {
            let info = match ctx.get_or_inspect_query() {
                Ok(info) => info.clone(),
                Err(e) => {
                    warn!("falling back to dual forwarding for undecodable PREPARE: {}", e);
                    QueryInfo::new(String::new(), StatementType::Other)
                }
            };
            let decision = select_decision(&info, forward_reads_to_target, current_keyspace);
            Ok(StatementInfo::Prepared(Arc::new(PreparedStatementInfo {
                decision,
                replaced_positions: Vec::new(),
                query_info: info,
            })))
        }
        Some(Opcode::Execute) => {
            let prepared_id = match ctx.get_or_decode()? {
                DecodedRequest::Execute { prepared_id } => prepared_id.clone(),
                other => {
                    return Err(GeminoError::Protocol(format!(
                        "EXECUTE frame decoded as {:?}",
                        other
                    )));
                }
            };
            match cache.lookup(&prepared_id) {
                Some(info) => Ok(StatementInfo::Prepared(info)),
                None => Err(GeminoError::Classification(format!(
                    "The preparedID of the statement to be executed ({}) does not exist in the proxy cache",
                    format_prepared_id(&prepared_id)
                ))),
            }
        }
        // Batches of SELECTs are not valid CQL, so every batch is a write.
        Some(Opcode::Batch) => Ok(StatementInfo::generic(ForwardDecision::Both)),
        // Events must flow from both clusters so topology changes on either
        // side reach the client.
        Some(Opcode::Register) => Ok(StatementInfo::generic(ForwardDecision::Both)),
        // The client session is anchored to Origin's auth exchange.
        Some(Opcode::Startup) | Some(Opcode::AuthResponse) => {
            Ok(StatementInfo::generic(ForwardDecision::Origin))
        }
        Some(Opcode::Options) => Ok(StatementInfo::generic(ForwardDecision::Both)),
        // Neither cluster is silently skipped for opcodes we do not know.
        _ => Ok(StatementInfo::generic(ForwardDecision::Both)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statement::decode::build;
    use bytes::Bytes;

    fn cache_with_seeds() -> PreparedStatementCache {
        let cache = PreparedStatementCache::new(16);
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

    fn classify(frame: crate::frame::RawFrame, forward_reads: bool) -> Result<StatementInfo> {
        let cache = cache_with_seeds();
        let mut ctx = FrameDecodeContext::new(frame);
        inspect_frame(&mut ctx, &cache, forward_reads, None)
    }

    fn decision_of(result: Result<StatementInfo>) -> ForwardDecision {
        result.unwrap().decision()
    }

    #[test]
    fn test_query_select_defaults_to_origin() {
        let frame = build::query_frame(4, 1, "SELECT blah FROM ks1.t2");
        assert_eq!(decision_of(classify(frame, false)), ForwardDecision::Origin);
    }

    #[test]
    fn test_query_select_forward_reads_to_target() {
        let frame = build::query_frame(4, 1, "SELECT blah FROM ks1.t1");
        assert_eq!(decision_of(classify(frame, true)), ForwardDecision::Target);
    }

    #[test]
    fn test_query_intercepted_tables_always_target() {
        for table in [
            "system.local",
            "system.peers",
            "system.peers_v2",
            "system_auth.roles",
            "dse_insights.tokens",
        ] {
            let cql = format!("SELECT * FROM {}", table);
            let frame = build::query_frame(4, 1, &cql);
            assert_eq!(
                decision_of(classify(frame, false)),
                ForwardDecision::Target,
                "table {}",
                table
            );
        }
    }

    #[test]
    fn test_intercepted_match_is_case_insensitive() {
        let frame = build::query_frame(4, 1, "SELECT * FROM System.LOCAL");
        assert_eq!(decision_of(classify(frame, false)), ForwardDecision::Target);
    }

    #[test]
    fn test_unqualified_intercepted_table_uses_current_keyspace() {
        let cache = cache_with_seeds();
        let frame = build::query_frame(4, 1, "SELECT * FROM local");
        let mut ctx = FrameDecodeContext::new(frame);
        let info = inspect_frame(&mut ctx, &cache, false, Some("system")).unwrap();
        assert_eq!(info.decision(), ForwardDecision::Target);
    }

    #[test]
    fn test_query_non_select_goes_to_both() {
        let frame = build::query_frame(4, 1, "INSERT blah");
        assert_eq!(decision_of(classify(frame, false)), ForwardDecision::Both);
    }

    #[test]
    fn test_use_goes_to_both() {
        let frame = build::query_frame(4, 1, "USE ks1");
        assert_eq!(decision_of(classify(frame, false)), ForwardDecision::Both);
    }

    #[test]
    fn test_prepare_select_wraps_prepared_info() {
        let frame = build::prepare_frame(4, 1, "SELECT blah FROM ks1.t1");
        match classify(frame, false).unwrap() {
            StatementInfo::Prepared(info) => {
                assert_eq!(info.decision, ForwardDecision::Origin);
                assert_eq!(info.query_info.statement_type, StatementType::Select);
            }
            other => panic!("expected prepared info, got {:?}", other),
        }
    }

    #[test]
    fn test_prepare_intercepted_select_targets_target_even_without_flag() {
        let frame = build::prepare_frame(4, 1, "SELECT * FROM system.local");
        match classify(frame, false).unwrap() {
            StatementInfo::Prepared(info) => assert_eq!(info.decision, ForwardDecision::Target),
            other => panic!("expected prepared info, got {:?}", other),
        }
    }

    #[test]
    fn test_prepare_non_select_goes_to_both() {
        let frame = build::prepare_frame(4, 1, "INSERT blah");
        match classify(frame, false).unwrap() {
            StatementInfo::Prepared(info) => assert_eq!(info.decision, ForwardDecision::Both),
            other => panic!("expected prepared info, got {:?}", other),
        }
    }

    #[test]
    fn test_execute_returns_cached_decisions() {
        for (id, expected) in [
            ("ORIGIN", ForwardDecision::Origin),
            ("TARGET", ForwardDecision::Target),
            ("BOTH", ForwardDecision::Both),
        ] {
            let frame = build::execute_frame(4, 1, id.as_bytes());
            assert_eq!(decision_of(classify(frame, false)), expected, "id {}", id);
        }
    }

    #[test]
    fn test_execute_unknown_id_error_message() {
        let frame = build::execute_frame(4, 1, b"UNKNOWN");
        let err = classify(frame, false).unwrap_err();
        assert_eq!(
            err.to_string(),
            "The preparedID of the statement to be executed (UNKNOWN) does not exist in the proxy cache"
        );
    }

    #[test]
    fn test_execute_unknown_binary_id_renders_hex() {
        let frame = build::execute_frame(4, 1, &[0x00, 0xAB]);
        let err = classify(frame, false).unwrap_err();
        assert!(err.to_string().contains("(00ab)"), "got: {}", err);
    }

    #[test]
    fn test_batch_startup_options_register() {
        let batch = build::batch_frame(4, 1, &["INSERT INTO t (a) VALUES (1)"]);
        assert_eq!(decision_of(classify(batch, false)), ForwardDecision::Both);

        let startup = build::startup_frame(4, 1);
        assert_eq!(decision_of(classify(startup, false)), ForwardDecision::Origin);

        let options = build::options_frame(4, 1);
        assert_eq!(decision_of(classify(options, false)), ForwardDecision::Both);

        let register = build::register_frame(4, 1, &["SCHEMA_CHANGE"]);
        assert_eq!(decision_of(classify(register, false)), ForwardDecision::Both);
    }

    #[test]
    fn test_unknown_opcode_goes_to_both() {
        let frame = crate::frame::RawFrame::new(4, 0, 1, 0x55, Bytes::new());
        assert_eq!(decision_of(classify(frame, false)), ForwardDecision::Both);
    }
}
