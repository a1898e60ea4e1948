use super::cluster::{ClusterConnector, ClusterKind, StreamIdPool};
use crate::error::{GeminoError, Result};
use crate::frame::{self, error_codes, wire, Opcode, RawFrame};
use crate::observability::ProxyMetrics;
use crate::statement::cache::{ExecuteGuard, PreparedStatementCache};
use crate::statement::{ForwardDecision, PreparedStatementInfo, StatementInfo};
use bytes::{BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// RESULT body kind for a prepared-statement response.
const RESULT_KIND_PREPARED: i32 = 0x0004;

/// Per-request metadata the session hands to the dispatcher alongside the
/// (possibly rewritten) frame.
pub struct RequestMeta {
    /// Whether the statement mutates data; decides timeout flavour and the
    /// Target-error arbitration rule.
    pub is_write: bool,
    /// For PREPAREs: the metadata to cache once the server returns an id.
    pub prepare_capture: Option<PreparedStatementInfo>,
    /// For EXECUTEs: pin on the cache entry for the request's lifetime.
    pub execute_pin: Option<ExecuteGuard>,
}

impl RequestMeta {
    pub fn new(is_write: bool) -> RequestMeta {
        RequestMeta {
            is_write,
            prepare_capture: None,
            execute_pin: None,
        }
    }
}

/// Per-client-connection dual dispatcher: reserves upstream stream ids,
/// transmits twin requests, and correlates the responses into one reply.
pub struct Dispatcher {
    origin: Arc<ClusterConnector>,
    target: Arc<ClusterConnector>,
    cache: Arc<PreparedStatementCache>,
    metrics: Arc<ProxyMetrics>,
    request_timeout: Duration,
    /// Client stream ids with a request in flight; a duplicate is a
    /// protocol invariant violation that closes the connection.
    client_ids: Arc<DashMap<i16, ()>>,
}

impl Dispatcher {
    pub fn new(
        origin: Arc<ClusterConnector>,
        target: Arc<ClusterConnector>,
        cache: Arc<PreparedStatementCache>,
        metrics: Arc<ProxyMetrics>,
        request_timeout: Duration,
    ) -> Dispatcher {
        Dispatcher {
            origin,
            target,
            cache,
            metrics,
            request_timeout,
            client_ids: Arc::new(DashMap::new()),
        }
    }

    /// Reserve stream ids and transmit the request to each chosen cluster.
    ///
    /// This is the backpressured half of dispatch: it runs on the client
    /// read path and waits on stream-id pools. The returned value is
    /// awaited in a separate task via [`InFlightRequest::complete`].
    pub async fn start(
        &self,
        frame: RawFrame,
        info: &StatementInfo,
        meta: RequestMeta,
    ) -> Result<InFlightRequest> {
        let client_stream_id = frame.header.stream_id;
        if self.client_ids.insert(client_stream_id, ()).is_some() {
            return Err(GeminoError::InvariantViolation(format!(
                "client stream id {} already has a request in flight",
                client_stream_id
            )));
        }

        let chosen = self.choose_clusters(info.decision());
        let mut legs = Vec::with_capacity(chosen.len());
        for connector in chosen {
            match self.open_leg(connector, &frame).await {
                Ok(leg) => legs.push(leg),
                Err(e) => {
                    warn!(
                        "could not dispatch to {} cluster: {}",
                        connector.kind(),
                        e
                    );
                    self.metrics.cluster(connector.kind()).errors.inc();
                }
            }
        }

        Ok(InFlightRequest {
            client_stream_id,
            version: frame.header.version,
            opcode: frame.header.opcode,
            is_write: meta.is_write,
            legs,
            timeout: self.request_timeout,
            client_ids: Arc::clone(&self.client_ids),
            cache: Arc::clone(&self.cache),
            metrics: Arc::clone(&self.metrics),
            prepare_capture: meta.prepare_capture,
            _execute_pin: meta.execute_pin,
        })
    }

    /// The connectors a decision maps to, degrading `Both` to the healthy
    /// side when one cluster has been marked down. With both clusters down
    /// the list is empty and the request fails fast as OVERLOADED rather
    /// than paying for two doomed dials.
    fn choose_clusters(&self, decision: ForwardDecision) -> Vec<&Arc<ClusterConnector>> {
        match decision {
            ForwardDecision::Origin => vec![&self.origin],
            ForwardDecision::Target => vec![&self.target],
            ForwardDecision::Both => {
                let origin_ok = self.origin.health().is_healthy();
                let target_ok = self.target.health().is_healthy();
                if origin_ok && target_ok {
                    vec![&self.origin, &self.target]
                } else if origin_ok {
                    self.metrics.degraded_dispatches.inc();
                    debug!("target unhealthy, degrading dual dispatch to origin");
                    vec![&self.origin]
                } else if target_ok {
                    self.metrics.degraded_dispatches.inc();
                    debug!("origin unhealthy, degrading dual dispatch to target");
                    vec![&self.target]
                } else {
                    debug!("both clusters unhealthy, failing dual dispatch fast");
                    Vec::new()
                }
            }
        }
    }

    async fn open_leg(&self, connector: &Arc<ClusterConnector>, frame: &RawFrame) -> Result<Leg> {
        let conn = connector.connection().await?;
        let stream_id = conn.pool().acquire().await?;
        let rx = match conn.send(frame.with_stream_id(stream_id)).await {
            Ok(rx) => rx,
            Err(e) => {
                conn.pool().release(stream_id).await;
                return Err(e);
            }
        };
        self.metrics.cluster(connector.kind()).requests.inc();
        Ok(Leg {
            kind: connector.kind(),
            stream_id,
            pool: Arc::clone(conn.pool()),
            rx,
        })
    }
}

struct Leg {
    kind: ClusterKind,
    stream_id: i16,
    pool: Arc<StreamIdPool>,
    rx: oneshot::Receiver<RawFrame>,
}

enum LegOutcome {
    Response(RawFrame),
    /// The upstream connection died while the request was pending.
    Dropped,
    TimedOut,
}

/// Wait for one leg, returning its stream id to the pool as soon as the
/// response (or the connection teardown) arrives. On timeout the id is
/// reclaimed in the background by a detached task.
async fn settle_leg(leg: Leg, deadline: tokio::time::Instant) -> (ClusterKind, LegOutcome) {
    let Leg {
        kind,
        stream_id,
        pool,
        mut rx,
    } = leg;
    match tokio::time::timeout_at(deadline, &mut rx).await {
        Ok(Ok(frame)) => {
            pool.release(stream_id).await;
            (kind, LegOutcome::Response(frame))
        }
        Ok(Err(_)) => {
            pool.release(stream_id).await;
            (kind, LegOutcome::Dropped)
        }
        Err(_) => {
            tokio::spawn(async move {
                let _ = rx.await;
                pool.release(stream_id).await;
            });
            (kind, LegOutcome::TimedOut)
        }
    }
}

/// A dispatched request awaiting its upstream response(s).
pub struct InFlightRequest {
    client_stream_id: i16,
    version: u8,
    opcode: u8,
    is_write: bool,
    legs: Vec<Leg>,
    timeout: Duration,
    client_ids: Arc<DashMap<i16, ()>>,
    cache: Arc<PreparedStatementCache>,
    metrics: Arc<ProxyMetrics>,
    prepare_capture: Option<PreparedStatementInfo>,
    _execute_pin: Option<ExecuteGuard>,
}

impl InFlightRequest {
    /// Wait for the authoritative response and return it with the client's
    /// stream id restored. Always yields a reply frame; upstream failures
    /// and deadline expiry become synthetic errors.
    pub async fn complete(mut self) -> RawFrame {
        let reply = self.await_authoritative().await;
        self.client_ids.remove(&self.client_stream_id);
        reply.with_stream_id(self.client_stream_id)
    }

    async fn await_authoritative(&mut self) -> RawFrame {
        let deadline = tokio::time::Instant::now() + self.timeout;
        let mut legs = std::mem::take(&mut self.legs);

        let reply = match legs.len() {
            0 => frame::error_frame(
                self.version,
                0,
                error_codes::OVERLOADED,
                "proxy could not reach any cluster for this request",
            ),
            1 => {
                let leg = legs.remove(0);
                let (kind, outcome) = settle_leg(leg, deadline).await;
                self.resolve_single(kind, outcome)
            }
            _ => {
                let second = legs.remove(1);
                let first = legs.remove(0);
                let (first, second) =
                    tokio::join!(settle_leg(first, deadline), settle_leg(second, deadline));
                self.resolve_pair(first, second)
            }
        };

        if let (Some(info), Some(id)) = (self.prepare_capture.take(), captured_prepared_id(&reply))
        {
            self.cache.insert(id, info);
        }
        reply
    }

    fn resolve_single(&self, kind: ClusterKind, outcome: LegOutcome) -> RawFrame {
        match outcome {
            LegOutcome::Response(frame) => frame,
            LegOutcome::Dropped => {
                self.metrics.cluster(kind).errors.inc();
                frame::error_frame(
                    self.version,
                    0,
                    error_codes::OVERLOADED,
                    &format!("{} cluster connection was lost", kind),
                )
            }
            LegOutcome::TimedOut => {
                self.metrics.timeouts.inc();
                self.synthesize_timeout(kind)
            }
        }
    }

    fn resolve_pair(
        &self,
        first: (ClusterKind, LegOutcome),
        second: (ClusterKind, LegOutcome),
    ) -> RawFrame {
        let origin = self.materialize(first);
        let target = self.materialize(second);

        if Opcode::from_u8(self.opcode) == Some(Opcode::Options) {
            if let Some(merged) = merge_supported(&origin, &target) {
                return merged;
            }
        }

        select_response(&origin, &target, self.is_write).clone()
    }

    /// Turn a leg outcome into a concrete frame so the selection table can
    /// treat synthesized failures like upstream ERRORs.
    fn materialize(&self, (kind, outcome): (ClusterKind, LegOutcome)) -> RawFrame {
        self.resolve_single(kind, outcome)
    }

    fn synthesize_timeout(&self, kind: ClusterKind) -> RawFrame {
        let (code, message) = if self.is_write {
            (
                error_codes::WRITE_TIMEOUT,
                format!("proxy timed out waiting for {} to apply a write", kind),
            )
        } else {
            (
                error_codes::READ_TIMEOUT,
                format!("proxy timed out waiting for {} to serve a read", kind),
            )
        };

        let mut body = BytesMut::new();
        body.put_i32(code);
        wire::put_string(&mut body, &message);
        body.put_u16(0x0001); // consistency ONE
        body.put_i32(0); // received
        body.put_i32(1); // blockfor
        if self.is_write {
            wire::put_string(&mut body, "SIMPLE");
        } else {
            body.put_u8(0); // data_present
        }
        RawFrame::new(
            (self.version & 0x7F) | 0x80,
            0,
            0,
            Opcode::Error as u8,
            body.freeze(),
        )
    }
}

/// The authoritative-response table for dual dispatch. Origin is the source
/// of truth while reads are served from it, so its RESULT wins; any ERROR
/// wins over a RESULT except a Target ERROR on a read; two ERRORs pick the
/// stronger category, Origin on ties.
fn select_response<'a>(origin: &'a RawFrame, target: &'a RawFrame, is_write: bool) -> &'a RawFrame {
    match (origin.error_code(), target.error_code()) {
        (None, None) => origin,
        (Some(_), None) => origin,
        (None, Some(_)) => {
            if is_write {
                target
            } else {
                origin
            }
        }
        (Some(o), Some(t)) => {
            if frame::error_strength(t) > frame::error_strength(o) {
                target
            } else {
                origin
            }
        }
    }
}

/// Key-wise intersection of two SUPPORTED responses, so the client only
/// negotiates options both clusters accept.
fn merge_supported(origin: &RawFrame, target: &RawFrame) -> Option<RawFrame> {
    if origin.opcode() != Some(Opcode::Supported) || target.opcode() != Some(Opcode::Supported) {
        return None;
    }
    let origin_map = wire::Reader::new(&origin.body).get_string_multimap().ok()?;
    let target_map = wire::Reader::new(&target.body).get_string_multimap().ok()?;

    let mut merged: HashMap<String, Vec<String>> = HashMap::new();
    for (key, values) in origin_map {
        if let Some(target_values) = target_map.get(&key) {
            let common: Vec<String> = values
                .into_iter()
                .filter(|v| target_values.contains(v))
                .collect();
            merged.insert(key, common);
        }
    }

    let mut body = BytesMut::new();
    wire::put_string_multimap(&mut body, &merged);
    Some(origin.with_body(body.freeze()))
}

/// The prepared id of a RESULT/Prepared frame, if that is what this is.
fn captured_prepared_id(frame: &RawFrame) -> Option<Bytes> {
    if frame.opcode() != Some(Opcode::Result) {
        return None;
    }
    let mut reader = wire::Reader::new(&frame.body);
    if reader.get_i32().ok()? != RESULT_KIND_PREPARED {
        return None;
    }
    Some(Bytes::copy_from_slice(reader.get_short_bytes().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeartbeatSettings;
    use crate::proxy::cluster::ClusterHealth;
    use crate::statement::decode::build;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn down_connector(kind: ClusterKind) -> Arc<ClusterConnector> {
        let health = Arc::new(ClusterHealth::new(kind, 1));
        health.record_failure();
        let (event_tx, _event_rx) = mpsc::channel(4);
        Arc::new(ClusterConnector::new(
            kind,
            "127.0.0.1:9".to_string(),
            HeartbeatSettings::default(),
            health,
            event_tx,
            8,
            1024,
            CancellationToken::new(),
        ))
    }

    #[tokio::test]
    async fn test_dual_dispatch_fails_fast_when_both_clusters_are_down() {
        let dispatcher = Dispatcher::new(
            down_connector(ClusterKind::Origin),
            down_connector(ClusterKind::Target),
            Arc::new(PreparedStatementCache::new(8)),
            Arc::new(ProxyMetrics::new()),
            Duration::from_millis(200),
        );

        let frame = build::query_frame(4, 7, "INSERT INTO ks.t (a) VALUES (1)");
        let info = StatementInfo::generic(ForwardDecision::Both);
        let in_flight = dispatcher
            .start(frame, &info, RequestMeta::new(true))
            .await
            .unwrap();
        let reply = in_flight.complete().await;

        assert_eq!(reply.error_code(), Some(error_codes::OVERLOADED));
        assert_eq!(reply.header.stream_id, 7);
    }

    fn result_frame(marker: u8) -> RawFrame {
        RawFrame::new(0x84, 0, 0, Opcode::Result as u8, Bytes::copy_from_slice(&[0, 0, 0, 1, marker]))
    }

    fn error(code: i32) -> RawFrame {
        frame::error_frame(0x04, 0, code, "boom")
    }

    #[test]
    fn test_selection_prefers_origin_result() {
        let origin = result_frame(1);
        let target = result_frame(2);
        assert_eq!(select_response(&origin, &target, true), &origin);
        assert_eq!(select_response(&origin, &target, false), &origin);
    }

    #[test]
    fn test_selection_origin_error_always_wins() {
        let origin = error(error_codes::SERVER_ERROR);
        let target = result_frame(1);
        assert_eq!(select_response(&origin, &target, false), &origin);
        assert_eq!(select_response(&origin, &target, true), &origin);
    }

    #[test]
    fn test_selection_target_error_only_wins_for_writes() {
        let origin = result_frame(1);
        let target = error(error_codes::SERVER_ERROR);
        assert_eq!(select_response(&origin, &target, true), &target);
        assert_eq!(select_response(&origin, &target, false), &origin);
    }

    #[test]
    fn test_selection_double_error_picks_stronger_category() {
        let origin = error(error_codes::SERVER_ERROR);
        let target = error(error_codes::UNAVAILABLE);
        assert_eq!(select_response(&origin, &target, true), &target);

        let origin = error(error_codes::UNAVAILABLE);
        let target = error(error_codes::READ_TIMEOUT);
        assert_eq!(select_response(&origin, &target, true), &origin);

        // Ties go to origin.
        let origin = error(error_codes::READ_TIMEOUT);
        let target = error(error_codes::WRITE_TIMEOUT);
        assert_eq!(select_response(&origin, &target, true), &origin);
    }

    fn supported_frame(pairs: &[(&str, &[&str])]) -> RawFrame {
        let mut map = HashMap::new();
        for (key, values) in pairs {
            map.insert(
                key.to_string(),
                values.iter().map(|v| v.to_string()).collect(),
            );
        }
        let mut body = BytesMut::new();
        wire::put_string_multimap(&mut body, &map);
        RawFrame::new(0x84, 0, 0, Opcode::Supported as u8, body.freeze())
    }

    #[test]
    fn test_merge_supported_intersects_options() {
        let origin = supported_frame(&[
            ("CQL_VERSION", &["3.0.0", "3.4.5"]),
            ("COMPRESSION", &["lz4", "snappy"]),
            ("ORIGIN_ONLY", &["x"]),
        ]);
        let target = supported_frame(&[
            ("CQL_VERSION", &["3.4.5"]),
            ("COMPRESSION", &["snappy", "lz4"]),
        ]);

        let merged = merge_supported(&origin, &target).unwrap();
        let map = wire::Reader::new(&merged.body).get_string_multimap().unwrap();
        assert_eq!(map.get("CQL_VERSION").unwrap(), &vec!["3.4.5".to_string()]);
        assert_eq!(
            map.get("COMPRESSION").unwrap(),
            &vec!["lz4".to_string(), "snappy".to_string()]
        );
        assert!(!map.contains_key("ORIGIN_ONLY"));
    }

    #[test]
    fn test_merge_supported_rejects_non_supported_frames() {
        let origin = supported_frame(&[("CQL_VERSION", &["3.0.0"])]);
        let target = result_frame(1);
        assert!(merge_supported(&origin, &target).is_none());
    }

    #[test]
    fn test_captured_prepared_id() {
        let mut body = BytesMut::new();
        body.put_i32(RESULT_KIND_PREPARED);
        wire::put_short_bytes(&mut body, b"PREPID");
        let frame = RawFrame::new(0x84, 0, 0, Opcode::Result as u8, body.freeze());

        assert_eq!(captured_prepared_id(&frame).unwrap().as_ref(), b"PREPID");
    }

    #[test]
    fn test_rows_result_is_not_a_prepared_id() {
        let frame = result_frame(2);
        assert!(captured_prepared_id(&frame).is_none());
    }
}
