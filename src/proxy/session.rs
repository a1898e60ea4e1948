use super::cluster::{ClusterConnector, ClusterHealth, ClusterKind};
use super::dispatcher::{Dispatcher, RequestMeta};
use crate::config::Config;
use crate::cql::StatementType;
use crate::error::{GeminoError, Result};
use crate::frame::{self, error_codes, wire, FrameCodec, Opcode, RawFrame};
use crate::observability::ProxyMetrics;
use crate::statement::{
    inspect_frame, modify_frame, DecodedRequest, ForwardDecision, FrameDecodeContext, NonceSource,
    PreparedStatementCache, PreparedStatementInfo, StatementInfo,
};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// State shared by every client session of one proxy instance.
pub struct SessionShared {
    pub config: Arc<Config>,
    pub cache: Arc<PreparedStatementCache>,
    pub metrics: Arc<ProxyMetrics>,
    pub nonces: Arc<dyn NonceSource>,
    pub origin_health: Arc<ClusterHealth>,
    pub target_health: Arc<ClusterHealth>,
}

/// One client connection: reads frames, classifies and rewrites them, and
/// hands them to the dispatcher. Replies are written by a dedicated writer
/// task so slow upstreams never block the read loop, and upstream EVENT
/// frames are funnelled into the same writer.
pub struct ClientSession {
    shared: Arc<SessionShared>,
    peer: String,
    /// Current `USE` keyspace; updated when a SET_KEYSPACE result arrives.
    keyspace: Arc<RwLock<Option<String>>>,
    cancel: CancellationToken,
}

impl ClientSession {
    pub fn new(shared: Arc<SessionShared>, peer: String, shutdown: &CancellationToken) -> Self {
        ClientSession {
            shared,
            peer,
            keyspace: Arc::new(RwLock::new(None)),
            cancel: shutdown.child_token(),
        }
    }

    pub async fn handle(self, stream: TcpStream) -> Result<()> {
        stream.set_nodelay(true)?;
        let (mut read_half, mut write_half) = stream.into_split();

        let config = &self.shared.config;
        let queue_size = config.proxy.request_queue_size_frames;
        let (writer_tx, mut writer_rx) = mpsc::channel::<RawFrame>(queue_size);

        let writer_cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    frame = writer_rx.recv() => {
                        let Some(frame) = frame else { break };
                        if write_half.write_all(&frame.encode()).await.is_err()
                            || write_half.flush().await.is_err()
                        {
                            break;
                        }
                    }
                }
            }
            writer_cancel.cancel();
        });

        let origin = Arc::new(ClusterConnector::new(
            ClusterKind::Origin,
            config.origin.address.clone(),
            config.heartbeat.clone(),
            Arc::clone(&self.shared.origin_health),
            writer_tx.clone(),
            queue_size,
            config.proxy.read_buffer_size_bytes,
            self.cancel.clone(),
        ));
        let target = Arc::new(ClusterConnector::new(
            ClusterKind::Target,
            config.target.address.clone(),
            config.heartbeat.clone(),
            Arc::clone(&self.shared.target_health),
            writer_tx.clone(),
            queue_size,
            config.proxy.read_buffer_size_bytes,
            self.cancel.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&origin),
            Arc::clone(&target),
            Arc::clone(&self.shared.cache),
            Arc::clone(&self.shared.metrics),
            Duration::from_millis(config.proxy.request_timeout_ms),
        ));

        let mut codec = FrameCodec::new(config.proxy.read_buffer_size_bytes);
        'session: loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break 'session,
                read = read_half.read_buf(codec.buffer_mut()) => {
                    match read {
                        Ok(0) => break 'session,
                        Ok(_) => {}
                        Err(e) => {
                            debug!("client {} read error: {}", self.peer, e);
                            break 'session;
                        }
                    }
                }
            }

            loop {
                match codec.parse() {
                    Ok(Some(frame)) => {
                        if let Err(e) = self
                            .process_frame(frame, &dispatcher, &origin, &target, &writer_tx)
                            .await
                        {
                            warn!("closing client {}: {}", self.peer, e);
                            break 'session;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("client {} sent an undecodable frame: {}", self.peer, e);
                        break 'session;
                    }
                }
            }
        }

        // Cancelling tears down the writer and both upstream connections;
        // pending requests observe dropped channels and resolve.
        self.cancel.cancel();
        Ok(())
    }

    async fn process_frame(
        &self,
        frame: RawFrame,
        dispatcher: &Arc<Dispatcher>,
        origin: &Arc<ClusterConnector>,
        target: &Arc<ClusterConnector>,
        writer_tx: &mpsc::Sender<RawFrame>,
    ) -> Result<()> {
        let version = frame.header.version;
        let stream_id = frame.header.stream_id;
        let opcode = frame.opcode();

        self.shared.metrics.frames_received.inc();
        self.shared.metrics.record_opcode(frame.header.opcode);

        let mut ctx = FrameDecodeContext::new(frame);
        let keyspace = self.keyspace.read().ok().and_then(|g| (*g).clone());

        let mut info = match inspect_frame(
            &mut ctx,
            &self.shared.cache,
            self.shared.config.proxy.forward_reads_to_target,
            keyspace.as_deref(),
        ) {
            Ok(info) => info,
            Err(GeminoError::Classification(message)) => {
                warn!("classification error for client {}: {}", self.peer, message);
                self.shared.metrics.classification_errors.inc();
                let reply =
                    frame::error_frame(version, stream_id, error_codes::SERVER_ERROR, &message);
                let _ = writer_tx.send(reply).await;
                return Ok(());
            }
            Err(e) => {
                // At worst the proxy is a pass-through.
                warn!(
                    "classification failed for client {}, forwarding to origin unchanged: {}",
                    self.peer, e
                );
                StatementInfo::generic(ForwardDecision::Origin)
            }
        };

        let statement_type = match opcode {
            Some(Opcode::Query) | Some(Opcode::Prepare) => ctx
                .get_or_inspect_query()
                .ok()
                .map(|info| info.statement_type),
            Some(Opcode::Batch) => Some(StatementType::Batch),
            Some(Opcode::Execute) => info.statement_type(),
            _ => None,
        };
        let is_write = statement_type.map(|t| t.is_write()).unwrap_or(true);

        let mut replaced_positions = Vec::new();
        if matches!(
            info.decision(),
            ForwardDecision::Both | ForwardDecision::Target
        ) {
            match modify_frame(&mut ctx, self.shared.nonces.as_ref()) {
                Ok(positions) => {
                    if !positions.is_empty() {
                        self.shared.metrics.rewritten_statements.inc();
                    }
                    replaced_positions = positions;
                }
                Err(e) => {
                    // Never corrupt a request: the unmodified bytes go to
                    // Origin only, so the clusters cannot diverge on a
                    // statement the rewriter could not vouch for.
                    warn!(
                        "rewrite failed, forwarding original frame to origin unchanged: {}",
                        e
                    );
                    info = StatementInfo::generic(ForwardDecision::Origin);
                }
            }
        }
        let decision = info.decision();

        let mut meta = RequestMeta::new(is_write);
        if opcode == Some(Opcode::Prepare) {
            if let StatementInfo::Prepared(prepared) = &info {
                meta.prepare_capture = Some(PreparedStatementInfo {
                    decision,
                    replaced_positions,
                    query_info: prepared.query_info.clone(),
                });
            }
        }
        if opcode == Some(Opcode::Execute) {
            if let Ok(DecodedRequest::Execute { prepared_id }) = ctx.get_or_decode() {
                meta.execute_pin = self.shared.cache.checkout(prepared_id);
            }
        }

        let frame = ctx.into_frame();
        let startup = (opcode == Some(Opcode::Startup)).then(|| frame.clone());

        // Backpressure happens here: stream-id reservation waits when an
        // upstream pool is drained.
        let in_flight = dispatcher.start(frame, &info, meta).await;
        let in_flight = match in_flight {
            Ok(in_flight) => in_flight,
            Err(e @ GeminoError::InvariantViolation(_)) => {
                let reply = frame::error_frame(
                    version,
                    stream_id,
                    error_codes::PROTOCOL_ERROR,
                    &e.to_string(),
                );
                let _ = writer_tx.send(reply).await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let writer_tx = writer_tx.clone();
        let keyspace_cell = Arc::clone(&self.keyspace);
        let track_keyspace = statement_type == Some(StatementType::Use);
        let origin = Arc::clone(origin);
        let target = Arc::clone(target);
        tokio::spawn(async move {
            let reply = in_flight.complete().await;

            if track_keyspace {
                if let Some(ks) = set_keyspace_of(&reply) {
                    if let Ok(mut cell) = keyspace_cell.write() {
                        *cell = Some(ks);
                    }
                }
            }

            // The client handshake is anchored to Origin; once it succeeds
            // the Target side is brought up with the same STARTUP so both
            // connections speak the client's protocol version.
            if let Some(startup) = startup {
                if reply.error_code().is_none() {
                    origin.record_startup(startup.clone()).await;
                    if let Err(e) = target.bootstrap(startup).await {
                        warn!("target cluster bootstrap failed: {}", e);
                    }
                }
            }

            let _ = writer_tx.send(reply).await;
        });

        Ok(())
    }
}

/// The keyspace of a RESULT/SET_KEYSPACE frame, if that is what this is.
fn set_keyspace_of(frame: &RawFrame) -> Option<String> {
    if frame.opcode() != Some(Opcode::Result) {
        return None;
    }
    let mut reader = wire::Reader::new(&frame.body);
    if reader.get_i32().ok()? != 0x0003 {
        return None;
    }
    reader.get_string().ok()
}
