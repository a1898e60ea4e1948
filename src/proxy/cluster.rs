use crate::config::HeartbeatSettings;
use crate::error::{GeminoError, Result};
use crate::frame::{FrameCodec, Opcode, RawFrame};
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Stream ids handed out per upstream connection. The protocol allows
/// 2^15, but a smaller pool is the proxy's per-cluster concurrency bound
/// and backpressure mechanism.
const STREAM_IDS_PER_CONNECTION: i16 = 2048;

/// How long a handshake replay may take on a fresh upstream connection.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterKind {
    Origin,
    Target,
}

impl ClusterKind {
    pub fn name(&self) -> &'static str {
        match self {
            ClusterKind::Origin => "origin",
            ClusterKind::Target => "target",
        }
    }
}

impl fmt::Display for ClusterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Shared per-cluster health, fed by every connector attached to the
/// cluster. After `failure_threshold` consecutive connect failures the
/// cluster is reported unhealthy until a connect succeeds, which lets the
/// dispatcher degrade dual dispatch instead of stalling on a dead peer.
pub struct ClusterHealth {
    kind: ClusterKind,
    consecutive_failures: AtomicU32,
    failure_threshold: u32,
    healthy: AtomicBool,
}

impl ClusterHealth {
    pub fn new(kind: ClusterKind, failure_threshold: u32) -> ClusterHealth {
        ClusterHealth {
            kind,
            consecutive_failures: AtomicU32::new(0),
            failure_threshold: failure_threshold.max(1),
            healthy: AtomicBool::new(true),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        if !self.healthy.swap(true, Ordering::AcqRel) {
            info!("cluster {} is healthy again", self.kind);
        }
    }

    pub fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= self.failure_threshold && self.healthy.swap(false, Ordering::AcqRel) {
            warn!(
                "cluster {} marked unhealthy after {} consecutive connect failures",
                self.kind, failures
            );
        }
    }
}

/// Pool of free upstream stream ids. Acquisition waits when the pool is
/// drained, which is the single backpressure mechanism toward the client
/// read side.
pub struct StreamIdPool {
    permits: Semaphore,
    free: Mutex<Vec<i16>>,
}

impl StreamIdPool {
    fn new(size: i16) -> StreamIdPool {
        StreamIdPool {
            permits: Semaphore::new(size as usize),
            free: Mutex::new((0..size).collect()),
        }
    }

    pub async fn acquire(&self) -> Result<i16> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| GeminoError::ShuttingDown)?;
        permit.forget();
        self.free.lock().await.pop().ok_or_else(|| {
            GeminoError::InvariantViolation("stream id pool drained below its permits".to_string())
        })
    }

    pub async fn release(&self, id: i16) {
        self.free.lock().await.push(id);
        self.permits.add_permits(1);
    }
}

/// One live framed connection to an upstream cluster. A writer task drains
/// an outbound queue; a reader task routes responses to per-request oneshot
/// channels by stream id and pushes server events (stream id < 0) to the
/// owning client session.
pub struct ClusterConnection {
    kind: ClusterKind,
    writer_tx: mpsc::Sender<RawFrame>,
    in_flight: Arc<DashMap<i16, oneshot::Sender<RawFrame>>>,
    pool: Arc<StreamIdPool>,
    closed: CancellationToken,
}

impl ClusterConnection {
    async fn connect(
        kind: ClusterKind,
        addr: &str,
        event_tx: mpsc::Sender<RawFrame>,
        queue_size: usize,
        read_buffer_size: usize,
        shutdown: &CancellationToken,
    ) -> Result<Arc<ClusterConnection>> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        debug!("connected to {} cluster at {}", kind, addr);

        let (mut read_half, mut write_half) = stream.into_split();
        let (writer_tx, mut writer_rx) = mpsc::channel::<RawFrame>(queue_size);
        let in_flight: Arc<DashMap<i16, oneshot::Sender<RawFrame>>> = Arc::new(DashMap::new());
        // Child of the session token: closing the client tears down both
        // upstream connections.
        let closed = shutdown.child_token();

        let writer_closed = closed.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_closed.cancelled() => break,
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
            writer_closed.cancel();
        });

        let reader_closed = closed.clone();
        let reader_in_flight = Arc::clone(&in_flight);
        let reader_kind = kind;
        tokio::spawn(async move {
            let mut codec = FrameCodec::new(read_buffer_size);
            'read: loop {
                tokio::select! {
                    _ = reader_closed.cancelled() => break 'read,
                    read = read_half.read_buf(codec.buffer_mut()) => {
                        match read {
                            Ok(0) => break 'read,
                            Ok(_) => {}
                            Err(e) => {
                                debug!("{} cluster read error: {}", reader_kind, e);
                                break 'read;
                            }
                        }
                    }
                }
                loop {
                    match codec.parse() {
                        Ok(Some(frame)) => {
                            if frame.header.stream_id < 0 {
                                // Server-pushed event; deliver best-effort so a
                                // slow client never stalls response routing.
                                if event_tx.try_send(frame).is_err() {
                                    debug!("dropping {} event for slow client", reader_kind);
                                }
                            } else if let Some((_, tx)) =
                                reader_in_flight.remove(&frame.header.stream_id)
                            {
                                let _ = tx.send(frame);
                            } else {
                                debug!(
                                    "{} response for unknown stream id {}",
                                    reader_kind, frame.header.stream_id
                                );
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!("{} cluster sent an undecodable frame: {}", reader_kind, e);
                            break 'read;
                        }
                    }
                }
            }
            // Dropping the senders fails every pending exchange, which the
            // dispatcher surfaces as OVERLOADED.
            reader_in_flight.clear();
            reader_closed.cancel();
        });

        Ok(Arc::new(ClusterConnection {
            kind,
            writer_tx,
            in_flight,
            pool: Arc::new(StreamIdPool::new(STREAM_IDS_PER_CONNECTION)),
            closed,
        }))
    }

    pub fn kind(&self) -> ClusterKind {
        self.kind
    }

    pub fn pool(&self) -> &Arc<StreamIdPool> {
        &self.pool
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Transmit a frame whose stream id has already been rewritten to a
    /// reserved upstream id; the returned channel yields the response.
    pub async fn send(&self, frame: RawFrame) -> Result<oneshot::Receiver<RawFrame>> {
        let stream_id = frame.header.stream_id;
        let (tx, rx) = oneshot::channel();
        if self.in_flight.insert(stream_id, tx).is_some() {
            return Err(GeminoError::InvariantViolation(format!(
                "duplicate in-flight upstream stream id {}",
                stream_id
            )));
        }
        if self.writer_tx.send(frame).await.is_err() {
            self.in_flight.remove(&stream_id);
            return Err(GeminoError::ClusterUnavailable(self.kind.name()));
        }
        Ok(rx)
    }

    /// Round-trip one proxy-originated frame (handshake replay).
    async fn exchange(&self, frame: RawFrame) -> Result<RawFrame> {
        let id = self.pool.acquire().await?;
        let rx = match self.send(frame.with_stream_id(id)).await {
            Ok(rx) => rx,
            Err(e) => {
                self.pool.release(id).await;
                return Err(e);
            }
        };
        let response = tokio::time::timeout(HANDSHAKE_TIMEOUT, rx).await;
        self.pool.release(id).await;
        match response {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(GeminoError::ClusterUnavailable(self.kind.name())),
            Err(_) => Err(GeminoError::Timeout),
        }
    }
}

/// Dials and owns the current connection of one client session to one
/// cluster, reconnecting with exponential backoff when it drops and
/// replaying the client's STARTUP on fresh connections.
pub struct ClusterConnector {
    kind: ClusterKind,
    addr: String,
    heartbeat: HeartbeatSettings,
    health: Arc<ClusterHealth>,
    event_tx: mpsc::Sender<RawFrame>,
    queue_size: usize,
    read_buffer_size: usize,
    current: Mutex<Option<Arc<ClusterConnection>>>,
    startup: Mutex<Option<RawFrame>>,
    shutdown: CancellationToken,
}

impl ClusterConnector {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kind: ClusterKind,
        addr: String,
        heartbeat: HeartbeatSettings,
        health: Arc<ClusterHealth>,
        event_tx: mpsc::Sender<RawFrame>,
        queue_size: usize,
        read_buffer_size: usize,
        shutdown: CancellationToken,
    ) -> ClusterConnector {
        ClusterConnector {
            kind,
            addr,
            heartbeat,
            health,
            event_tx,
            queue_size,
            read_buffer_size,
            current: Mutex::new(None),
            startup: Mutex::new(None),
            shutdown,
        }
    }

    pub fn kind(&self) -> ClusterKind {
        self.kind
    }

    pub fn health(&self) -> &Arc<ClusterHealth> {
        &self.health
    }

    /// Remember the client's STARTUP so reconnects can re-handshake.
    pub async fn record_startup(&self, frame: RawFrame) {
        *self.startup.lock().await = Some(frame);
    }

    /// Handshake the current connection with the client's STARTUP; used to
    /// bootstrap the Target side while the client's auth exchange stays
    /// anchored to Origin. Fresh dials replay the startup on their own.
    pub async fn bootstrap(&self, startup: RawFrame) -> Result<()> {
        self.record_startup(startup.clone()).await;
        let (conn, fresh) = self.get_or_dial().await?;
        if fresh {
            return Ok(());
        }
        let result = self.replay_startup(&conn, &startup).await;
        if result.is_err() {
            // A half-handshaken connection cannot be trusted for reuse.
            conn.close();
        }
        result
    }

    /// The live connection, dialing (with backoff) if necessary. When the
    /// cluster is already unhealthy only a single dial is attempted so
    /// callers fail fast and the dispatcher can degrade.
    pub async fn connection(&self) -> Result<Arc<ClusterConnection>> {
        Ok(self.get_or_dial().await?.0)
    }

    async fn get_or_dial(&self) -> Result<(Arc<ClusterConnection>, bool)> {
        let mut slot = self.current.lock().await;
        if let Some(conn) = slot.as_ref() {
            if !conn.is_closed() {
                return Ok((Arc::clone(conn), false));
            }
            debug!("{} cluster connection lost, reconnecting", self.kind);
            *slot = None;
        }

        let max_attempts = if self.health.is_healthy() {
            self.heartbeat.failure_threshold
        } else {
            1
        };
        let mut delay = Duration::from_millis(self.heartbeat.retry_interval_min_ms);
        let mut attempt = 0u32;

        loop {
            if self.shutdown.is_cancelled() {
                return Err(GeminoError::ShuttingDown);
            }
            match ClusterConnection::connect(
                self.kind,
                &self.addr,
                self.event_tx.clone(),
                self.queue_size,
                self.read_buffer_size,
                &self.shutdown,
            )
            .await
            {
                Ok(conn) => {
                    if let Some(startup) = self.startup.lock().await.clone() {
                        if let Err(e) = self.replay_startup(&conn, &startup).await {
                            warn!("{} handshake replay failed: {}", self.kind, e);
                            conn.close();
                            self.health.record_failure();
                            attempt += 1;
                            if attempt >= max_attempts {
                                return Err(GeminoError::ClusterUnavailable(self.kind.name()));
                            }
                            delay = self.backoff(delay).await;
                            continue;
                        }
                    }
                    self.health.record_success();
                    *slot = Some(Arc::clone(&conn));
                    return Ok((conn, true));
                }
                Err(e) => {
                    self.health.record_failure();
                    attempt += 1;
                    warn!(
                        "failed to connect to {} cluster at {} (attempt {}): {}",
                        self.kind, self.addr, attempt, e
                    );
                    if attempt >= max_attempts {
                        return Err(GeminoError::ClusterUnavailable(self.kind.name()));
                    }
                    delay = self.backoff(delay).await;
                }
            }
        }
    }

    async fn backoff(&self, delay: Duration) -> Duration {
        tokio::time::sleep(delay).await;
        let next = delay.mul_f64(self.heartbeat.retry_backoff_factor.max(1.0));
        next.min(Duration::from_millis(self.heartbeat.retry_interval_max_ms))
    }

    async fn replay_startup(&self, conn: &ClusterConnection, startup: &RawFrame) -> Result<()> {
        let response = conn.exchange(startup.clone()).await?;
        match response.opcode() {
            Some(Opcode::Ready) | Some(Opcode::AuthSuccess) => Ok(()),
            Some(Opcode::Authenticate) => Err(GeminoError::Protocol(format!(
                "{} cluster requires authentication for proxy-driven handshakes",
                self.kind
            ))),
            _ => Err(GeminoError::Protocol(format!(
                "unexpected {} handshake response opcode {:#04x}",
                self.kind, response.header.opcode
            ))),
        }
    }
}
