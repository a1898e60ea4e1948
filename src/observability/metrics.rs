//! Proxy metrics
//!
//! Counters and gauges are plain atomics; per-opcode counts live behind a
//! read-mostly lock keyed by the raw opcode byte. Everything here is
//! increment-only from the hot path and read by whoever wants a snapshot.

use crate::proxy::cluster::ClusterKind;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

/// Atomic counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    /// Increment the counter by 1
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the counter by a specific amount
    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Get the current value
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Atomic gauge (can go up and down)
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Per-cluster request accounting
#[derive(Debug, Default)]
pub struct ClusterMetrics {
    /// Frames transmitted to this cluster
    pub requests: Counter,
    /// Failed dispatches and dropped connections
    pub errors: Counter,
}

/// Proxy-wide metrics
#[derive(Debug)]
pub struct ProxyMetrics {
    /// Currently connected clients
    pub client_connections: Gauge,
    /// Connections refused over the client cap
    pub clients_rejected: Counter,
    /// Request frames read from clients
    pub frames_received: Counter,
    /// Requests whose non-deterministic function calls were replaced
    pub rewritten_statements: Counter,
    /// EXECUTEs against unknown prepared ids and unparseable frames
    pub classification_errors: Counter,
    /// Dual dispatches degraded to a single cluster by health checks
    pub degraded_dispatches: Counter,
    /// Requests answered with a synthetic timeout
    pub timeouts: Counter,
    pub origin: ClusterMetrics,
    pub target: ClusterMetrics,
    frames_by_opcode: RwLock<HashMap<u8, Counter>>,
}

impl Default for ProxyMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyMetrics {
    pub fn new() -> Self {
        ProxyMetrics {
            client_connections: Gauge::new(),
            clients_rejected: Counter::new(),
            frames_received: Counter::new(),
            rewritten_statements: Counter::new(),
            classification_errors: Counter::new(),
            degraded_dispatches: Counter::new(),
            timeouts: Counter::new(),
            origin: ClusterMetrics::default(),
            target: ClusterMetrics::default(),
            frames_by_opcode: RwLock::new(HashMap::new()),
        }
    }

    pub fn cluster(&self, kind: ClusterKind) -> &ClusterMetrics {
        match kind {
            ClusterKind::Origin => &self.origin,
            ClusterKind::Target => &self.target,
        }
    }

    pub fn record_opcode(&self, opcode: u8) {
        if let Ok(map) = self.frames_by_opcode.read() {
            if let Some(counter) = map.get(&opcode) {
                counter.inc();
                return;
            }
        }
        if let Ok(mut map) = self.frames_by_opcode.write() {
            map.entry(opcode).or_default().inc();
        }
    }

    pub fn opcode_counts(&self) -> HashMap<u8, u64> {
        match self.frames_by_opcode.read() {
            Ok(map) => map.iter().map(|(k, v)| (*k, v.get())).collect(),
            Err(_) => HashMap::new(),
        }
    }
}
