//! Observability for the proxy
//!
//! Hand-rolled atomic counters and gauges; consumers poll snapshots, so a
//! slow or absent metrics reader can never fail a request.

pub mod metrics;

pub use metrics::{ClusterMetrics, Counter, Gauge, ProxyMetrics};
