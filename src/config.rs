//! Proxy configuration, loaded from a TOML file and overridable from the
//! command line in `main`.

use crate::error::{GeminoError, Result};
use serde::Deserialize;
use std::fs;

/// Proxy section of the configuration file
#[derive(Debug, Clone, Deserialize)]
pub struct ProxySettings {
    /// Address clients connect to
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// Route default SELECTs to Target instead of Origin
    #[serde(default)]
    pub forward_reads_to_target: bool,
    /// LRU cap of the prepared-statement cache
    #[serde(default = "default_prepared_cache_max")]
    pub prepared_cache_max: usize,
    /// Per-request deadline
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// New connections beyond this are refused
    #[serde(default = "default_max_clients_threshold")]
    pub max_clients_threshold: usize,
    /// Capacity of the per-connection outbound frame queues
    #[serde(default = "default_request_queue_size_frames")]
    pub request_queue_size_frames: usize,
    /// Initial capacity of the read buffers
    #[serde(default = "default_read_buffer_size_bytes")]
    pub read_buffer_size_bytes: usize,
    /// How long shutdown waits for in-flight sessions to drain
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

fn default_listen_address() -> String {
    "127.0.0.1:9042".to_string()
}

fn default_prepared_cache_max() -> usize {
    10_000
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_max_clients_threshold() -> usize {
    500
}

fn default_request_queue_size_frames() -> usize {
    1024
}

fn default_read_buffer_size_bytes() -> usize {
    65_536
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}

impl Default for ProxySettings {
    fn default() -> Self {
        ProxySettings {
            listen_address: default_listen_address(),
            forward_reads_to_target: false,
            prepared_cache_max: default_prepared_cache_max(),
            request_timeout_ms: default_request_timeout_ms(),
            max_clients_threshold: default_max_clients_threshold(),
            request_queue_size_frames: default_request_queue_size_frames(),
            read_buffer_size_bytes: default_read_buffer_size_bytes(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

/// One upstream cluster
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterSettings {
    pub address: String,
}

fn default_origin() -> ClusterSettings {
    ClusterSettings {
        address: "127.0.0.1:9043".to_string(),
    }
}

fn default_target() -> ClusterSettings {
    ClusterSettings {
        address: "127.0.0.1:9044".to_string(),
    }
}

/// Reconnect backoff toward an upstream cluster
#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatSettings {
    #[serde(default = "default_retry_interval_min_ms")]
    pub retry_interval_min_ms: u64,
    #[serde(default = "default_retry_interval_max_ms")]
    pub retry_interval_max_ms: u64,
    #[serde(default = "default_retry_backoff_factor")]
    pub retry_backoff_factor: f64,
    /// Consecutive connect failures before the cluster is marked unhealthy
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

fn default_retry_interval_min_ms() -> u64 {
    250
}

fn default_retry_interval_max_ms() -> u64 {
    30_000
}

fn default_retry_backoff_factor() -> f64 {
    2.0
}

fn default_failure_threshold() -> u32 {
    8
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        HeartbeatSettings {
            retry_interval_min_ms: default_retry_interval_min_ms(),
            retry_interval_max_ms: default_retry_interval_max_ms(),
            retry_backoff_factor: default_retry_backoff_factor(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

/// Logging section of the configuration file
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSettings {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        LoggingSettings {
            level: default_log_level(),
        }
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxySettings,
    #[serde(default = "default_origin")]
    pub origin: ClusterSettings,
    #[serde(default = "default_target")]
    pub target: ClusterSettings,
    #[serde(default)]
    pub heartbeat: HeartbeatSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            proxy: ProxySettings::default(),
            origin: default_origin(),
            target: default_target(),
            heartbeat: HeartbeatSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Config> {
        let content = fs::read_to_string(path)
            .map_err(|e| GeminoError::Config(format!("failed to read '{}': {}", path, e)))?;
        toml::from_str(&content)
            .map_err(|e| GeminoError::Config(format!("failed to parse '{}': {}", path, e)))
    }
}
