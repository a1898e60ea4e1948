use thiserror::Error;

#[derive(Error, Debug)]
pub enum GeminoError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Surfaced verbatim to the client as a SERVER_ERROR body.
    #[error("{0}")]
    Classification(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cluster {0} is unavailable")]
    ClusterUnavailable(&'static str),

    #[error("Request timed out")]
    Timeout,

    #[error("Protocol invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Shutting down")]
    ShuttingDown,
}

pub type Result<T> = std::result::Result<T, GeminoError>;
