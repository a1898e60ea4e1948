pub mod config;
pub mod cql;
pub mod error;
pub mod frame;
pub mod observability;
pub mod proxy;
pub mod statement;

pub use error::{GeminoError, Result};
pub use proxy::Proxy;
