//! Request inspection: lazy frame decoding, forwarding classification,
//! non-deterministic function rewriting, and the prepared-statement cache
//! that EXECUTE classification consults.

pub mod cache;
pub mod classifier;
pub mod decode;
pub mod rewriter;

pub use cache::PreparedStatementCache;
pub use classifier::{
    inspect_frame, ForwardDecision, GenericStatementInfo, PreparedStatementInfo, StatementInfo,
};
pub use decode::{BatchChild, DecodedRequest, FrameDecodeContext};
pub use rewriter::{modify_frame, NonceSource, SystemNonceSource};
