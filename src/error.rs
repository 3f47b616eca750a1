//! Error taxonomy for the DHT.
//!
//! Transport and decode failures are recovered inside the RPC listener and
//! never surface here as returned errors; everything an RPC, lookup, store or
//! bootstrap caller can observe is a [`DhtError`].

use std::net::SocketAddr;

use thiserror::Error;

use crate::crypto::SignatureError;
use crate::messages::MessageKind;

pub type Result<T> = std::result::Result<T, DhtError>;

#[derive(Debug, Error)]
pub enum DhtError {
    #[error("malformed identifier: expected 20 bytes, got {0}")]
    MalformedIdentifier(usize),

    #[error("malformed message: {0}")]
    MessageFormat(String),

    #[error("request to {addr} timed out after {attempts} attempt(s)")]
    RequestTimeout { addr: SocketAddr, attempts: u32 },

    #[error("lookup exhausted: no contact could make progress")]
    LookupExhausted,

    #[error("record signature invalid: {0}")]
    SignatureInvalid(#[from] SignatureError),

    #[error("bootstrap failed: no seed contact responded")]
    BootstrapFailed,

    #[error("store failed: none of {attempted} contact(s) acknowledged")]
    StoreFailed { attempted: usize },

    #[error("unexpected response: {0:?}")]
    UnexpectedResponse(MessageKind),

    #[error("message id already pending")]
    DuplicateMessageId,

    #[error("operation cancelled")]
    Cancelled,

    #[error("node is shut down")]
    Shutdown,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<bincode::Error> for DhtError {
    fn from(err: bincode::Error) -> Self {
        DhtError::MessageFormat(err.to_string())
    }
}

impl DhtError {
    /// True for failures that say something about the remote peer's liveness.
    pub fn is_timeout(&self) -> bool {
        matches!(self, DhtError::RequestTimeout { .. })
    }
}
