//! # Error Taxonomy
//!
//! Every fallible operation in the library returns [`Result<T>`]. The variants
//! map one-to-one onto the failure classes callers branch on:
//!
//! | Variant | Meaning | Typical caller reaction |
//! |---------|---------|-------------------------|
//! | `NotFound` | resolution exhausted without a match | fall back / report |
//! | `Unreachable`, `Timeout`, `Transport` | dial, liveness or stream failure | try next candidate |
//! | `NoSession`, `SessionClosed` | handle has no usable session | reconnect |
//! | `HashMismatch` | mirrored block failed verification | abort mirror |
//! | `IdentityMismatch`, `InvalidSignature` | peer lied about who it is | abort operation |
//!
//! Setup code that talks to quinn/rustls uses `anyhow` internally; those
//! errors surface as [`Error::Transport`].

use crate::identity::Address;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("address {0} could not be resolved")]
    NotFound(Address),

    #[error("peer unreachable: {0}")]
    Unreachable(String),

    #[error("no session")]
    NoSession,

    #[error("session closed")]
    SessionClosed,

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("piece {index} hash mismatch")]
    HashMismatch { index: u64 },

    #[error("identity mismatch: expected {expected}, got {actual}")]
    IdentityMismatch { expected: Address, actual: Address },

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("rate limited")]
    RateLimited,

    #[error("remote error: {0}")]
    Remote(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Unreachable, timed out and broken-transport failures are handled alike.
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            Error::Unreachable(_)
                | Error::Timeout(_)
                | Error::Transport(_)
                | Error::NoSession
                | Error::SessionClosed
        )
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Transport(format!("{:#}", e))
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout(crate::config::CONNECTION_TIMEOUT)
    }
}
