//! # Error Types
//!
//! Unified error type for the pooled client runtime.
//!
//! ## Taxonomy
//!
//! - Pool-level: `PoolExhausted`, `PoolClosed`, `BorrowCanceled`.
//! - Transport-level: `ConnectionBroken`, `Protocol`. Both mean the
//!   connection can no longer be trusted and must be invalidated.
//! - Server-level: `Server` carries the reply text verbatim.
//! - Setup: `InvalidAddress`, `Config`.

use thiserror::Error;

/// Prefix of the server error raised by EVALSHA for an unknown hash.
pub const NOSCRIPT_PREFIX: &str = "NOSCRIPT";

/// Result type alias using `PkvError`.
pub type PkvResult<T> = std::result::Result<T, PkvError>;

/// Errors surfaced by the client runtime.
#[derive(Debug, Error)]
pub enum PkvError {
    // -------------------------------------------------------------------------
    // Pool Errors
    // -------------------------------------------------------------------------
    /// No connection became available before the borrow deadline.
    #[error("connection pool exhausted")]
    PoolExhausted,

    /// The pool has been closed.
    #[error("connection pool closed")]
    PoolClosed,

    /// A blocked borrow was canceled by its caller.
    #[error("borrow canceled")]
    BorrowCanceled,

    // -------------------------------------------------------------------------
    // Transport Errors
    // -------------------------------------------------------------------------
    /// Network or IO failure while reading/writing.
    #[error("connection broken: {0}")]
    ConnectionBroken(#[from] std::io::Error),

    /// RESP framing or parse error; the stream is out of sync.
    #[error("protocol error: {0}")]
    Protocol(String),

    // -------------------------------------------------------------------------
    // Server Errors
    // -------------------------------------------------------------------------
    /// Server returned an error reply.
    #[error("server error: {message}")]
    Server { message: String },

    /// Reply type did not match what the command returns.
    #[error("unexpected response")]
    UnexpectedResponse,

    // -------------------------------------------------------------------------
    // Setup Errors
    // -------------------------------------------------------------------------
    /// Address could not be parsed into a socket address.
    #[error("invalid address")]
    InvalidAddress,

    #[error("configuration error: {0}")]
    Config(String),
}

impl PkvError {
    /// Builds a server error from raw reply bytes.
    pub fn server(message: &[u8]) -> Self {
        PkvError::Server {
            message: String::from_utf8_lossy(message).into_owned(),
        }
    }

    /// True when the connection that produced this error must not be reused.
    pub fn is_connection_broken(&self) -> bool {
        matches!(self, PkvError::ConnectionBroken(_) | PkvError::Protocol(_))
    }

    /// True for failures a caller may reasonably retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PkvError::PoolExhausted | PkvError::ConnectionBroken(_))
    }

    /// True for a NOSCRIPT-class server error.
    pub fn is_noscript(&self) -> bool {
        match self {
            PkvError::Server { message } => message.starts_with(NOSCRIPT_PREFIX),
            _ => false,
        }
    }
}

/// Returns true when raw error reply bytes carry the NOSCRIPT prefix.
pub fn is_noscript_message(message: &[u8]) -> bool {
    message.starts_with(NOSCRIPT_PREFIX.as_bytes())
}
