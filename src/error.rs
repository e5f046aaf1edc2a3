//! Error types for inbucket

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid address: {0}")]
    BadAddress(String),

    #[error("message not found")]
    NotFound,

    #[error("malformed input: {0}")]
    BadInput(String),

    #[error("store is full")]
    StoreFull,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("recipient rejected by policy: {0}")]
    PolicyRejected(String),

    #[error("session timed out")]
    SessionTimeout,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("message exceeds maximum size of {0} bytes")]
    TooLarge(u64),

    #[error("TLS is not configured on this listener")]
    TlsRequired,

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// Some recipients were stored and some were not. The successes are
    /// not rolled back; the failed canonical mailboxes are listed here.
    #[error("delivery failed for {}: {reason}", .failed.join(", "))]
    PartialDelivery { failed: Vec<String>, reason: String },
}

pub type Result<T> = std::result::Result<T, Error>;
