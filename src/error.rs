//! Error types for stegomux.

use thiserror::Error;

/// Result type alias for stegomux operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the chop engine and its drivers.
#[derive(Error, Debug)]
pub enum Error {
    /// Cryptographic operation failed outside the authenticated-decrypt path
    #[error("cryptographic error: {0}")]
    Crypto(String),

    /// AEAD tag verification failed
    #[error("message authentication failed")]
    AuthFailure,

    /// Block header failed the check-field / receive-window test
    #[error("invalid block header")]
    BadHeader,

    /// Peer violated the block protocol
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No attached connection has room for the block that must be sent
    #[error("no usable connection for {needed}-byte block")]
    NoUsableConnection {
        /// Bytes the block needs on the wire
        needed: usize,
    },

    /// Steg module failed to embed or extract covert payload
    #[error("steg module error: {0}")]
    Steg(String),

    /// Network I/O error
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a new cryptographic error
    pub fn crypto(msg: impl Into<String>) -> Self {
        Error::Crypto(msg.into())
    }

    /// Create a new protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Create a new steg module error
    pub fn steg(msg: impl Into<String>) -> Self {
        Error::Steg(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// True if the error condemns only the downstream connection it occurred
    /// on; the circuit continues on whatever other connections it has.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, Error::AuthFailure | Error::BadHeader)
    }
}
