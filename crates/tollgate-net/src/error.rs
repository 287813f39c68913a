//! Transport errors

use thiserror::Error;

/// Dialog transport and NAT pinger errors
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Transient broker I/O failure; callers may retry
    #[error("Transport error: {0}")]
    Transport(String),

    /// Payload could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Envelope signature did not verify; fatal for the dialog
    #[error("Invalid message signature")]
    SignatureInvalid,

    /// Envelope sender does not match the dialog peer
    #[error("Unexpected sender identity: expected {expected}, got {actual}")]
    IdentityMismatch { expected: String, actual: String },

    /// Dialog has been closed
    #[error("Dialog closed")]
    DialogClosed,

    /// Peer refused the dialog
    #[error("Dialog rejected: {0}")]
    DialogRejected(String),

    /// Operation was cancelled by close/stop
    #[error("Operation cancelled")]
    Cancelled,

    /// NAT pinger used before binding a socket
    #[error("Pinger socket not bound")]
    NotBound,

    /// NAT pinger already bound to a different port
    #[error("Pinger already bound to port {bound}, requested {requested}")]
    AlreadyBound { bound: u16, requested: u16 },

    /// No inbound datagram arrived within the punch window
    #[error("NAT punch timed out")]
    PunchTimeout,

    /// Crypto failure while sealing or opening an envelope
    #[error("Crypto error: {0}")]
    Crypto(#[from] tollgate_crypto::CryptoError),
}

/// Result type for transport operations
pub type NetworkResult<T> = Result<T, NetworkError>;
