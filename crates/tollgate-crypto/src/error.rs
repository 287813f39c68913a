//! Crypto errors

use thiserror::Error;

/// Identity and signature errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Public key bytes did not parse as a valid Ed25519 point
    #[error("Invalid public key")]
    InvalidPublicKey,

    /// Signature did not verify against the message and key
    #[error("Signature verification failed")]
    SignatureVerificationFailed,

    /// Key or address material of unexpected length
    #[error("Invalid length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    /// Hex or byte-string decoding error
    #[error("Encoding error: {0}")]
    EncodingError(String),
}

/// Result type for crypto operations
pub type CryptoResult<T> = Result<T, CryptoError>;
