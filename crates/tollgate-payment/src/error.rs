//! Payment errors

use thiserror::Error;

/// Promise exchange errors
#[derive(Debug, Error)]
pub enum PaymentError {
    /// A promise failed validation (signature, sequence or amount)
    #[error("Bad promise: {0}")]
    BadPromise(String),

    /// Transport failure underneath the exchange
    #[error("Network error: {0}")]
    Network(#[from] tollgate_net::NetworkError),

    /// Promise could not be encoded for signing
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The issuer or validator was started twice
    #[error("Already started")]
    AlreadyStarted,
}

/// Result type for payment operations
pub type PaymentResult<T> = Result<T, PaymentError>;
