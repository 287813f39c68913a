//! Core errors

use thiserror::Error;

/// Connection and service lifecycle errors
#[derive(Debug, Error)]
pub enum CoreError {
    /// Disconnect (or similar) expected an active connection
    #[error("No connection exists")]
    NoConnection,

    /// Connect expected no active connection
    #[error("Connection already exists")]
    AlreadyExists,

    /// Connect was cancelled before reaching Connected
    #[error("Connection was cancelled")]
    ConnectionCancelled,

    /// The tunnel closed its state stream before reporting Connected
    #[error("Connection has failed")]
    ConnectionFailed,

    /// No factory registered for the requested service type
    #[error("Unsupported service type: {0}")]
    UnsupportedServiceType(String),

    /// Host firewall kill switch could not be engaged
    #[error("Kill switch error: {0}")]
    KillSwitch(String),

    /// Tunnel process or connection failure
    #[error("Tunnel error: {0}")]
    Tunnel(String),

    /// Session negotiation failure
    #[error("Session error: {0}")]
    Session(#[from] tollgate_session::SessionError),

    /// Transport failure
    #[error("Network error: {0}")]
    Network(#[from] tollgate_net::NetworkError),

    /// Payment exchange failure
    #[error("Payment error: {0}")]
    Payment(#[from] tollgate_payment::PaymentError),
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;
