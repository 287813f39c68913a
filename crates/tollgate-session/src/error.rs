//! Session errors

use thiserror::Error;

/// Stable wire codes for session failures
pub const CODE_INVALID_PROPOSAL: &str = "invalid-proposal";
pub const CODE_SESSION_NOT_FOUND: &str = "session-not-found";
pub const CODE_WRONG_OWNER: &str = "wrong-owner";

/// Session provisioning and teardown errors
#[derive(Debug, Error)]
pub enum SessionError {
    /// Session create referenced an unknown proposal id
    #[error("Proposal does not exist")]
    InvalidProposal,

    /// Destroy targeted a session that is not in the store
    #[error("Session does not exist")]
    SessionNotFound,

    /// Destroy came from an identity that does not own the session
    #[error("Wrong session owner")]
    WrongOwner,

    /// Promise processor failure while starting or stopping a session
    #[error("Payment error: {0}")]
    Payment(String),

    /// Service configuration could not be produced
    #[error("Config error: {0}")]
    Config(String),

    /// The remote side refused the request
    #[error("Rejected by peer: {0}")]
    Rejected(String),

    /// Transport failure underneath the dialog
    #[error("Network error: {0}")]
    Network(#[from] tollgate_net::NetworkError),
}

impl SessionError {
    /// Wire code for errors that travel in responses
    pub fn code(&self) -> Option<&'static str> {
        match self {
            Self::InvalidProposal => Some(CODE_INVALID_PROPOSAL),
            Self::SessionNotFound => Some(CODE_SESSION_NOT_FOUND),
            Self::WrongOwner => Some(CODE_WRONG_OWNER),
            _ => None,
        }
    }

    /// Rebuild an error from a wire code, falling back to `Rejected`
    pub fn from_code(code: Option<&str>, message: String) -> Self {
        match code {
            Some(CODE_INVALID_PROPOSAL) => Self::InvalidProposal,
            Some(CODE_SESSION_NOT_FOUND) => Self::SessionNotFound,
            Some(CODE_WRONG_OWNER) => Self::WrongOwner,
            _ => Self::Rejected(message),
        }
    }
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;
