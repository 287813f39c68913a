//! Provider-side session management
//!
//! A session is one consumer↔provider serving relationship under a single
//! proposal. The store keeps live sessions in memory; the manager validates
//! and provisions them, coordinates the NAT pinger hand-off, and drives the
//! promise processor lifecycle. Wire DTOs and the dialog plumbing for the
//! `session-create`/`session-destroy` topics live here too.

pub mod error;
pub mod handler;
pub mod manager;
pub mod store;
pub mod wire;

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tollgate_crypto::Address;
use tollgate_market::Proposal;

pub use error::{SessionError, SessionResult};
pub use handler::SessionDialogHandler;
pub use manager::SessionManager;
pub use store::SessionStore;
pub use wire::{
    request_session_create, request_session_destroy, ConsumerInfo, LastPromise, PaymentInfo,
    SessionCreateRequest, SessionCreateResponse, SessionDestroyRequest, SessionDestroyResponse,
    TOPIC_SESSION_CREATE, TOPIC_SESSION_DESTROY,
};

/// Opaque service configuration exchanged between provider and consumer
pub type ServiceConfiguration = serde_json::Value;

/// Boxed future used by destroy callbacks
pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Cleanup effect attached to a session, run after removal
pub type DestroyCallback = Box<dyn FnOnce() -> BoxFuture + Send>;

/// Opaque 128-bit random session identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh random id
    pub fn random() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes.iter().map(|b| format!("{:02x}", b)).collect())
    }

    /// String form (32 hex chars)
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A live serving relationship
pub struct Session {
    pub id: SessionId,
    pub consumer_id: Address,
    pub config: ServiceConfiguration,
    pub destroy_callback: Option<DestroyCallback>,
    pub last: bool,
}

/// Provider-side payment exchange, started per session and stopped on destroy
#[async_trait]
pub trait PromiseProcessor: Send + Sync {
    /// Begin accepting balance → promise exchanges under `proposal`
    async fn start(&self, proposal: &Proposal) -> SessionResult<()>;

    /// Flush and halt; idempotent
    async fn stop(&self) -> SessionResult<()>;

    /// Last promise accepted from `consumer`, used to seed a reconnecting
    /// consumer's issuer state
    async fn payment_info(&self, consumer: Address) -> Option<PaymentInfo> {
        let _ = consumer;
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_is_128_bit_hex() {
        let id = SessionId::random();
        assert_eq!(id.as_str().len(), 32);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_session_ids_distinct() {
        let a = SessionId::random();
        let b = SessionId::random();
        assert_ne!(a, b);
    }
}
