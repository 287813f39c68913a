//! Provider session manager
//!
//! Creation and teardown are serialized by one lock. Creating a session
//! validates the proposal, provisions a unique id, starts the promise
//! processor, and forwards the consumer's punch config to the NAT pinger
//! without blocking, since the configuration must be returned to the
//! consumer while the pinger works. The tunnel itself is started only
//! after the pinger reports a hole.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use tollgate_crypto::Address;
use tollgate_market::Proposal;

use crate::error::{SessionError, SessionResult};
use crate::store::SessionStore;
use crate::{DestroyCallback, PromiseProcessor, ServiceConfiguration, Session, SessionId};

/// Knows how to start and provision sessions for one service instance
pub struct SessionManager {
    current_proposal: Proposal,
    store: Arc<SessionStore>,
    processor: Arc<dyn PromiseProcessor>,
    nat_tx: mpsc::Sender<serde_json::Value>,
    last_session_shutdown: mpsc::Sender<()>,
    creation_lock: Mutex<()>,
}

impl SessionManager {
    /// Create a manager bound to the currently announced proposal
    pub fn new(
        current_proposal: Proposal,
        store: Arc<SessionStore>,
        processor: Arc<dyn PromiseProcessor>,
        nat_tx: mpsc::Sender<serde_json::Value>,
        last_session_shutdown: mpsc::Sender<()>,
    ) -> Self {
        Self {
            current_proposal,
            store,
            processor,
            nat_tx,
            last_session_shutdown,
            creation_lock: Mutex::new(()),
        }
    }

    /// The proposal this manager provisions sessions for
    pub fn proposal(&self) -> &Proposal {
        &self.current_proposal
    }

    /// The promise processor driving payments for this instance
    pub fn processor(&self) -> &Arc<dyn PromiseProcessor> {
        &self.processor
    }

    /// Create a session. Multiple sessions per consumer are possible when
    /// different service types are used.
    pub async fn create(
        &self,
        consumer_id: Address,
        proposal_id: i64,
        config: ServiceConfiguration,
        destroy_callback: Option<DestroyCallback>,
        request_config: serde_json::Value,
    ) -> SessionResult<SessionId> {
        let _guard = self.creation_lock.lock().await;

        if self.current_proposal.id != proposal_id {
            return Err(SessionError::InvalidProposal);
        }

        let id = self.generate_id().await;

        self.processor.start(&self.current_proposal).await?;

        // Postpone tunnel start until the NAT hole is punched; the hand-off
        // must not block returning the configuration to the consumer
        self.notify_nat_pinger(request_config);

        self.store
            .add(Session {
                id: id.clone(),
                consumer_id,
                config,
                destroy_callback,
                last: false,
            })
            .await;

        info!("session {} created for consumer {}", id, consumer_id);
        Ok(id)
    }

    /// Destroy a session owned by `consumer_id`
    pub async fn destroy(&self, consumer_id: Address, session_id: &SessionId) -> SessionResult<()> {
        let _guard = self.creation_lock.lock().await;

        let record = self
            .store
            .find(session_id)
            .await
            .ok_or(SessionError::SessionNotFound)?;

        if record.consumer_id != consumer_id {
            return Err(SessionError::WrongOwner);
        }

        if self.store.len().await == 1 {
            info!("last session destroy requested, signalling service shutdown");
            if self.last_session_shutdown.try_send(()).is_err() {
                debug!("service shutdown already signalled");
            }
        }

        self.processor.stop().await?;

        let session = self.store.remove(session_id).await;

        if let Some(callback) = session.and_then(|s| s.destroy_callback) {
            callback().await;
        }

        info!("session {} destroyed", session_id);
        Ok(())
    }

    async fn generate_id(&self) -> SessionId {
        // Random ids collide with negligible probability; the store check
        // guarantees no reuse within a process lifetime regardless
        loop {
            let id = SessionId::random();
            if !self.store.contains(&id).await {
                return id;
            }
        }
    }

    fn notify_nat_pinger(&self, request_config: serde_json::Value) {
        if let Err(e) = self.nat_tx.try_send(request_config) {
            warn!("NAT pinger hand-off skipped: {}", e);
        }
    }
}
