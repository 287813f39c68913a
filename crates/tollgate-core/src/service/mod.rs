//! Provider service lifecycle

mod manager;
mod pool;
mod registry;
mod tunnel_service;

use std::sync::Arc;

use async_trait::async_trait;

use tollgate_crypto::{Address, Identity};
use tollgate_market::Proposal;
use tollgate_net::{Broker, DialogHandler, DialogWaiter};
use tollgate_session::{DestroyCallback, ServiceConfiguration, SessionResult};

use crate::error::CoreResult;

pub use manager::{InstanceRecord, ServiceManager};
pub use pool::{InstanceId, InstanceState, ServiceInstance, ServicePool};
pub use registry::{ServiceFactory, ServiceRegistry};
pub use tunnel_service::{TunnelService, TunnelServiceConfig};

/// Service-specific start options, JSON like the control API delivers them
pub type Options = serde_json::Value;

/// A pluggable provider service
#[async_trait]
pub trait Service: Send + Sync {
    /// Serve consumers; blocks until the service stops
    async fn serve(&self, provider_id: Address) -> CoreResult<()>;

    /// Stop serving; idempotent
    async fn stop(&self) -> CoreResult<()>;

    /// Produce the per-session service configuration for a consumer's
    /// request config, plus an optional destroy effect
    fn provide_config(
        &self,
        consumer_config: &serde_json::Value,
    ) -> SessionResult<(ServiceConfiguration, Option<DestroyCallback>)>;
}

/// Announces proposals to the discovery registry (out-of-scope collaborator)
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Announce the proposal
    async fn start(&self, provider_id: Address, proposal: Proposal);

    /// Withdraw the announcement
    async fn stop(&self);

    /// Block until the announcement lifecycle ends
    async fn wait(&self);
}

/// Produces a fresh discovery handle per service instance
pub type DiscoveryFactory = Arc<dyn Fn() -> Arc<dyn Discovery> + Send + Sync>;

/// Produces the dialog waiter for (provider identity, service type)
pub type DialogWaiterFactory =
    Arc<dyn Fn(Arc<Identity>, &str) -> Arc<DialogWaiter> + Send + Sync>;

/// Produces the dialog handler bound to (proposal, service)
pub type DialogHandlerFactory =
    Arc<dyn Fn(&Proposal, Arc<dyn Service>) -> Arc<dyn DialogHandler> + Send + Sync>;

/// Default waiter factory over a broker
pub fn broker_waiter_factory(broker: Arc<dyn Broker>) -> DialogWaiterFactory {
    Arc::new(move |identity, service_type| {
        Arc::new(DialogWaiter::new(broker.clone(), identity, service_type))
    })
}

/// Discovery double that only tracks announce/withdraw
pub struct LocalDiscovery {
    stopped: tokio::sync::watch::Sender<bool>,
}

impl LocalDiscovery {
    pub fn new() -> Self {
        Self {
            stopped: tokio::sync::watch::channel(false).0,
        }
    }
}

impl Default for LocalDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Discovery for LocalDiscovery {
    async fn start(&self, provider_id: Address, proposal: Proposal) {
        tracing::info!(
            "announcing proposal {} for provider {} ({})",
            proposal.id,
            provider_id,
            proposal.service_type
        );
    }

    async fn stop(&self) {
        let _ = self.stopped.send_replace(true);
    }

    async fn wait(&self) {
        let mut rx = self.stopped.subscribe();
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }
}
