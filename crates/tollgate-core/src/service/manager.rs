//! Provider service manager
//!
//! Starting a service wires the pieces in a fixed order: resolve the type
//! in the registry, start the dialog waiter and put its contact on the
//! proposal, serve dialogs with the bound handler, announce the proposal,
//! then supervise `serve` on its own task. Failures roll back what was
//! already started.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{error, info};
use uuid::Uuid;

use tollgate_crypto::Identity;

use crate::error::CoreResult;
use crate::service::pool::{InstanceId, InstanceState, ServiceInstance, ServicePool};
use crate::service::registry::ServiceRegistry;
use crate::service::{DialogHandlerFactory, DialogWaiterFactory, DiscoveryFactory, Options};

/// Listable facts about a running instance
#[derive(Debug, Clone)]
pub struct InstanceRecord {
    pub id: InstanceId,
    pub service_type: String,
    pub proposal_id: i64,
    pub state: InstanceState,
}

/// Starts and supervises pluggable provider services
pub struct ServiceManager {
    registry: Arc<ServiceRegistry>,
    pool: Arc<ServicePool>,
    dialog_waiter_factory: DialogWaiterFactory,
    dialog_handler_factory: DialogHandlerFactory,
    discovery_factory: DiscoveryFactory,
}

impl ServiceManager {
    /// Create a manager with its factories
    pub fn new(
        registry: Arc<ServiceRegistry>,
        dialog_waiter_factory: DialogWaiterFactory,
        dialog_handler_factory: DialogHandlerFactory,
        discovery_factory: DiscoveryFactory,
    ) -> Self {
        Self {
            registry,
            pool: Arc::new(ServicePool::new()),
            dialog_waiter_factory,
            dialog_handler_factory,
            discovery_factory,
        }
    }

    /// Start a service instance of `service_type` for `provider`
    pub async fn start(
        &self,
        provider: Arc<Identity>,
        service_type: &str,
        options: Options,
    ) -> CoreResult<InstanceId> {
        let (service, proposal) = self.registry.create(service_type, &options).await?;

        let waiter = (self.dialog_waiter_factory)(provider.clone(), service_type);
        let contact = waiter.start().await?;
        let proposal = proposal.with_contact(contact);

        let handler = (self.dialog_handler_factory)(&proposal, service.clone());
        if let Err(e) = waiter.serve_dialogs(handler).await {
            waiter.stop();
            return Err(e.into());
        }

        let discovery = (self.discovery_factory)();
        discovery.start(provider.address(), proposal.clone()).await;

        let instance = Arc::new(ServiceInstance {
            id: Uuid::new_v4(),
            proposal,
            service: service.clone(),
            waiter,
            discovery: discovery.clone(),
            state: RwLock::new(InstanceState::Starting),
        });
        let id = instance.id;
        self.pool.add(instance.clone()).await;

        // Supervise: serve until the service ends, then await discovery
        let provider_id = provider.address();
        tokio::spawn(async move {
            *instance.state.write().await = InstanceState::Running;
            if let Err(e) = service.serve(provider_id).await {
                error!("service serve failed: {}", e);
            }
            *instance.state.write().await = InstanceState::NotRunning;
            discovery.wait().await;
        });

        info!("service {} started ({})", id, service_type);
        Ok(id)
    }

    /// Snapshot of running instances
    pub async fn list(&self) -> Vec<InstanceRecord> {
        let mut records = Vec::new();
        for instance in self.pool.list().await {
            records.push(InstanceRecord {
                id: instance.id,
                service_type: instance.proposal.service_type.clone(),
                proposal_id: instance.proposal.id,
                state: instance.state().await,
            });
        }
        records
    }

    /// Stop one instance
    pub async fn stop(&self, id: InstanceId) -> CoreResult<()> {
        self.pool.stop(id).await
    }

    /// Stop all instances
    pub async fn kill(&self) -> CoreResult<()> {
        self.pool.stop_all().await
    }
}
