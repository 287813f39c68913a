//! Running service instances

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::warn;
use uuid::Uuid;

use tollgate_market::Proposal;
use tollgate_net::DialogWaiter;

use crate::error::CoreResult;
use crate::service::{Discovery, Service};

/// Service instance identifier
pub type InstanceId = Uuid;

/// Lifecycle state of a running instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Starting,
    Running,
    NotRunning,
}

/// One running (identity, service type, options) combination
pub struct ServiceInstance {
    pub id: InstanceId,
    pub proposal: Proposal,
    pub(crate) service: Arc<dyn Service>,
    pub(crate) waiter: Arc<DialogWaiter>,
    pub(crate) discovery: Arc<dyn Discovery>,
    pub(crate) state: RwLock<InstanceState>,
}

impl ServiceInstance {
    /// Current lifecycle state
    pub async fn state(&self) -> InstanceState {
        *self.state.read().await
    }
}

/// Pool of running instances
#[derive(Default)]
pub struct ServicePool {
    instances: Mutex<HashMap<InstanceId, Arc<ServiceInstance>>>,
}

impl ServicePool {
    /// Create an empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an instance
    pub async fn add(&self, instance: Arc<ServiceInstance>) {
        self.instances.lock().await.insert(instance.id, instance);
    }

    /// Look up an instance
    pub async fn get(&self, id: InstanceId) -> Option<Arc<ServiceInstance>> {
        self.instances.lock().await.get(&id).cloned()
    }

    /// Snapshot of all instances
    pub async fn list(&self) -> Vec<Arc<ServiceInstance>> {
        self.instances.lock().await.values().cloned().collect()
    }

    /// Stop an instance and remove it from the pool
    pub async fn stop(&self, id: InstanceId) -> CoreResult<()> {
        let instance = self.instances.lock().await.remove(&id);
        if let Some(instance) = instance {
            stop_instance(&instance).await;
        }
        Ok(())
    }

    /// Stop every instance
    pub async fn stop_all(&self) -> CoreResult<()> {
        let instances: Vec<_> = self.instances.lock().await.drain().map(|(_, i)| i).collect();
        for instance in instances {
            stop_instance(&instance).await;
        }
        Ok(())
    }
}

async fn stop_instance(instance: &ServiceInstance) {
    if let Err(e) = instance.service.stop().await {
        warn!("service {} stop failed: {}", instance.id, e);
    }
    instance.waiter.stop();
    instance.discovery.stop().await;
    *instance.state.write().await = InstanceState::NotRunning;
}
