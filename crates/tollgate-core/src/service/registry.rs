//! Service type registry
//!
//! Maps service types to factories producing a service instance and its
//! draft proposal. No global state; each node builds its own registry.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use tollgate_market::Proposal;

use crate::error::{CoreError, CoreResult};
use crate::service::{Options, Service};

/// Builds a service and its draft proposal from start options
pub type ServiceFactory =
    Arc<dyn Fn(&Options) -> CoreResult<(Arc<dyn Service>, Proposal)> + Send + Sync>;

/// Registered service factories by type
#[derive(Default)]
pub struct ServiceRegistry {
    factories: Mutex<HashMap<String, ServiceFactory>>,
}

impl ServiceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for `service_type`, replacing any previous one
    pub async fn register(&self, service_type: &str, factory: ServiceFactory) {
        debug!("registering service type {}", service_type);
        self.factories
            .lock()
            .await
            .insert(service_type.to_string(), factory);
    }

    /// Instantiate a service of `service_type`
    pub async fn create(
        &self,
        service_type: &str,
        options: &Options,
    ) -> CoreResult<(Arc<dyn Service>, Proposal)> {
        let factory = {
            let factories = self.factories.lock().await;
            factories
                .get(service_type)
                .cloned()
                .ok_or_else(|| CoreError::UnsupportedServiceType(service_type.to_string()))?
        };
        factory(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::noop::{NoopService, SERVICE_TYPE_NOOP};
    use tollgate_crypto::Identity;
    use tollgate_market::{Contact, Location, PaymentMethod};

    fn noop_factory() -> ServiceFactory {
        Arc::new(|_options| {
            let proposal = Proposal {
                id: 1,
                provider_id: Identity::generate().address(),
                service_type: SERVICE_TYPE_NOOP.to_string(),
                provider_contacts: vec![Contact::broker("t")],
                payment_method: PaymentMethod::default(),
                location: Location::default(),
            };
            Ok((Arc::new(NoopService::new()) as Arc<dyn Service>, proposal))
        })
    }

    #[tokio::test]
    async fn test_create_registered_type() {
        let registry = ServiceRegistry::new();
        registry.register(SERVICE_TYPE_NOOP, noop_factory()).await;

        let (_, proposal) = registry
            .create(SERVICE_TYPE_NOOP, &serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(proposal.service_type, SERVICE_TYPE_NOOP);
    }

    #[tokio::test]
    async fn test_unknown_type_rejected() {
        let registry = ServiceRegistry::new();
        let result = registry.create("quantum", &serde_json::json!({})).await;
        assert!(matches!(result, Err(CoreError::UnsupportedServiceType(_))));
    }
}
