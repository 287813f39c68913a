//! Provider-side dialog wiring for session topics
//!
//! One handler instance serves every dialog of a service instance. Each
//! accepted dialog gets its `session-create` and `session-destroy` request
//! loops; the authenticated dialog peer is the session owner.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use tollgate_crypto::Address;
use tollgate_net::{Dialog, DialogHandler, DialogRequest, NetworkResult};

use crate::error::{SessionError, SessionResult};
use crate::manager::SessionManager;
use crate::wire::{
    SessionCreateRequest, SessionCreateResponse, SessionDestroyRequest, SessionDestroyResponse,
    TOPIC_SESSION_CREATE, TOPIC_SESSION_DESTROY,
};
use crate::{DestroyCallback, ServiceConfiguration};

/// Produces the service configuration for a consumer's request config,
/// plus an optional cleanup effect run when the session is destroyed
pub type ConfigProvider = Arc<
    dyn Fn(&serde_json::Value) -> SessionResult<(ServiceConfiguration, Option<DestroyCallback>)>
        + Send
        + Sync,
>;

/// Routes session topics of incoming dialogs into the session manager
pub struct SessionDialogHandler {
    manager: Arc<SessionManager>,
    provide_config: ConfigProvider,
}

impl SessionDialogHandler {
    /// Bind the handler to a manager and the service's config provider
    pub fn new(manager: Arc<SessionManager>, provide_config: ConfigProvider) -> Self {
        Self {
            manager,
            provide_config,
        }
    }
}

#[async_trait]
impl DialogHandler for SessionDialogHandler {
    async fn handle(&self, dialog: Arc<Dialog>) -> NetworkResult<()> {
        let creates = dialog
            .receive_requests::<SessionCreateRequest>(TOPIC_SESSION_CREATE)
            .await?;
        let destroys = dialog
            .receive_requests::<SessionDestroyRequest>(TOPIC_SESSION_DESTROY)
            .await?;

        let consumer = dialog.peer().address;
        spawn_create_loop(self.manager.clone(), self.provide_config.clone(), consumer, creates);
        spawn_destroy_loop(self.manager.clone(), consumer, destroys);
        Ok(())
    }
}

fn spawn_create_loop(
    manager: Arc<SessionManager>,
    provide_config: ConfigProvider,
    consumer: Address,
    mut requests: mpsc::Receiver<DialogRequest<SessionCreateRequest>>,
) {
    tokio::spawn(async move {
        while let Some(request) = requests.recv().await {
            let response = match create_session(&manager, &provide_config, consumer, &request.body)
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    warn!("session create for {} failed: {}", consumer, e);
                    SessionCreateResponse::failed(&e)
                }
            };
            if request.respond(&response).is_err() {
                warn!("consumer {} went away before session-create reply", consumer);
            }
        }
        debug!("session-create loop for {} ended", consumer);
    });
}

async fn create_session(
    manager: &SessionManager,
    provide_config: &ConfigProvider,
    consumer: Address,
    request: &SessionCreateRequest,
) -> SessionResult<SessionCreateResponse> {
    // Reject bad proposal ids before the service builds any state
    if manager.proposal().id != request.proposal_id {
        return Err(SessionError::InvalidProposal);
    }

    let (service_config, destroy_callback) = provide_config(&request.config)?;

    let session_id = manager
        .create(
            consumer,
            request.proposal_id,
            service_config.clone(),
            destroy_callback,
            request.config.clone(),
        )
        .await?;

    let payment_info = manager.processor().payment_info(consumer).await;
    Ok(SessionCreateResponse::created(
        session_id,
        service_config,
        payment_info,
    ))
}

fn spawn_destroy_loop(
    manager: Arc<SessionManager>,
    consumer: Address,
    mut requests: mpsc::Receiver<DialogRequest<SessionDestroyRequest>>,
) {
    tokio::spawn(async move {
        while let Some(request) = requests.recv().await {
            let response = match manager.destroy(consumer, &request.body.session_id).await {
                Ok(()) => SessionDestroyResponse {
                    success: true,
                    code: None,
                    message: None,
                },
                Err(e) => {
                    warn!("session destroy for {} failed: {}", consumer, e);
                    SessionDestroyResponse {
                        success: false,
                        code: e.code().map(str::to_string),
                        message: Some(e.to_string()),
                    }
                }
            };
            if request.respond(&response).is_err() {
                warn!("consumer {} went away before session-destroy reply", consumer);
            }
        }
        debug!("session-destroy loop for {} ended", consumer);
    });
}
