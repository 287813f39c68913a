//! Tunnel-backed provider service
//!
//! Supervises the external VPN process around the NAT pinger: bind the
//! punch socket once, then repeat wait-for-hole → start → wait until the
//! service stops. A destroyed last session stops the running process; the
//! loop then waits for the next session's punch. The restart loop is the
//! service's resilience mechanism, not an accident.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{info, warn};

use tollgate_crypto::Address;
use tollgate_net::{NatPinger, NetworkError};
use tollgate_session::{DestroyCallback, ServiceConfiguration, SessionResult};

use crate::error::{CoreError, CoreResult};
use crate::service::Service;
use crate::tunnel::{TunnelProcess, TunnelProcessFactory};

/// Tunnel service settings
#[derive(Debug, Clone)]
pub struct TunnelServiceConfig {
    /// UDP port the tunnel listens on; the pinger punches from the same port
    pub tunnel_port: u16,
    /// Static service configuration handed to consumers
    pub service_config: serde_json::Value,
}

/// Provider service wrapping an opaque tunnel process
pub struct TunnelService {
    config: TunnelServiceConfig,
    pinger: Arc<NatPinger>,
    process_factory: TunnelProcessFactory,
    shutdown_rx: Mutex<Option<mpsc::Receiver<()>>>,
    stop: watch::Sender<bool>,
    current: Mutex<Option<Arc<dyn TunnelProcess>>>,
}

impl TunnelService {
    /// Create the service
    ///
    /// `shutdown_rx` is the last-session shutdown signal fed by the session
    /// manager; `pinger` must be shared with the session manager's NAT
    /// hand-off channel.
    pub fn new(
        config: TunnelServiceConfig,
        pinger: Arc<NatPinger>,
        process_factory: TunnelProcessFactory,
        shutdown_rx: mpsc::Receiver<()>,
    ) -> Self {
        Self {
            config,
            pinger,
            process_factory,
            shutdown_rx: Mutex::new(Some(shutdown_rx)),
            stop: watch::channel(false).0,
            current: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Service for TunnelService {
    async fn serve(&self, provider_id: Address) -> CoreResult<()> {
        let mut shutdown_rx = self
            .shutdown_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| CoreError::Tunnel("service already serving".into()))?;

        self.pinger.bind_producer(self.config.tunnel_port).await?;
        let mut stop_rx = self.stop.subscribe();

        info!("tunnel service serving for provider {}", provider_id);
        loop {
            if *stop_rx.borrow() {
                break;
            }

            // Block until the NAT pinger punches a hole for the next
            // session, or the service stops
            match self.pinger.wait_for_hole().await {
                Ok(()) => {}
                Err(NetworkError::Cancelled) => break,
                Err(NetworkError::PunchTimeout) => {
                    warn!("NAT punch timed out, waiting for next session");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            let process = (self.process_factory)()?;
            *self.current.lock().await = Some(process.clone());
            process.start().await?;
            info!("tunnel process started");

            tokio::select! {
                _ = stop_rx.changed() => {
                    process.stop().await;
                    break;
                }
                _ = shutdown_rx.recv() => {
                    info!("last session destroyed, stopping tunnel process");
                    process.stop().await;
                }
                result = process.wait() => {
                    if let Err(e) = result {
                        warn!("tunnel process exited with error: {}", e);
                    }
                }
            }
            *self.current.lock().await = None;
        }

        info!("tunnel service stopped serving");
        Ok(())
    }

    async fn stop(&self) -> CoreResult<()> {
        let _ = self.stop.send_replace(true);
        self.pinger.close();
        if let Some(process) = self.current.lock().await.take() {
            process.stop().await;
        }
        Ok(())
    }

    fn provide_config(
        &self,
        _consumer_config: &serde_json::Value,
    ) -> SessionResult<(ServiceConfiguration, Option<DestroyCallback>)> {
        Ok((self.config.service_config.clone(), None))
    }
}
