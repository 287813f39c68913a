//! Noop service and connection
//!
//! A service type that moves no packets: the provider side serves until
//! stopped, the consumer side reports Connected right after start. Used as
//! the reference wiring and by the scenario tests.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use tollgate_crypto::Address;
use tollgate_session::{DestroyCallback, ServiceConfiguration, SessionResult};

use crate::error::{CoreError, CoreResult};
use crate::service::Service;
use crate::tunnel::{
    ConnectOptions, ConnectionCreator, Statistics, TunnelConnection, TunnelProcess, TunnelState,
};

/// The noop service type
pub const SERVICE_TYPE_NOOP: &str = "noop";

/// Provider service that serves nothing until stopped
pub struct NoopService {
    stop: watch::Sender<bool>,
}

impl NoopService {
    pub fn new() -> Self {
        Self {
            stop: watch::channel(false).0,
        }
    }
}

impl Default for NoopService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Service for NoopService {
    async fn serve(&self, provider_id: Address) -> CoreResult<()> {
        debug!("noop service serving for {}", provider_id);
        let mut stop = self.stop.subscribe();
        if *stop.borrow() {
            return Ok(());
        }
        let _ = stop.changed().await;
        Ok(())
    }

    async fn stop(&self) -> CoreResult<()> {
        let _ = self.stop.send_replace(true);
        Ok(())
    }

    fn provide_config(
        &self,
        _consumer_config: &serde_json::Value,
    ) -> SessionResult<(ServiceConfiguration, Option<DestroyCallback>)> {
        Ok((serde_json::json!({}), None))
    }
}

/// Consumer connection that reports Connected without moving packets
pub struct NoopConnection {
    state_tx: mpsc::Sender<TunnelState>,
    stats_tx: mpsc::Sender<Statistics>,
    connect_on_start: bool,
    done: watch::Sender<bool>,
}

impl NoopConnection {
    /// Connection that reports Connected immediately after start
    pub fn new(state_tx: mpsc::Sender<TunnelState>, stats_tx: mpsc::Sender<Statistics>) -> Self {
        Self {
            state_tx,
            stats_tx,
            connect_on_start: true,
            done: watch::channel(false).0,
        }
    }

    /// Connection that never reaches Connected (for cancellation paths)
    pub fn stalled(
        state_tx: mpsc::Sender<TunnelState>,
        stats_tx: mpsc::Sender<Statistics>,
    ) -> Self {
        Self {
            state_tx,
            stats_tx,
            connect_on_start: false,
            done: watch::channel(false).0,
        }
    }
}

#[async_trait]
impl TunnelConnection for NoopConnection {
    async fn session_create_config(&self) -> CoreResult<serde_json::Value> {
        Ok(serde_json::json!({}))
    }

    async fn start(&self, options: ConnectOptions) -> CoreResult<()> {
        debug!("noop connection started for session {}", options.session_id);
        let _ = self.state_tx.send(TunnelState::ProcessStarted).await;
        let _ = self.state_tx.send(TunnelState::Connecting).await;
        if self.connect_on_start {
            let _ = self.state_tx.send(TunnelState::Connected).await;
            let _ = self.stats_tx.send(Statistics::default()).await;
        }
        Ok(())
    }

    async fn wait(&self) -> CoreResult<()> {
        let mut done = self.done.subscribe();
        if *done.borrow() {
            return Ok(());
        }
        let _ = done.changed().await;
        Ok(())
    }

    async fn stop(&self) {
        let _ = self.state_tx.send(TunnelState::Disconnecting).await;
        let _ = self.state_tx.send(TunnelState::ProcessExited).await;
        let _ = self.done.send_replace(true);
    }
}

/// Creator for the noop service type
pub fn noop_connection_creator() -> ConnectionCreator {
    Arc::new(|service_type, state_tx, stats_tx| {
        if service_type != SERVICE_TYPE_NOOP {
            return Err(CoreError::UnsupportedServiceType(service_type.to_string()));
        }
        Ok(Arc::new(NoopConnection::new(state_tx, stats_tx)) as Arc<dyn TunnelConnection>)
    })
}

/// Provider tunnel process that runs until stopped
pub struct NoopTunnelProcess {
    stop: watch::Sender<bool>,
}

impl NoopTunnelProcess {
    pub fn new() -> Self {
        Self {
            stop: watch::channel(false).0,
        }
    }
}

impl Default for NoopTunnelProcess {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TunnelProcess for NoopTunnelProcess {
    async fn start(&self) -> CoreResult<()> {
        Ok(())
    }

    async fn wait(&self) -> CoreResult<()> {
        let mut stop = self.stop.subscribe();
        if *stop.borrow() {
            return Ok(());
        }
        let _ = stop.changed().await;
        Ok(())
    }

    async fn stop(&self) {
        let _ = self.stop.send_replace(true);
    }
}
