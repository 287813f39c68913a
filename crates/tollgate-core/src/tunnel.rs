//! Tunnel process abstraction
//!
//! The VPN engine that actually moves packets is opaque to the core. The
//! consumer side drives a [`TunnelConnection`] built per service type; the
//! provider side supervises a [`TunnelProcess`]. Engine variants (embedded
//! library, external binary) are selected by handing different factories at
//! construction time.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use tollgate_crypto::Address;
use tollgate_market::Proposal;
use tollgate_session::{ServiceConfiguration, SessionId};

use crate::error::CoreResult;

/// Capacity of the state and statistics channels handed to a connection
pub const TUNNEL_CHANNEL_CAPACITY: usize = 10;

/// Tunnel lifecycle states, published on the state channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TunnelState {
    ProcessStarted,
    Connecting,
    Connected,
    Reconnecting,
    Disconnecting,
    ProcessExited,
}

/// Session traffic counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Everything a tunnel connection needs to start
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub session_id: SessionId,
    pub session_config: ServiceConfiguration,
    pub consumer_id: Address,
    pub provider_id: Address,
    pub proposal: Proposal,
}

/// Consumer-side tunnel connection
#[async_trait]
pub trait TunnelConnection: Send + Sync {
    /// Opaque configuration to embed in the session-create request
    /// (punch endpoint, keys, ...)
    async fn session_create_config(&self) -> CoreResult<serde_json::Value>;

    /// Start tunnelling with the negotiated session configuration
    async fn start(&self, options: ConnectOptions) -> CoreResult<()>;

    /// Block until the tunnel exits
    async fn wait(&self) -> CoreResult<()>;

    /// Stop the tunnel
    async fn stop(&self);
}

/// Builds a connection for a service type, reporting through the given
/// state and statistics channels
pub type ConnectionCreator = Arc<
    dyn Fn(
            &str,
            mpsc::Sender<TunnelState>,
            mpsc::Sender<Statistics>,
        ) -> CoreResult<Arc<dyn TunnelConnection>>
        + Send
        + Sync,
>;

/// Provider-side tunnel process (external binary or embedded engine)
#[async_trait]
pub trait TunnelProcess: Send + Sync {
    async fn start(&self) -> CoreResult<()>;

    /// Block until the process exits
    async fn wait(&self) -> CoreResult<()>;

    async fn stop(&self);
}

/// Builds a fresh tunnel process per serving round
pub type TunnelProcessFactory =
    Arc<dyn Fn() -> CoreResult<Arc<dyn TunnelProcess>> + Send + Sync>;
