//! Provider-side NAT hole punching
//!
//! The session manager hands the pinger the consumer's punch endpoint
//! (taken from the session-create request config); the pinger sends short
//! datagram bursts at that endpoint until the first inbound datagram
//! confirms the mapping is open. The tunnel supervisor blocks on
//! [`NatPinger::wait_for_hole`] before starting the VPN process.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use crate::error::{NetworkError, NetworkResult};

/// Datagram sent while punching; content is irrelevant to the protocol
const PUNCH_PAYLOAD: &[u8] = b"tollgate-punch";

/// Pinger lifecycle stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingerStage {
    /// No socket bound yet
    Idle,
    /// Socket bound, nobody waiting
    Bound,
    /// A waiter is blocked on a punch endpoint
    Waiting,
    /// A hole has been punched
    Punched,
}

/// Punch endpoint delivered through the session-create request config
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEndpoint {
    pub ip: IpAddr,
    pub port: u16,
}

impl From<PeerEndpoint> for SocketAddr {
    fn from(endpoint: PeerEndpoint) -> Self {
        SocketAddr::new(endpoint.ip, endpoint.port)
    }
}

/// Configuration for the NAT pinger
#[derive(Debug, Clone)]
pub struct PingerConfig {
    /// Whether this provider sits behind a NAT at all; when false,
    /// `wait_for_hole` returns immediately
    pub behind_nat: bool,
    /// Maximum number of punch bursts
    pub max_attempts: u32,
    /// Delay between punch bursts
    pub punch_interval: Duration,
}

impl Default for PingerConfig {
    fn default() -> Self {
        Self {
            behind_nat: true,
            max_attempts: 30,
            punch_interval: Duration::from_millis(100),
        }
    }
}

struct PingerState {
    stage: PingerStage,
    socket: Option<Arc<UdpSocket>>,
    port: Option<u16>,
}

/// UDP hole puncher coordinating session creation with tunnel startup
pub struct NatPinger {
    config: PingerConfig,
    state: Mutex<PingerState>,
    request_tx: mpsc::Sender<serde_json::Value>,
    request_rx: Mutex<mpsc::Receiver<serde_json::Value>>,
    close: watch::Sender<bool>,
}

impl NatPinger {
    /// Create a pinger with the given configuration
    pub fn new(config: PingerConfig) -> Self {
        // Capacity 1: session creation must never block on the hand-off
        let (request_tx, request_rx) = mpsc::channel(1);
        Self {
            config,
            state: Mutex::new(PingerState {
                stage: PingerStage::Idle,
                socket: None,
                port: None,
            }),
            request_tx,
            request_rx: Mutex::new(request_rx),
            close: watch::channel(false).0,
        }
    }

    /// Sender half of the rendezvous channel, handed to the session manager
    pub fn request_sender(&self) -> mpsc::Sender<serde_json::Value> {
        self.request_tx.clone()
    }

    /// Current lifecycle stage
    pub async fn stage(&self) -> PingerStage {
        self.state.lock().await.stage
    }

    /// Bind the punch socket; idempotent for the same port
    pub async fn bind_producer(&self, port: u16) -> NetworkResult<()> {
        let mut state = self.state.lock().await;
        if let Some(bound) = state.port {
            if bound == port {
                return Ok(());
            }
            return Err(NetworkError::AlreadyBound {
                bound,
                requested: port,
            });
        }

        let socket = UdpSocket::bind(("0.0.0.0", port))
            .await
            .map_err(|e| NetworkError::Transport(e.to_string()))?;
        let local = socket
            .local_addr()
            .map_err(|e| NetworkError::Transport(e.to_string()))?;

        info!("NAT pinger bound to {}", local);
        state.socket = Some(Arc::new(socket));
        state.port = Some(local.port());
        state.stage = PingerStage::Bound;
        Ok(())
    }

    /// Block until a hole is punched for the next session
    ///
    /// Returns immediately when the provider is not behind NAT. Otherwise
    /// waits for a punch endpoint from the session manager, then punches.
    /// `close()` unblocks the call with [`NetworkError::Cancelled`].
    pub async fn wait_for_hole(&self) -> NetworkResult<()> {
        if !self.config.behind_nat {
            debug!("not behind NAT, skipping punch");
            return Ok(());
        }

        {
            let mut state = self.state.lock().await;
            if state.socket.is_none() {
                return Err(NetworkError::NotBound);
            }
            state.stage = PingerStage::Waiting;
        }

        let mut close_rx = self.close.subscribe();
        if *close_rx.borrow() {
            return Err(NetworkError::Cancelled);
        }

        let config = {
            let mut request_rx = self.request_rx.lock().await;
            tokio::select! {
                _ = close_rx.changed() => return Err(NetworkError::Cancelled),
                config = request_rx.recv() => {
                    config.ok_or(NetworkError::Cancelled)?
                }
            }
        };

        let endpoint: PeerEndpoint = serde_json::from_value(config)
            .map_err(|e| NetworkError::Serialization(e.to_string()))?;
        self.punch(endpoint.into(), &mut close_rx).await
    }

    /// Unblock any waiter and stop the pinger; idempotent
    pub fn close(&self) {
        if !self.close.send_replace(true) {
            debug!("NAT pinger closed");
        }
    }

    async fn punch(
        &self,
        peer: SocketAddr,
        close_rx: &mut watch::Receiver<bool>,
    ) -> NetworkResult<()> {
        let socket = self
            .state
            .lock()
            .await
            .socket
            .clone()
            .ok_or(NetworkError::NotBound)?;

        info!("punching toward {}", peer);
        let mut buf = [0u8; 64];

        for attempt in 0..self.config.max_attempts {
            socket
                .send_to(PUNCH_PAYLOAD, peer)
                .await
                .map_err(|e| NetworkError::Transport(e.to_string()))?;

            tokio::select! {
                _ = close_rx.changed() => return Err(NetworkError::Cancelled),
                received = socket.recv_from(&mut buf) => {
                    match received {
                        Ok((_, from)) => {
                            // The first inbound datagram proves the mapping
                            // is open; its source is the peer's real endpoint
                            info!("hole punched after {} attempt(s), peer at {}", attempt + 1, from);
                            self.state.lock().await.stage = PingerStage::Punched;
                            return Ok(());
                        }
                        Err(e) => warn!("punch receive error: {}", e),
                    }
                }
                _ = tokio::time::sleep(self.config.punch_interval) => {}
            }
        }

        warn!("no inbound datagram after {} attempts", self.config.max_attempts);
        Err(NetworkError::PunchTimeout)
    }
}
