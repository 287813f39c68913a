//! Connection status

use crate::events::SessionInfo;

/// The consumer connection manager's single current status
#[derive(Debug, Clone, Default)]
pub enum ConnectionStatus {
    /// No connection and none being attempted
    #[default]
    NotConnected,
    /// A connect attempt is in progress
    Connecting,
    /// Tunnel is up for the given session
    Connected(SessionInfo),
    /// Tunnel dropped and is re-establishing
    Reconnecting,
    /// Teardown in progress
    Disconnecting,
}

impl ConnectionStatus {
    /// Whether this is the idle state
    pub fn is_not_connected(&self) -> bool {
        matches!(self, Self::NotConnected)
    }

    /// Session info when connected
    pub fn session(&self) -> Option<&SessionInfo> {
        match self {
            Self::Connected(info) => Some(info),
            _ => None,
        }
    }
}

/// Caller-supplied connect options
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectParams {
    /// Skip arming the host firewall kill switch
    pub disable_kill_switch: bool,
}
