//! Host firewall kill switch
//!
//! Blocks non-tunnel traffic while a connection is up. The real rule
//! manipulation is platform code owned by the embedding program; the core
//! only arms the switch after the tunnel connects and disarms it when the
//! connection ends.

use tracing::info;

use crate::error::CoreResult;

/// Kill switch handle injected into the connection manager
pub trait KillSwitch: Send + Sync {
    /// Block traffic outside the tunnel
    fn enable(&self) -> CoreResult<()>;

    /// Restore normal traffic; idempotent
    fn disable(&self);
}

/// Kill switch that only logs; used in tests and on unsupported platforms
#[derive(Default)]
pub struct NoopKillSwitch;

impl KillSwitch for NoopKillSwitch {
    fn enable(&self) -> CoreResult<()> {
        info!("kill switch enabled (noop)");
        Ok(())
    }

    fn disable(&self) {
        info!("kill switch disabled (noop)");
    }
}
