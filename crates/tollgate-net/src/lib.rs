//! Transport layer for tollgate nodes
//!
//! Two independent pieces live here:
//! - the dialog transport: an authenticated, addressable, bidirectional
//!   message channel between two identities, running over a pub/sub
//!   [`Broker`];
//! - the NAT pinger: provider-side UDP hole punching coordinated with
//!   session creation.

pub mod broker;
pub mod codec;
pub mod dialog;
pub mod error;
pub mod nat;

pub use broker::{Broker, BrokerRequest, MemoryBroker};
pub use codec::Envelope;
pub use dialog::{
    open_dialog, Dialog, DialogConfig, DialogHandler, DialogRequest, DialogWaiter, HandlerChain,
};
pub use error::{NetworkError, NetworkResult};
pub use nat::{NatPinger, PeerEndpoint, PingerConfig, PingerStage};
