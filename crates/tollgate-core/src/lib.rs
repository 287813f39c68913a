//! tollgate connection lifecycle core
//!
//! One node can act as a consumer (dial a provider, tunnel traffic, pay
//! with signed promises) and as a provider (accept sessions, punch NAT,
//! charge the consumer) at the same time. The consumer side is driven by
//! the [`connection::ConnectionManager`]; the provider side by the
//! [`service::ServiceManager`]. Both are built from injected capabilities
//! (dialog creators, tunnel factories, discovery, kill switch), so every
//! piece runs against in-memory doubles in tests.

pub mod connection;
pub mod error;
pub mod events;
pub mod firewall;
pub mod noop;
pub mod service;
pub mod tunnel;

pub use connection::{
    default_payment_factory, BrokerDialogCreator, ConnectParams, ConnectionManager,
    ConnectionStatus, DialogCreator, PaymentIssuerFactory,
};
pub use error::{CoreError, CoreResult};
pub use events::{
    Event, EventBus, EventPublisher, SessionEvent, SessionEventKind, SessionInfo, StateEvent,
    StatisticsEvent,
};
pub use firewall::{KillSwitch, NoopKillSwitch};
pub use service::{
    broker_waiter_factory, Discovery, DiscoveryFactory, InstanceRecord, LocalDiscovery, Options,
    Service, ServiceManager, ServicePool, ServiceRegistry, TunnelService, TunnelServiceConfig,
};
pub use tunnel::{
    ConnectOptions, ConnectionCreator, Statistics, TunnelConnection, TunnelProcess,
    TunnelProcessFactory, TunnelState,
};
