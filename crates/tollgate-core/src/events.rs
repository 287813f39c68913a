//! Event bus
//!
//! The connection manager publishes session, state and statistics events
//! fire-and-forget; subscribers run on their own tasks and can never block
//! the manager.

use tokio::sync::broadcast;
use tracing::trace;

use tollgate_crypto::Address;
use tollgate_market::Proposal;
use tollgate_session::SessionId;

use crate::tunnel::{Statistics, TunnelState};

/// Broadcast channel capacity; laggards drop old events
const EVENT_BUS_CAPACITY: usize = 64;

/// The relevant facts of the current session
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub consumer_id: Address,
    pub proposal: Proposal,
}

/// Session lifecycle markers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEventKind {
    Created,
    Ended,
}

/// Published when a session is created or ends
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub kind: SessionEventKind,
    pub session: SessionInfo,
}

/// Published for every observed tunnel state change
#[derive(Debug, Clone)]
pub struct StateEvent {
    pub state: TunnelState,
    pub session: SessionInfo,
}

/// Published for every statistics sample from the tunnel
#[derive(Debug, Clone)]
pub struct StatisticsEvent {
    pub stats: Statistics,
    pub session: SessionInfo,
}

/// Any event the core publishes
#[derive(Debug, Clone)]
pub enum Event {
    Session(SessionEvent),
    State(StateEvent),
    Statistics(StatisticsEvent),
}

/// Fire-and-forget event publication
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: Event);
}

/// Broadcast-backed event bus
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus with the default capacity
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { tx }
    }

    /// Subscribe to all events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventPublisher for EventBus {
    fn publish(&self, event: Event) {
        trace!("publishing {:?}", event);
        // No subscribers is fine
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tollgate_crypto::Identity;
    use tollgate_market::{Contact, Location, PaymentMethod};

    fn session_info() -> SessionInfo {
        SessionInfo {
            session_id: SessionId::random(),
            consumer_id: Identity::generate().address(),
            proposal: Proposal {
                id: 1,
                provider_id: Identity::generate().address(),
                service_type: "noop".to_string(),
                provider_contacts: vec![Contact::broker("t")],
                payment_method: PaymentMethod::default(),
                location: Location::default(),
            },
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(Event::Session(SessionEvent {
            kind: SessionEventKind::Created,
            session: session_info(),
        }));

        let event = rx.recv().await.unwrap();
        assert!(matches!(
            event,
            Event::Session(SessionEvent {
                kind: SessionEventKind::Created,
                ..
            })
        ));
    }

    #[test]
    fn test_publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(Event::State(StateEvent {
            state: TunnelState::Connecting,
            session: session_info(),
        }));
    }
}
