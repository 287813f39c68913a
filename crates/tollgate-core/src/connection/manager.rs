//! Consumer connection manager
//!
//! Connecting assembles the session as an ordered stack of compensating
//! actions: open dialog, build the tunnel connection, negotiate the
//! session, start payments, start the tunnel, wait for the Connected
//! state. Any failure runs the undo actions in reverse insertion order and
//! the status returns to NotConnected. Disconnect cancels the in-flight
//! attempt first, which unblocks whatever step is currently suspended.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use tollgate_crypto::Identity;
use tollgate_market::Proposal;
use tollgate_net::{open_dialog, Broker, Dialog, NetworkResult};
use tollgate_payment::{BalanceMessage, PaymentIssuer, PromiseState, TOPIC_BALANCE};
use tollgate_session::{
    request_session_create, request_session_destroy, ConsumerInfo,
};

use crate::connection::status::{ConnectParams, ConnectionStatus};
use crate::error::{CoreError, CoreResult};
use crate::events::{
    Event, EventPublisher, SessionEvent, SessionEventKind, SessionInfo, StateEvent,
    StatisticsEvent,
};
use crate::firewall::KillSwitch;
use crate::tunnel::{
    ConnectOptions, ConnectionCreator, Statistics, TunnelConnection, TunnelState,
    TUNNEL_CHANNEL_CAPACITY,
};

/// Capacity of the balance channel between dialog and payment issuer
const BALANCE_CHANNEL_CAPACITY: usize = 1;

type UndoFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type Undo = Box<dyn FnOnce() -> UndoFuture + Send>;

/// Creates the dialog to a provider; a capability so the manager is
/// testable with in-memory doubles
#[async_trait]
pub trait DialogCreator: Send + Sync {
    async fn create_dialog(
        &self,
        consumer: Arc<Identity>,
        proposal: &Proposal,
    ) -> NetworkResult<Arc<Dialog>>;
}

/// Default creator dialing through a broker
pub struct BrokerDialogCreator {
    broker: Arc<dyn Broker>,
}

impl BrokerDialogCreator {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl DialogCreator for BrokerDialogCreator {
    async fn create_dialog(
        &self,
        consumer: Arc<Identity>,
        proposal: &Proposal,
    ) -> NetworkResult<Arc<Dialog>> {
        open_dialog(self.broker.clone(), consumer, proposal).await
    }
}

/// Builds the payment issuer for a freshly negotiated session
pub type PaymentIssuerFactory = Arc<
    dyn Fn(
            PromiseState,
            mpsc::Receiver<BalanceMessage>,
            Arc<Dialog>,
            Arc<Identity>,
        ) -> Arc<PaymentIssuer>
        + Send
        + Sync,
>;

/// Reverse-order stack of undo actions for one connect attempt
struct Compensation {
    undos: Mutex<Vec<Undo>>,
}

impl Compensation {
    fn new() -> Self {
        Self {
            undos: Mutex::new(Vec::new()),
        }
    }

    async fn push(&self, undo: Undo) {
        self.undos.lock().await.push(undo);
    }

    /// Drain and run all undos, newest first. Take-based, so concurrent
    /// callers each run every action at most once.
    async fn run(&self) {
        let undos = std::mem::take(&mut *self.undos.lock().await);
        for undo in undos.into_iter().rev() {
            undo().await;
        }
    }
}

struct ActiveConnection {
    cancel: watch::Sender<bool>,
    compensation: Arc<Compensation>,
}

/// The consumer-side connection state machine
pub struct ConnectionManager {
    dialog_creator: Arc<dyn DialogCreator>,
    payment_factory: PaymentIssuerFactory,
    connection_creator: ConnectionCreator,
    publisher: Arc<dyn EventPublisher>,
    kill_switch: Arc<dyn KillSwitch>,

    status: RwLock<ConnectionStatus>,
    active: Mutex<Option<ActiveConnection>>,
    disco_lock: Mutex<()>,
}

impl ConnectionManager {
    /// Create a manager with its collaborating capabilities
    pub fn new(
        dialog_creator: Arc<dyn DialogCreator>,
        payment_factory: PaymentIssuerFactory,
        connection_creator: ConnectionCreator,
        publisher: Arc<dyn EventPublisher>,
        kill_switch: Arc<dyn KillSwitch>,
    ) -> Arc<Self> {
        Arc::new(Self {
            dialog_creator,
            payment_factory,
            connection_creator,
            publisher,
            kill_switch,
            status: RwLock::new(ConnectionStatus::NotConnected),
            active: Mutex::new(None),
            disco_lock: Mutex::new(()),
        })
    }

    /// Current status
    pub async fn status(&self) -> ConnectionStatus {
        self.status.read().await.clone()
    }

    /// Connect `consumer` to the service advertised by `proposal`
    pub async fn connect(
        self: &Arc<Self>,
        consumer: Arc<Identity>,
        proposal: Proposal,
        params: ConnectParams,
    ) -> CoreResult<()> {
        let cancel = watch::channel(false).0;
        let compensation = Arc::new(Compensation::new());
        {
            // Install the attempt under the status lock so a racing
            // disconnect either sees NotConnected or finds the attempt
            let mut status = self.status.write().await;
            if !status.is_not_connected() {
                return Err(CoreError::AlreadyExists);
            }
            *self.active.lock().await = Some(ActiveConnection {
                cancel: cancel.clone(),
                compensation: compensation.clone(),
            });
            *status = ConnectionStatus::Connecting;
        }

        let result = self
            .start_connection(consumer, proposal, params, cancel.subscribe(), &compensation)
            .await;

        if let Err(e) = result {
            info!("cancelling connection initiation: {}", e);
            match self.disconnect().await {
                Ok(()) | Err(CoreError::NoConnection) => {}
                Err(de) => warn!("disconnect during failed connect: {}", de),
            }
            // Catch undos registered after a concurrent drain
            compensation.run().await;
            self.set_status(ConnectionStatus::NotConnected).await;
            return Err(e);
        }
        Ok(())
    }

    /// Tear down the active connection or cancel the in-flight attempt
    pub async fn disconnect(self: &Arc<Self>) -> CoreResult<()> {
        let _guard = self.disco_lock.lock().await;

        if self.status.read().await.is_not_connected() {
            return Err(CoreError::NoConnection);
        }
        self.set_status(ConnectionStatus::Disconnecting).await;

        let active = self.active.lock().await.take();
        if let Some(active) = active {
            // Cancelling first unblocks any suspended connect step
            let _ = active.cancel.send_replace(true);
            active.compensation.run().await;
        }

        // Kill switch disarming is the firewall module's lifecycle, not an
        // undo action
        self.kill_switch.disable();
        self.set_status(ConnectionStatus::NotConnected).await;
        Ok(())
    }

    async fn set_status(&self, status: ConnectionStatus) {
        *self.status.write().await = status;
    }

    async fn start_connection(
        self: &Arc<Self>,
        consumer: Arc<Identity>,
        proposal: Proposal,
        params: ConnectParams,
        mut cancel_rx: watch::Receiver<bool>,
        compensation: &Arc<Compensation>,
    ) -> CoreResult<()> {
        // 1. Dialog to the provider
        let dialog = tokio::select! {
            _ = cancel_rx.changed() => return Err(CoreError::ConnectionCancelled),
            dialog = self
                .dialog_creator
                .create_dialog(consumer.clone(), &proposal) => dialog?,
        };
        {
            let dialog = dialog.clone();
            compensation
                .push(Box::new(move || {
                    Box::pin(async move { dialog.close() })
                }))
                .await;
        }

        // 2. Tunnel connection with bounded state/statistics channels
        let (state_tx, mut state_rx) = mpsc::channel(TUNNEL_CHANNEL_CAPACITY);
        let (stats_tx, stats_rx) = mpsc::channel(TUNNEL_CHANNEL_CAPACITY);
        let connection =
            (self.connection_creator)(&proposal.service_type, state_tx, stats_tx)?;

        // 3. Ask the tunnel what to send the provider
        let session_create_config = connection.session_create_config().await?;

        // 4. Negotiate the session
        let consumer_info = ConsumerInfo {
            issuer_id: consumer.address(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
        };
        let (session_id, session_config, payment_info) = tokio::select! {
            _ = cancel_rx.changed() => return Err(CoreError::ConnectionCancelled),
            created = request_session_create(
                &dialog,
                proposal.id,
                session_create_config,
                consumer_info,
            ) => created?,
        };
        {
            let dialog = dialog.clone();
            let session_id = session_id.clone();
            compensation
                .push(Box::new(move || {
                    Box::pin(async move {
                        if let Err(e) = request_session_destroy(&dialog, session_id).await {
                            warn!("session destroy during teardown failed: {}", e);
                        }
                    })
                }))
                .await;
        }

        // 5. Payment issuer, fed by the dialog's balance stream
        let initial_state = payment_info
            .map(|info| PromiseState {
                amount: info.last_promise.amount,
                sequence_id: info.last_promise.sequence_id,
            })
            .unwrap_or_default();
        let (balance_tx, balance_rx) = mpsc::channel(BALANCE_CHANNEL_CAPACITY);
        let issuer = (self.payment_factory)(
            initial_state,
            balance_rx,
            dialog.clone(),
            consumer.clone(),
        );
        {
            let issuer = issuer.clone();
            compensation
                .push(Box::new(move || {
                    Box::pin(async move { issuer.stop() })
                }))
                .await;
        }

        let mut balance_stream = dialog.receive::<BalanceMessage>(TOPIC_BALANCE).await?;
        tokio::spawn(async move {
            while let Some(message) = balance_stream.recv().await {
                if balance_tx.send(message).await.is_err() {
                    break;
                }
            }
        });

        // 6. Payment loop; a fatal payment error disconnects
        self.spawn_payment_loop(issuer);

        let session_info = SessionInfo {
            session_id: session_id.clone(),
            consumer_id: consumer.address(),
            proposal: proposal.clone(),
        };

        // 7. Session created event, undone by the ended event
        self.publisher.publish(Event::Session(SessionEvent {
            kind: SessionEventKind::Created,
            session: session_info.clone(),
        }));
        {
            let publisher = self.publisher.clone();
            let session = session_info.clone();
            compensation
                .push(Box::new(move || {
                    Box::pin(async move {
                        publisher.publish(Event::Session(SessionEvent {
                            kind: SessionEventKind::Ended,
                            session,
                        }));
                    })
                }))
                .await;
        }

        // 8. Start the tunnel
        let options = ConnectOptions {
            session_id,
            session_config,
            consumer_id: consumer.address(),
            provider_id: proposal.provider_id,
            proposal,
        };
        tokio::select! {
            _ = cancel_rx.changed() => return Err(CoreError::ConnectionCancelled),
            started = connection.start(options) => started?,
        }
        {
            let connection = connection.clone();
            compensation
                .push(Box::new(move || {
                    Box::pin(async move { connection.stop().await })
                }))
                .await;
        }

        // 9. Statistics flow even before the Connected state
        self.spawn_statistics_consumer(stats_rx, session_info.clone());

        // 10. Block until the tunnel reports Connected
        self.wait_for_connected_state(&mut state_rx, &mut cancel_rx, &session_info)
            .await?;

        // 11. Arm the kill switch once the tunnel is up
        if !params.disable_kill_switch {
            self.kill_switch.enable()?;
        }

        // 12. Steady state
        self.spawn_state_consumer(state_rx, session_info);
        self.spawn_connection_waiter(connection);
        Ok(())
    }

    async fn wait_for_connected_state(
        self: &Arc<Self>,
        state_rx: &mut mpsc::Receiver<TunnelState>,
        cancel_rx: &mut watch::Receiver<bool>,
        session_info: &SessionInfo,
    ) -> CoreResult<()> {
        loop {
            tokio::select! {
                _ = cancel_rx.changed() => return Err(CoreError::ConnectionCancelled),
                state = state_rx.recv() => {
                    let Some(state) = state else {
                        return Err(CoreError::ConnectionFailed);
                    };
                    self.on_state_changed(state, session_info).await;
                    if state == TunnelState::Connected {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn on_state_changed(&self, state: TunnelState, session_info: &SessionInfo) {
        self.publisher.publish(Event::State(StateEvent {
            state,
            session: session_info.clone(),
        }));

        match state {
            TunnelState::Connected => {
                self.set_status(ConnectionStatus::Connected(session_info.clone()))
                    .await;
            }
            TunnelState::Reconnecting => {
                self.set_status(ConnectionStatus::Reconnecting).await;
            }
            _ => {}
        }
    }

    fn spawn_payment_loop(self: &Arc<Self>, issuer: Arc<PaymentIssuer>) {
        let manager = self.clone();
        tokio::spawn(async move {
            if let Err(e) = issuer.start().await {
                error!("payment error: {}", e);
                log_disconnect_error(manager.disconnect().await);
            }
        });
    }

    fn spawn_statistics_consumer(
        self: &Arc<Self>,
        mut stats_rx: mpsc::Receiver<Statistics>,
        session_info: SessionInfo,
    ) {
        let publisher = self.publisher.clone();
        tokio::spawn(async move {
            while let Some(stats) = stats_rx.recv().await {
                publisher.publish(Event::Statistics(StatisticsEvent {
                    stats,
                    session: session_info.clone(),
                }));
            }
        });
    }

    fn spawn_state_consumer(
        self: &Arc<Self>,
        mut state_rx: mpsc::Receiver<TunnelState>,
        session_info: SessionInfo,
    ) {
        let manager = self.clone();
        tokio::spawn(async move {
            while let Some(state) = state_rx.recv().await {
                manager.on_state_changed(state, &session_info).await;
            }
            debug!("tunnel state stream ended");
            log_disconnect_error(manager.disconnect().await);
        });
    }

    fn spawn_connection_waiter(self: &Arc<Self>, connection: Arc<dyn TunnelConnection>) {
        let manager = self.clone();
        tokio::spawn(async move {
            match connection.wait().await {
                Ok(()) => info!("connection exited"),
                Err(e) => warn!("connection exited with error: {}", e),
            }
            log_disconnect_error(manager.disconnect().await);
        });
    }
}

/// Default payment issuer factory using the consumer identity for signing
pub fn default_payment_factory() -> PaymentIssuerFactory {
    Arc::new(|initial_state, balance_rx, dialog, consumer| {
        let provider = dialog.peer().address;
        Arc::new(PaymentIssuer::new(
            initial_state,
            balance_rx,
            dialog,
            consumer,
            provider,
            Default::default(),
        ))
    })
}

fn log_disconnect_error(result: CoreResult<()>) {
    match result {
        Ok(()) | Err(CoreError::NoConnection) => {}
        Err(e) => error!("disconnect error: {}", e),
    }
}
