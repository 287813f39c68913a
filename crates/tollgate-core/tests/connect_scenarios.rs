//! Full connection lifecycle scenarios over an in-memory broker:
//!   1. Happy-path connect with a running provider
//!   2. Cancel while waiting for the tunnel to connect
//!   3. Session create against the wrong proposal id
//!   4. Promise replay is rejected, successor accepted
//!   5. Destroying the last session signals service shutdown
//!   6. Tunnel state stream dies while connected

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::timeout;

use tollgate_core::{
    default_payment_factory, noop::noop_connection_creator, noop::NoopConnection,
    noop::SERVICE_TYPE_NOOP, BrokerDialogCreator, ConnectOptions, ConnectParams,
    ConnectionCreator, ConnectionManager, CoreError, CoreResult, Event, EventBus, KillSwitch,
    SessionEventKind, Statistics, TunnelConnection, TunnelState,
};
use tollgate_crypto::Identity;
use tollgate_market::{Location, PaymentMethod, Proposal};
use tollgate_net::{
    open_dialog, Broker, DialogHandler, DialogWaiter, HandlerChain, MemoryBroker,
};
use tollgate_payment::{
    BillingConfig, Promise, PromiseValidator, PromiseValidatorHandler, TOPIC_PROMISE,
};
use tollgate_session::{
    handler::ConfigProvider, request_session_create, request_session_destroy, ConsumerInfo,
    SessionDialogHandler, SessionError, SessionManager, SessionStore,
};

// ── Fixtures ────────────────────────────────────────────────────────────────

struct TestProvider {
    proposal: Proposal,
    store: Arc<SessionStore>,
    validator: Arc<PromiseValidator>,
    shutdown_rx: Mutex<mpsc::Receiver<()>>,
    _nat_rx: mpsc::Receiver<serde_json::Value>,
    _waiter: Arc<DialogWaiter>,
}

async fn start_provider(broker: Arc<dyn Broker>, proposal_id: i64) -> TestProvider {
    let identity = Arc::new(Identity::generate());
    let waiter = Arc::new(DialogWaiter::new(
        broker,
        identity.clone(),
        SERVICE_TYPE_NOOP,
    ));
    let contact = waiter.start().await.unwrap();

    let proposal = Proposal {
        id: proposal_id,
        provider_id: identity.address(),
        service_type: SERVICE_TYPE_NOOP.to_string(),
        provider_contacts: vec![contact],
        payment_method: PaymentMethod {
            price_per_interval: 10,
            interval: Duration::from_millis(50),
        },
        location: Location::default(),
    };

    let store = Arc::new(SessionStore::new());
    let validator = Arc::new(PromiseValidator::new(BillingConfig {
        default_interval: Duration::from_millis(50),
        max_violations: 3,
    }));
    let (nat_tx, nat_rx) = mpsc::channel(1);
    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

    let manager = Arc::new(SessionManager::new(
        proposal.clone(),
        store.clone(),
        validator.clone(),
        nat_tx,
        shutdown_tx,
    ));
    let provide: ConfigProvider = Arc::new(|_request| Ok((serde_json::json!({}), None)));
    let session_handler =
        Arc::new(SessionDialogHandler::new(manager, provide)) as Arc<dyn DialogHandler>;
    let payment_handler =
        Arc::new(PromiseValidatorHandler(validator.clone())) as Arc<dyn DialogHandler>;
    let chain = Arc::new(HandlerChain::new(vec![session_handler, payment_handler]));
    waiter.serve_dialogs(chain).await.unwrap();

    TestProvider {
        proposal,
        store,
        validator,
        shutdown_rx: Mutex::new(shutdown_rx),
        _nat_rx: nat_rx,
        _waiter: waiter,
    }
}

#[derive(Default)]
struct CountingKillSwitch {
    enabled: AtomicUsize,
    disabled: AtomicUsize,
}

impl KillSwitch for CountingKillSwitch {
    fn enable(&self) -> CoreResult<()> {
        self.enabled.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn disable(&self) {
        self.disabled.fetch_add(1, Ordering::SeqCst);
    }
}

struct TestConsumer {
    manager: Arc<ConnectionManager>,
    identity: Arc<Identity>,
    bus: Arc<EventBus>,
    kill: Arc<CountingKillSwitch>,
}

fn start_consumer(broker: Arc<dyn Broker>, creator: ConnectionCreator) -> TestConsumer {
    let bus = Arc::new(EventBus::new());
    let kill = Arc::new(CountingKillSwitch::default());
    let manager = ConnectionManager::new(
        Arc::new(BrokerDialogCreator::new(broker)),
        default_payment_factory(),
        creator,
        bus.clone(),
        kill.clone(),
    );
    TestConsumer {
        manager,
        identity: Arc::new(Identity::generate()),
        bus,
        kill,
    }
}

async fn poll_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let ok = timeout(Duration::from_secs(5), async {
        loop {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(ok.is_ok(), "timeout waiting for: {}", what);
}

// ── Test 1: Happy path connect ──────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn test_01_happy_path_connect() {
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let provider = start_provider(broker.clone(), 42).await;
    let consumer = start_consumer(broker, noop_connection_creator());
    let mut events = consumer.bus.subscribe();

    consumer
        .manager
        .connect(
            consumer.identity.clone(),
            provider.proposal.clone(),
            ConnectParams::default(),
        )
        .await
        .unwrap();

    let status = consumer.manager.status().await;
    let session = status.session().expect("status should be Connected");
    assert!(provider.store.contains(&session.session_id).await);

    // Exactly one session-created event
    let mut created = 0;
    while let Ok(Ok(event)) = timeout(Duration::from_millis(200), events.recv()).await {
        if let Event::Session(e) = event {
            if e.kind == SessionEventKind::Created {
                created += 1;
                assert_eq!(e.session.session_id, session.session_id);
            }
        }
    }
    assert_eq!(created, 1);

    // Payments flow: the provider bills, the consumer promises
    let consumer_address = consumer.identity.address();
    let validator = provider.validator.clone();
    poll_until("first promise accepted", || {
        let validator = validator.clone();
        async move { validator.accepted(consumer_address).await.sequence_id >= 1 }
    })
    .await;

    assert_eq!(consumer.kill.enabled.load(Ordering::SeqCst), 1);
    consumer.manager.disconnect().await.unwrap();
    assert!(consumer.manager.status().await.is_not_connected());
}

// ── Test 2: Cancel during wait-for-connected ────────────────────────────────

fn stalled_creator() -> ConnectionCreator {
    Arc::new(|_, state_tx, stats_tx| {
        Ok(Arc::new(NoopConnection::stalled(state_tx, stats_tx)) as Arc<dyn TunnelConnection>)
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn test_02_cancel_during_wait() {
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let provider = start_provider(broker.clone(), 42).await;
    let consumer = start_consumer(broker, stalled_creator());

    let manager = consumer.manager.clone();
    let identity = consumer.identity.clone();
    let proposal = provider.proposal.clone();
    let connect = tokio::spawn(async move {
        manager
            .connect(identity, proposal, ConnectParams::default())
            .await
    });

    // Session exists on the provider once the attempt reaches the wait
    let store = provider.store.clone();
    poll_until("session created on provider", || {
        let store = store.clone();
        async move { store.len().await == 1 }
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    consumer.manager.disconnect().await.unwrap();

    let result = connect.await.unwrap();
    assert!(matches!(result, Err(CoreError::ConnectionCancelled)));

    // Compensation asked the provider to destroy the session
    let store = provider.store.clone();
    poll_until("session destroyed on provider", || {
        let store = store.clone();
        async move { store.is_empty().await }
    })
    .await;
    assert!(consumer.manager.status().await.is_not_connected());
    assert_eq!(consumer.kill.enabled.load(Ordering::SeqCst), 0);

    // A second disconnect has nothing to close
    let second = consumer.manager.disconnect().await;
    assert!(matches!(second, Err(CoreError::NoConnection)));
}

// ── Test 3: Bad proposal id ─────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn test_03_bad_proposal_id() {
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let provider = start_provider(broker.clone(), 42).await;
    let consumer = start_consumer(broker, noop_connection_creator());

    let mut stale = provider.proposal.clone();
    stale.id = 99;

    let result = consumer
        .manager
        .connect(consumer.identity.clone(), stale, ConnectParams::default())
        .await;

    assert!(matches!(
        result,
        Err(CoreError::Session(SessionError::InvalidProposal))
    ));
    assert!(provider.store.is_empty().await);
    assert!(consumer.manager.status().await.is_not_connected());
}

// ── Test 4: Promise replay ──────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn test_04_promise_replay() {
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let provider = start_provider(broker.clone(), 42).await;
    let identity = Arc::new(Identity::generate());
    let address = identity.address();

    let dialog = open_dialog(broker, identity.clone(), &provider.proposal)
        .await
        .unwrap();

    for (seq, amount) in [(1u64, 10u64), (2, 20)] {
        let promise = Promise::issue(&identity, amount, seq).unwrap();
        dialog.send(TOPIC_PROMISE, &promise).await.unwrap();
    }
    let validator = provider.validator.clone();
    poll_until("promises 1 and 2 accepted", || {
        let validator = validator.clone();
        async move { validator.accepted(address).await.sequence_id == 2 }
    })
    .await;

    // Replay of sequence 2 is rejected
    let replay = Promise::issue(&identity, 25, 2).unwrap();
    dialog.send(TOPIC_PROMISE, &replay).await.unwrap();
    let validator = provider.validator.clone();
    poll_until("replay rejected", || {
        let validator = validator.clone();
        async move { validator.violations(address).await == 1 }
    })
    .await;

    // The successor is still accepted
    let next = Promise::issue(&identity, 30, 3).unwrap();
    dialog.send(TOPIC_PROMISE, &next).await.unwrap();
    let validator = provider.validator.clone();
    poll_until("sequence 3 accepted", || {
        let validator = validator.clone();
        async move { validator.accepted(address).await.sequence_id == 3 }
    })
    .await;
    assert_eq!(provider.validator.accepted(address).await.amount, 30);
}

// ── Test 5: Last session shutdown ───────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn test_05_last_session_shutdown() {
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let provider = start_provider(broker.clone(), 42).await;
    let identity = Arc::new(Identity::generate());

    let dialog = open_dialog(broker, identity.clone(), &provider.proposal)
        .await
        .unwrap();

    let (session_id, _, _) = request_session_create(
        &dialog,
        42,
        serde_json::json!({}),
        ConsumerInfo {
            issuer_id: identity.address(),
            client_version: "test".to_string(),
        },
    )
    .await
    .unwrap();
    assert_eq!(provider.store.len().await, 1);

    request_session_destroy(&dialog, session_id).await.unwrap();

    let signalled = timeout(
        Duration::from_secs(1),
        provider.shutdown_rx.lock().await.recv(),
    )
    .await
    .expect("shutdown signal not delivered");
    assert!(signalled.is_some());
    assert!(provider.store.is_empty().await);
}

// ── Test 6: Tunnel dies while connected ─────────────────────────────────────

struct DroppableConnection {
    state_tx: Mutex<Option<mpsc::Sender<TunnelState>>>,
    _stats_tx: mpsc::Sender<Statistics>,
    done: watch::Sender<bool>,
}

impl DroppableConnection {
    async fn kill(&self) {
        // Dropping the sender closes the state stream, as a crashed
        // provider would
        self.state_tx.lock().await.take();
    }
}

#[async_trait]
impl TunnelConnection for DroppableConnection {
    async fn session_create_config(&self) -> CoreResult<serde_json::Value> {
        Ok(serde_json::json!({}))
    }

    async fn start(&self, _options: ConnectOptions) -> CoreResult<()> {
        let guard = self.state_tx.lock().await;
        if let Some(tx) = guard.as_ref() {
            let _ = tx.send(TunnelState::ProcessStarted).await;
            let _ = tx.send(TunnelState::Connected).await;
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
        let _ = self.done.send_replace(true);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_06_tunnel_dies_while_connected() {
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let provider = start_provider(broker.clone(), 42).await;

    let slot: Arc<Mutex<Option<Arc<DroppableConnection>>>> = Arc::new(Mutex::new(None));
    let creator_slot = slot.clone();
    let creator: ConnectionCreator = Arc::new(move |_, state_tx, stats_tx| {
        let connection = Arc::new(DroppableConnection {
            state_tx: Mutex::new(Some(state_tx)),
            _stats_tx: stats_tx,
            done: watch::channel(false).0,
        });
        if let Ok(mut guard) = creator_slot.try_lock() {
            *guard = Some(connection.clone());
        }
        Ok(connection as Arc<dyn TunnelConnection>)
    });

    let consumer = start_consumer(broker, creator);
    consumer
        .manager
        .connect(
            consumer.identity.clone(),
            provider.proposal.clone(),
            ConnectParams::default(),
        )
        .await
        .unwrap();
    assert!(consumer.manager.status().await.session().is_some());

    let connection = slot.lock().await.clone().expect("connection captured");
    connection.kill().await;

    let manager = consumer.manager.clone();
    poll_until("manager disconnected after stream death", || {
        let manager = manager.clone();
        async move { manager.status().await.is_not_connected() }
    })
    .await;

    assert!(consumer.kill.disabled.load(Ordering::SeqCst) >= 1);
    let store = provider.store.clone();
    poll_until("provider session cleaned up", || {
        let store = store.clone();
        async move { store.is_empty().await }
    })
    .await;
}

// ── Compensation completeness: a mid-connect failure undoes everything ──────

struct FailingStartConnection {
    _state_tx: mpsc::Sender<TunnelState>,
}

#[async_trait]
impl TunnelConnection for FailingStartConnection {
    async fn session_create_config(&self) -> CoreResult<serde_json::Value> {
        Ok(serde_json::json!({}))
    }

    async fn start(&self, _options: ConnectOptions) -> CoreResult<()> {
        Err(CoreError::Tunnel("engine refused to start".into()))
    }

    async fn wait(&self) -> CoreResult<()> {
        Ok(())
    }

    async fn stop(&self) {}
}

#[tokio::test(flavor = "multi_thread")]
async fn test_07_start_failure_runs_compensation() {
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let provider = start_provider(broker.clone(), 42).await;

    let creator: ConnectionCreator = Arc::new(|_, state_tx, _stats_tx| {
        Ok(Arc::new(FailingStartConnection { _state_tx: state_tx }) as Arc<dyn TunnelConnection>)
    });
    let consumer = start_consumer(broker, creator);

    let result = consumer
        .manager
        .connect(
            consumer.identity.clone(),
            provider.proposal.clone(),
            ConnectParams::default(),
        )
        .await;

    assert!(matches!(result, Err(CoreError::Tunnel(_))));
    assert!(consumer.manager.status().await.is_not_connected());
    assert_eq!(consumer.kill.enabled.load(Ordering::SeqCst), 0);

    let store = provider.store.clone();
    poll_until("session undone on provider", || {
        let store = store.clone();
        async move { store.is_empty().await }
    })
    .await;
}
