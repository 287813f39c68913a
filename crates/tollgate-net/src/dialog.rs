//! Authenticated dialogs over the broker
//!
//! A dialog is a private topic pair between two identities. The consumer
//! opens it by sending a signed `dialog-create` request to the provider's
//! contact topic; both ends then exchange enveloped messages on
//! `<dialog>.provider.*` and `<dialog>.consumer.*` subtopics. Signature
//! failures are fatal and close the dialog; broker hiccups surface as
//! retryable transport errors.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, error, info, warn};

use tollgate_crypto::{Identity, PublicIdentity};
use tollgate_market::{Contact, Proposal};

use crate::broker::{Broker, BrokerRequest};
use crate::codec;
use crate::error::{NetworkError, NetworkResult};

/// Capacity for typed per-topic channels handed to dialog consumers
const DIALOG_CHANNEL_CAPACITY: usize = 16;

/// Dialog tuning knobs
#[derive(Debug, Clone)]
pub struct DialogConfig {
    /// How long a request waits for its reply
    pub request_timeout: Duration,
}

impl Default for DialogConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct DialogCreateRequest {
    dialog_topic: String,
}

#[derive(Serialize, Deserialize)]
struct DialogCreateResponse {
    accepted: bool,
    reason: Option<String>,
}

/// One end of an established dialog
pub struct Dialog {
    broker: Arc<dyn Broker>,
    identity: Arc<Identity>,
    peer: PublicIdentity,
    send_prefix: String,
    recv_prefix: String,
    config: DialogConfig,
    closed: watch::Sender<bool>,
}

impl Dialog {
    fn established(
        broker: Arc<dyn Broker>,
        identity: Arc<Identity>,
        peer: PublicIdentity,
        send_prefix: String,
        recv_prefix: String,
        config: DialogConfig,
    ) -> Self {
        Self {
            broker,
            identity,
            peer,
            send_prefix,
            recv_prefix,
            config,
            closed: watch::channel(false).0,
        }
    }

    /// The remote identity this dialog is bound to
    pub fn peer(&self) -> &PublicIdentity {
        &self.peer
    }

    /// Whether the dialog has been closed
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Close the dialog; idempotent. Unblocks all receive loops.
    pub fn close(&self) {
        if !self.closed.send_replace(true) {
            debug!("dialog with {} closed", self.peer.address);
        }
    }

    /// Send a one-way message on a dialog subtopic
    pub async fn send<T: Serialize>(&self, topic: &str, payload: &T) -> NetworkResult<()> {
        if self.is_closed() {
            return Err(NetworkError::DialogClosed);
        }
        let sealed = codec::seal(&self.identity, payload)?;
        self.broker
            .publish(&format!("{}.{}", self.send_prefix, topic), sealed)
            .await
    }

    /// Send a request on a dialog subtopic and await the typed reply
    pub async fn request<T: Serialize, R: DeserializeOwned>(
        &self,
        topic: &str,
        payload: &T,
    ) -> NetworkResult<R> {
        if self.is_closed() {
            return Err(NetworkError::DialogClosed);
        }
        let sealed = codec::seal(&self.identity, payload)?;
        let reply = self
            .broker
            .request(
                &format!("{}.{}", self.send_prefix, topic),
                sealed,
                self.config.request_timeout,
            )
            .await?;
        let (_, body) = codec::open(&reply, Some(self.peer.address))?;
        Ok(body)
    }

    /// Receive one-way messages on a dialog subtopic
    ///
    /// The returned channel yields verified payloads in arrival order and
    /// closes when the dialog closes. A signature failure from the peer
    /// closes the whole dialog.
    pub async fn receive<T>(&self, topic: &str) -> NetworkResult<mpsc::Receiver<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let mut raw = self
            .broker
            .subscribe(&format!("{}.{}", self.recv_prefix, topic))
            .await?;

        let (tx, rx) = mpsc::channel(DIALOG_CHANNEL_CAPACITY);
        let peer = self.peer.address;
        let closed = self.closed.clone();
        let mut closed_rx = self.closed.subscribe();
        let topic = topic.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = closed_rx.changed() => break,
                    msg = raw.recv() => {
                        let Some(data) = msg else { break };
                        match codec::open::<T>(&data, Some(peer)) {
                            Ok((_, body)) => {
                                if tx.send(body).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                error!("dropping dialog with {}: bad message on {}: {}", peer, topic, e);
                                let _ = closed.send_replace(true);
                                break;
                            }
                        }
                    }
                }
            }
        });

        Ok(rx)
    }

    /// Serve requests on a dialog subtopic
    pub async fn receive_requests<T>(
        &self,
        topic: &str,
    ) -> NetworkResult<mpsc::Receiver<DialogRequest<T>>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let mut raw = self
            .broker
            .serve_requests(&format!("{}.{}", self.recv_prefix, topic))
            .await?;

        let (tx, rx) = mpsc::channel(DIALOG_CHANNEL_CAPACITY);
        let peer = self.peer.address;
        let identity = self.identity.clone();
        let closed = self.closed.clone();
        let mut closed_rx = self.closed.subscribe();
        let topic = topic.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = closed_rx.changed() => break,
                    req = raw.recv() => {
                        let Some(req) = req else { break };
                        match codec::open::<T>(&req.data, Some(peer)) {
                            Ok((_, body)) => {
                                let request = DialogRequest {
                                    body,
                                    identity: identity.clone(),
                                    reply: req.reply,
                                };
                                if tx.send(request).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                error!("dropping dialog with {}: bad request on {}: {}", peer, topic, e);
                                let _ = closed.send_replace(true);
                                break;
                            }
                        }
                    }
                }
            }
        });

        Ok(rx)
    }
}

impl Drop for Dialog {
    fn drop(&mut self) {
        self.close();
    }
}

/// A verified incoming dialog request with its reply slot
pub struct DialogRequest<T> {
    /// Decoded request body
    pub body: T,
    identity: Arc<Identity>,
    reply: oneshot::Sender<Bytes>,
}

impl<T> DialogRequest<T> {
    /// Sign and send the reply
    pub fn respond<R: Serialize>(self, reply: &R) -> NetworkResult<()> {
        let sealed = codec::seal(&self.identity, reply)?;
        self.reply
            .send(sealed)
            .map_err(|_| NetworkError::Transport("requester went away".into()))
    }
}

/// Open a dialog to the provider advertised by `proposal`
pub async fn open_dialog(
    broker: Arc<dyn Broker>,
    identity: Arc<Identity>,
    proposal: &Proposal,
) -> NetworkResult<Arc<Dialog>> {
    let contact_topic = proposal
        .primary_contact()
        .and_then(Contact::broker_topic)
        .ok_or_else(|| NetworkError::DialogRejected("proposal has no broker contact".into()))?;

    let mut topic_seed = [0u8; 8];
    rand::rngs::OsRng.fill_bytes(&mut topic_seed);
    let dialog_topic = format!(
        "tollgate.dialog.{}",
        topic_seed.iter().map(|b| format!("{:02x}", b)).collect::<String>()
    );

    let config = DialogConfig::default();
    let sealed = codec::seal(
        &identity,
        &DialogCreateRequest {
            dialog_topic: dialog_topic.clone(),
        },
    )?;
    let reply = broker
        .request(contact_topic, sealed, config.request_timeout)
        .await?;
    let (provider, response): (PublicIdentity, DialogCreateResponse) =
        codec::open(&reply, Some(proposal.provider_id))?;

    if !response.accepted {
        return Err(NetworkError::DialogRejected(
            response.reason.unwrap_or_else(|| "refused by provider".into()),
        ));
    }

    info!("dialog established with provider {}", provider.address);
    Ok(Arc::new(Dialog::established(
        broker,
        identity,
        provider,
        format!("{}.provider", dialog_topic),
        format!("{}.consumer", dialog_topic),
        config,
    )))
}

/// Handler invoked for every accepted incoming dialog
#[async_trait]
pub trait DialogHandler: Send + Sync {
    /// Wire up the dialog's topics; called once per dialog
    async fn handle(&self, dialog: Arc<Dialog>) -> NetworkResult<()>;
}

/// Runs several handlers against the same dialog, in order
pub struct HandlerChain {
    handlers: Vec<Arc<dyn DialogHandler>>,
}

impl HandlerChain {
    pub fn new(handlers: Vec<Arc<dyn DialogHandler>>) -> Self {
        Self { handlers }
    }
}

#[async_trait]
impl DialogHandler for HandlerChain {
    async fn handle(&self, dialog: Arc<Dialog>) -> NetworkResult<()> {
        for handler in &self.handlers {
            handler.handle(dialog.clone()).await?;
        }
        Ok(())
    }
}

/// Provider-side acceptor for incoming dialogs
pub struct DialogWaiter {
    broker: Arc<dyn Broker>,
    identity: Arc<Identity>,
    contact_topic: String,
    config: DialogConfig,
    incoming: Mutex<Option<mpsc::Receiver<BrokerRequest>>>,
    stop: watch::Sender<bool>,
}

impl DialogWaiter {
    /// Create a waiter for (provider identity, service type)
    pub fn new(broker: Arc<dyn Broker>, identity: Arc<Identity>, service_type: &str) -> Self {
        let contact_topic = format!("tollgate.{}.{}", identity.address().to_hex(), service_type);
        Self {
            broker,
            identity,
            contact_topic,
            config: DialogConfig::default(),
            incoming: Mutex::new(None),
            stop: watch::channel(false).0,
        }
    }

    /// Start listening; returns the contact to advertise
    pub async fn start(&self) -> NetworkResult<Contact> {
        let rx = self.broker.serve_requests(&self.contact_topic).await?;
        *self.incoming.lock().await = Some(rx);
        debug!("dialog waiter listening on {}", self.contact_topic);
        Ok(Contact::broker(&self.contact_topic))
    }

    /// Serve incoming dialogs with `handler` until stopped
    pub async fn serve_dialogs(&self, handler: Arc<dyn DialogHandler>) -> NetworkResult<()> {
        let mut incoming = self
            .incoming
            .lock()
            .await
            .take()
            .ok_or_else(|| NetworkError::Transport("dialog waiter not started".into()))?;

        let broker = self.broker.clone();
        let identity = self.identity.clone();
        let config = self.config.clone();
        let mut stop = self.stop.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    req = incoming.recv() => {
                        let Some(req) = req else { break };
                        accept_dialog(&broker, &identity, &config, &handler, req).await;
                    }
                }
            }
            debug!("dialog waiter stopped");
        });

        Ok(())
    }

    /// Stop accepting dialogs; idempotent
    pub fn stop(&self) {
        let _ = self.stop.send_replace(true);
    }
}

async fn accept_dialog(
    broker: &Arc<dyn Broker>,
    identity: &Arc<Identity>,
    config: &DialogConfig,
    handler: &Arc<dyn DialogHandler>,
    req: BrokerRequest,
) {
    let (consumer, create) = match codec::open::<DialogCreateRequest>(&req.data, None) {
        Ok(opened) => opened,
        Err(e) => {
            warn!("rejecting dialog: {}", e);
            let response = DialogCreateResponse {
                accepted: false,
                reason: Some(e.to_string()),
            };
            if let Ok(sealed) = codec::seal(identity, &response) {
                let _ = req.reply.send(sealed);
            }
            return;
        }
    };

    let dialog = Arc::new(Dialog::established(
        broker.clone(),
        identity.clone(),
        consumer,
        format!("{}.consumer", create.dialog_topic),
        format!("{}.provider", create.dialog_topic),
        config.clone(),
    ));

    // Register topic handlers before acknowledging so the consumer's first
    // request cannot race the wiring
    if let Err(e) = handler.handle(dialog.clone()).await {
        error!("dialog handler failed: {}", e);
        dialog.close();
        let response = DialogCreateResponse {
            accepted: false,
            reason: Some("handler failure".into()),
        };
        if let Ok(sealed) = codec::seal(identity, &response) {
            let _ = req.reply.send(sealed);
        }
        return;
    }

    info!("accepted dialog from consumer {}", dialog.peer().address);
    let response = DialogCreateResponse {
        accepted: true,
        reason: None,
    };
    match codec::seal(identity, &response) {
        Ok(sealed) => {
            let _ = req.reply.send(sealed);
        }
        Err(e) => error!("failed to seal dialog acknowledgement: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use tollgate_market::{Location, PaymentMethod};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Echo {
        text: String,
    }

    struct EchoHandler;

    #[async_trait]
    impl DialogHandler for EchoHandler {
        async fn handle(&self, dialog: Arc<Dialog>) -> NetworkResult<()> {
            let mut requests = dialog.receive_requests::<Echo>("echo").await?;
            tokio::spawn(async move {
                while let Some(req) = requests.recv().await {
                    let text = req.body.text.clone();
                    let _ = req.respond(&Echo { text });
                }
            });
            Ok(())
        }
    }

    fn proposal_for(provider: &Identity, contact: Contact) -> Proposal {
        Proposal {
            id: 1,
            provider_id: provider.address(),
            service_type: "noop".to_string(),
            provider_contacts: vec![contact],
            payment_method: PaymentMethod::default(),
            location: Location::default(),
        }
    }

    async fn establish() -> (Arc<Dialog>, Arc<DialogWaiter>) {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let provider = Arc::new(Identity::generate());
        let consumer = Arc::new(Identity::generate());

        let waiter = Arc::new(DialogWaiter::new(broker.clone(), provider.clone(), "noop"));
        let contact = waiter.start().await.unwrap();
        waiter.serve_dialogs(Arc::new(EchoHandler)).await.unwrap();

        let proposal = proposal_for(&provider, contact);
        let dialog = open_dialog(broker, consumer, &proposal).await.unwrap();
        (dialog, waiter)
    }

    #[tokio::test]
    async fn test_open_dialog_and_request() {
        let (dialog, _waiter) = establish().await;

        let reply: Echo = dialog
            .request(
                "echo",
                &Echo {
                    text: "toll".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(reply.text, "toll");
    }

    #[tokio::test]
    async fn test_open_dialog_without_contact_fails() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let provider = Identity::generate();
        let consumer = Arc::new(Identity::generate());

        let mut proposal = proposal_for(&provider, Contact::broker("unused"));
        proposal.provider_contacts.clear();

        let result = open_dialog(broker, consumer, &proposal).await;
        assert!(matches!(result, Err(NetworkError::DialogRejected(_))));
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (dialog, _waiter) = establish().await;

        dialog.close();
        dialog.close(); // idempotent

        let result = dialog
            .send(
                "echo",
                &Echo {
                    text: "late".to_string(),
                },
            )
            .await;
        assert!(matches!(result, Err(NetworkError::DialogClosed)));
    }

    #[tokio::test]
    async fn test_one_way_messages_arrive_in_order() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let provider = Arc::new(Identity::generate());
        let consumer = Arc::new(Identity::generate());

        // Handler that forwards received one-way messages to the test
        struct Collect(mpsc::Sender<Echo>);

        #[async_trait]
        impl DialogHandler for Collect {
            async fn handle(&self, dialog: Arc<Dialog>) -> NetworkResult<()> {
                let mut inbox = dialog.receive::<Echo>("note").await?;
                let out = self.0.clone();
                tokio::spawn(async move {
                    while let Some(msg) = inbox.recv().await {
                        let _ = out.send(msg).await;
                    }
                });
                Ok(())
            }
        }

        let (seen_tx, mut seen_rx) = mpsc::channel(16);
        let waiter = DialogWaiter::new(broker.clone(), provider.clone(), "noop");
        let contact = waiter.start().await.unwrap();
        waiter
            .serve_dialogs(Arc::new(Collect(seen_tx)))
            .await
            .unwrap();

        let proposal = proposal_for(&provider, contact);
        let dialog = open_dialog(broker, consumer, &proposal).await.unwrap();

        for i in 0..5 {
            dialog
                .send(
                    "note",
                    &Echo {
                        text: format!("n{}", i),
                    },
                )
                .await
                .unwrap();
        }

        for i in 0..5 {
            let msg = seen_rx.recv().await.unwrap();
            assert_eq!(msg.text, format!("n{}", i));
        }
    }
}
