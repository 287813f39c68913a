//! Consumer-side payment issuer
//!
//! One task drains the balance channel fed by the dialog and answers each
//! monotonic balance message with a signed promise. Transport errors are
//! retried twice with a short backoff; a third failure is fatal and the
//! connection manager reacts by disconnecting.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use tollgate_crypto::{Address, Identity};
use tollgate_net::{Dialog, NetworkError, NetworkResult};

use crate::error::{PaymentError, PaymentResult};
use crate::promise::{BalanceMessage, Promise, PromiseState, TOPIC_PROMISE};

/// Where issued promises go; `Dialog` in production, a double in tests
#[async_trait]
pub trait PromiseSink: Send + Sync {
    async fn send_promise(&self, promise: &Promise) -> NetworkResult<()>;
}

#[async_trait]
impl PromiseSink for Dialog {
    async fn send_promise(&self, promise: &Promise) -> NetworkResult<()> {
        self.send(TOPIC_PROMISE, promise).await
    }
}

/// Issuer tuning knobs
#[derive(Debug, Clone)]
pub struct IssuerConfig {
    /// Additional attempts after a failed promise send
    pub send_retries: u32,
    /// Backoff between attempts
    pub retry_backoff: Duration,
}

impl Default for IssuerConfig {
    fn default() -> Self {
        Self {
            send_retries: 2,
            retry_backoff: Duration::from_millis(200),
        }
    }
}

/// Signs promises matching the provider's balance messages
pub struct PaymentIssuer {
    identity: Arc<Identity>,
    provider: Address,
    sink: Arc<dyn PromiseSink>,
    config: IssuerConfig,
    state: Mutex<PromiseState>,
    message_rx: Mutex<Option<mpsc::Receiver<BalanceMessage>>>,
    stop: watch::Sender<bool>,
}

impl PaymentIssuer {
    /// Build an issuer from the session's initial promise state
    pub fn new(
        initial_state: PromiseState,
        message_rx: mpsc::Receiver<BalanceMessage>,
        sink: Arc<dyn PromiseSink>,
        identity: Arc<Identity>,
        provider: Address,
        config: IssuerConfig,
    ) -> Self {
        Self {
            identity,
            provider,
            sink,
            config,
            state: Mutex::new(initial_state),
            message_rx: Mutex::new(Some(message_rx)),
            stop: watch::channel(false).0,
        }
    }

    /// Last promise state the issuer has signed
    pub async fn state(&self) -> PromiseState {
        *self.state.lock().await
    }

    /// Run the issuing loop until stopped or a fatal send failure
    pub async fn start(&self) -> PaymentResult<()> {
        let mut message_rx = self
            .message_rx
            .lock()
            .await
            .take()
            .ok_or(PaymentError::AlreadyStarted)?;
        let mut stop_rx = self.stop.subscribe();
        if *stop_rx.borrow() {
            return Ok(());
        }

        debug!("payment issuer started for provider {}", self.provider);
        loop {
            tokio::select! {
                _ = stop_rx.changed() => {
                    debug!("payment issuer stopped");
                    return Ok(());
                }
                message = message_rx.recv() => {
                    let Some(message) = message else {
                        debug!("balance channel closed, payment issuer exiting");
                        return Ok(());
                    };
                    self.handle_balance(message).await?;
                }
            }
        }
    }

    /// Stop the loop; idempotent
    pub fn stop(&self) {
        let _ = self.stop.send_replace(true);
    }

    async fn handle_balance(&self, message: BalanceMessage) -> PaymentResult<()> {
        let mut state = self.state.lock().await;

        if message.sequence_id <= state.sequence_id {
            debug!(
                "ignoring regressed balance sequence {} (last signed {})",
                message.sequence_id, state.sequence_id
            );
            return Ok(());
        }
        if message.amount < state.amount {
            warn!(
                "ignoring balance asking for less than already promised ({} < {})",
                message.amount, state.amount
            );
            return Ok(());
        }

        let promise = Promise::issue(&self.identity, message.amount, message.sequence_id)?;
        self.send_with_retry(&promise).await?;

        state.amount = promise.amount;
        state.sequence_id = promise.sequence_id;
        debug!(
            "promised {} (seq {}) to provider {}",
            promise.amount, promise.sequence_id, self.provider
        );
        Ok(())
    }

    async fn send_with_retry(&self, promise: &Promise) -> PaymentResult<()> {
        let attempts = self.config.send_retries + 1;
        let mut last_error = None;

        for attempt in 0..attempts {
            match self.sink.send_promise(promise).await {
                Ok(()) => return Ok(()),
                Err(NetworkError::Transport(reason)) => {
                    warn!(
                        "promise send attempt {}/{} failed: {}",
                        attempt + 1,
                        attempts,
                        reason
                    );
                    last_error = Some(NetworkError::Transport(reason));
                    tokio::time::sleep(self.config.retry_backoff).await;
                }
                // Anything but a transport hiccup is immediately fatal
                Err(e) => return Err(e.into()),
            }
        }

        info!("promise send failed after {} attempts, giving up", attempts);
        match last_error {
            Some(e) => Err(e.into()),
            // attempts is always at least one
            None => Ok(()),
        }
    }
}
