//! Provider-side promise processor
//!
//! The validator runs one exchange loop per consumer dialog: a billing
//! ticker that states the amount owed, and a listener that verifies each
//! incoming promise. Promises must carry the successor sequence id and a
//! non-decreasing amount; violations are rejected and, past a threshold,
//! end the dialog.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, warn};

use tollgate_crypto::Address;
use tollgate_market::{PaymentMethod, Proposal};
use tollgate_net::{Dialog, DialogHandler, NetworkResult};
use tollgate_session::{LastPromise, PaymentInfo, PromiseProcessor, SessionResult};

use crate::error::{PaymentError, PaymentResult};
use crate::promise::{BalanceMessage, Promise, PromiseState, TOPIC_BALANCE, TOPIC_PROMISE};

/// Billing behavior knobs
#[derive(Debug, Clone)]
pub struct BillingConfig {
    /// Fallback billing interval when no proposal has been started yet
    pub default_interval: Duration,
    /// Consecutive bad promises tolerated before the dialog is dropped
    pub max_violations: u32,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            default_interval: Duration::from_secs(60),
            max_violations: 3,
        }
    }
}

#[derive(Default)]
struct Exchange {
    owed: u64,
    accepted: PromiseState,
    violations: u32,
}

/// Validates consumer promises and drives balance messages
pub struct PromiseValidator {
    config: BillingConfig,
    pricing: RwLock<Option<PaymentMethod>>,
    running: watch::Sender<bool>,
    exchanges: Arc<Mutex<HashMap<Address, Exchange>>>,
}

impl PromiseValidator {
    /// Create a validator; it starts billing once a proposal is started
    pub fn new(config: BillingConfig) -> Self {
        Self {
            config,
            pricing: RwLock::new(None),
            running: watch::channel(false).0,
            exchanges: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Validate one promise from `consumer` against its exchange state
    ///
    /// Exposed separately so the rules can be exercised without a broker.
    pub async fn process_promise(
        &self,
        dialog_peer: &tollgate_crypto::PublicIdentity,
        promise: &Promise,
    ) -> PaymentResult<()> {
        let mut exchanges = self.exchanges.lock().await;
        let exchange = exchanges.entry(dialog_peer.address).or_default();

        if let Err(e) = validate(dialog_peer, promise, &exchange.accepted) {
            exchange.violations += 1;
            return Err(e);
        }

        exchange.violations = 0;
        exchange.accepted = PromiseState {
            amount: promise.amount,
            sequence_id: promise.sequence_id,
        };
        debug!(
            "accepted promise {} (seq {}) from {}",
            promise.amount, promise.sequence_id, dialog_peer.address
        );
        Ok(())
    }

    /// Violations recorded for a consumer
    pub async fn violations(&self, consumer: Address) -> u32 {
        self.exchanges
            .lock()
            .await
            .get(&consumer)
            .map(|e| e.violations)
            .unwrap_or(0)
    }

    /// Last accepted promise state for a consumer
    pub async fn accepted(&self, consumer: Address) -> PromiseState {
        self.exchanges
            .lock()
            .await
            .get(&consumer)
            .map(|e| e.accepted)
            .unwrap_or_default()
    }

    async fn billing_interval(&self) -> Duration {
        self.pricing
            .read()
            .await
            .as_ref()
            .map(|p| p.interval)
            .unwrap_or(self.config.default_interval)
    }

    async fn price_per_interval(&self) -> u64 {
        self.pricing
            .read()
            .await
            .as_ref()
            .map(|p| p.price_per_interval)
            .unwrap_or(0)
    }
}

fn validate(
    peer: &tollgate_crypto::PublicIdentity,
    promise: &Promise,
    accepted: &PromiseState,
) -> PaymentResult<()> {
    promise.verify(peer)?;

    if promise.sequence_id != accepted.sequence_id + 1 {
        return Err(PaymentError::BadPromise(format!(
            "sequence {} is not the successor of {}",
            promise.sequence_id, accepted.sequence_id
        )));
    }
    if promise.amount < accepted.amount {
        return Err(PaymentError::BadPromise(format!(
            "amount regressed from {} to {}",
            accepted.amount, promise.amount
        )));
    }
    Ok(())
}

#[async_trait]
impl PromiseProcessor for PromiseValidator {
    async fn start(&self, proposal: &Proposal) -> SessionResult<()> {
        *self.pricing.write().await = Some(proposal.payment_method.clone());
        let _ = self.running.send_replace(true);
        info!(
            "promise processor started for proposal {} ({} per {:?})",
            proposal.id, proposal.payment_method.price_per_interval, proposal.payment_method.interval
        );
        Ok(())
    }

    async fn stop(&self) -> SessionResult<()> {
        if self.running.send_replace(false) {
            info!("promise processor stopped");
        }
        Ok(())
    }

    async fn payment_info(&self, consumer: Address) -> Option<PaymentInfo> {
        let exchanges = self.exchanges.lock().await;
        let exchange = exchanges.get(&consumer)?;
        if exchange.accepted.sequence_id == 0 {
            return None;
        }
        Some(PaymentInfo {
            last_promise: LastPromise {
                amount: exchange.accepted.amount,
                sequence_id: exchange.accepted.sequence_id,
            },
        })
    }
}

/// Wraps a shared [`PromiseValidator`] so it can implement the foreign
/// [`DialogHandler`] trait (orphan rules forbid `impl DialogHandler for
/// Arc<PromiseValidator>` directly, since neither `DialogHandler` nor `Arc`
/// is local to this crate).
#[derive(Clone)]
pub struct PromiseValidatorHandler(pub Arc<PromiseValidator>);

/// The validator serves every dialog of its service instance
#[async_trait]
impl DialogHandler for PromiseValidatorHandler {
    async fn handle(&self, dialog: Arc<Dialog>) -> NetworkResult<()> {
        let mut promises = dialog.receive::<Promise>(TOPIC_PROMISE).await?;
        let validator = self.0.clone();
        let peer = *dialog.peer();
        let mut running = validator.running.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(validator.billing_interval().await);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut was_running = *running.borrow();

            loop {
                tokio::select! {
                    promise = promises.recv() => {
                        let Some(promise) = promise else { break };
                        if let Err(e) = validator.process_promise(&peer, &promise).await {
                            warn!("promise from {} rejected: {}", peer.address, e);
                            let violations = validator.violations(peer.address).await;
                            if violations >= validator.config.max_violations {
                                warn!("too many bad promises from {}, closing dialog", peer.address);
                                dialog.close();
                                break;
                            }
                        }
                    }
                    _ = ticker.tick() => {
                        if !*running.borrow() {
                            continue;
                        }
                        let price = validator.price_per_interval().await;
                        let message = {
                            let mut exchanges = validator.exchanges.lock().await;
                            let exchange = exchanges.entry(peer.address).or_default();
                            exchange.owed += price;
                            BalanceMessage {
                                sequence_id: exchange.accepted.sequence_id + 1,
                                amount: exchange.owed,
                            }
                        };
                        if let Err(e) = dialog.send(TOPIC_BALANCE, &message).await {
                            debug!("balance send to {} failed: {}", peer.address, e);
                        }
                    }
                    _ = running.changed() => {
                        let now_running = *running.borrow();
                        if now_running && !was_running {
                            // Pick up the started proposal's billing interval
                            ticker = tokio::time::interval(validator.billing_interval().await);
                            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                        }
                        was_running = now_running;
                    }
                }
            }
            debug!("promise exchange with {} ended", peer.address);
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tollgate_crypto::Identity;

    fn validator() -> PromiseValidator {
        PromiseValidator::new(BillingConfig::default())
    }

    #[tokio::test]
    async fn test_accepts_monotonic_promises() {
        let v = validator();
        let consumer = Identity::generate();
        let peer = consumer.public();

        for (seq, amount) in [(1u64, 10u64), (2, 20), (3, 20)] {
            let promise = Promise::issue(&consumer, amount, seq).unwrap();
            v.process_promise(&peer, &promise).await.unwrap();
        }

        let accepted = v.accepted(consumer.address()).await;
        assert_eq!(accepted.sequence_id, 3);
        assert_eq!(accepted.amount, 20);
    }

    #[tokio::test]
    async fn test_replayed_sequence_rejected() {
        let v = validator();
        let consumer = Identity::generate();
        let peer = consumer.public();

        // Sequence {1, 2, 2, 3}: the replayed 2 is rejected, 3 accepted
        let p1 = Promise::issue(&consumer, 10, 1).unwrap();
        let p2 = Promise::issue(&consumer, 20, 2).unwrap();
        let p2_replay = Promise::issue(&consumer, 25, 2).unwrap();
        let p3 = Promise::issue(&consumer, 30, 3).unwrap();

        v.process_promise(&peer, &p1).await.unwrap();
        v.process_promise(&peer, &p2).await.unwrap();
        let replay = v.process_promise(&peer, &p2_replay).await;
        assert!(matches!(replay, Err(PaymentError::BadPromise(_))));
        v.process_promise(&peer, &p3).await.unwrap();

        assert_eq!(v.accepted(consumer.address()).await.sequence_id, 3);
    }

    #[tokio::test]
    async fn test_regressed_amount_rejected() {
        let v = validator();
        let consumer = Identity::generate();
        let peer = consumer.public();

        let p1 = Promise::issue(&consumer, 100, 1).unwrap();
        v.process_promise(&peer, &p1).await.unwrap();

        let p2 = Promise::issue(&consumer, 50, 2).unwrap();
        let result = v.process_promise(&peer, &p2).await;
        assert!(matches!(result, Err(PaymentError::BadPromise(_))));
        assert_eq!(v.violations(consumer.address()).await, 1);
    }

    #[tokio::test]
    async fn test_forged_signature_rejected() {
        let v = validator();
        let consumer = Identity::generate();
        let imposter = Identity::generate();

        // Signed by the imposter but claimed as the consumer's
        let promise = Promise::issue(&imposter, 10, 1).unwrap();
        let result = v.process_promise(&consumer.public(), &promise).await;
        assert!(matches!(result, Err(PaymentError::BadPromise(_))));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let v = validator();
        v.stop().await.unwrap();
        v.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_payment_info_after_acceptance() {
        let v = validator();
        let consumer = Identity::generate();

        assert!(v.payment_info(consumer.address()).await.is_none());

        let promise = Promise::issue(&consumer, 10, 1).unwrap();
        v.process_promise(&consumer.public(), &promise).await.unwrap();

        let info = v.payment_info(consumer.address()).await.unwrap();
        assert_eq!(info.last_promise.sequence_id, 1);
        assert_eq!(info.last_promise.amount, 10);
    }
}
