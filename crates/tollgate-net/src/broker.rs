//! Pub/sub broker abstraction
//!
//! The dialog transport only needs publish, subscribe and request/reply
//! against string topics. `MemoryBroker` is the in-process implementation
//! used by tests and single-process deployments; a networked broker client
//! implements the same trait.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, trace};

use crate::error::{NetworkError, NetworkResult};

/// Per-subscription channel capacity
const SUBSCRIPTION_CAPACITY: usize = 64;

/// An incoming request with its reply slot
pub struct BrokerRequest {
    /// Raw request payload
    pub data: Bytes,
    /// Reply slot; dropping it answers the requester with a transport error
    pub reply: oneshot::Sender<Bytes>,
}

/// Minimal pub/sub broker contract
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish a message to every subscriber of `topic`
    async fn publish(&self, topic: &str, data: Bytes) -> NetworkResult<()>;

    /// Subscribe to `topic`; messages arrive in publish order
    async fn subscribe(&self, topic: &str) -> NetworkResult<mpsc::Receiver<Bytes>>;

    /// Send a request to the responder on `topic` and await the reply
    async fn request(&self, topic: &str, data: Bytes, timeout: Duration) -> NetworkResult<Bytes>;

    /// Register as the responder for requests on `topic`
    async fn serve_requests(&self, topic: &str) -> NetworkResult<mpsc::Receiver<BrokerRequest>>;
}

#[derive(Default)]
struct Topics {
    subscribers: HashMap<String, Vec<mpsc::Sender<Bytes>>>,
    responders: HashMap<String, Vec<mpsc::Sender<BrokerRequest>>>,
}

/// In-process broker backed by tokio channels
#[derive(Default)]
pub struct MemoryBroker {
    topics: Mutex<Topics>,
}

impl MemoryBroker {
    /// Create a new empty broker
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, topic: &str, data: Bytes) -> NetworkResult<()> {
        // Snapshot senders so the lock is not held across sends
        let senders = {
            let mut topics = self.topics.lock().await;
            if let Some(subs) = topics.subscribers.get_mut(topic) {
                subs.retain(|s| !s.is_closed());
                subs.clone()
            } else {
                Vec::new()
            }
        };

        trace!("publish {} -> {} subscriber(s)", topic, senders.len());
        for sender in senders {
            // Bounded channel: a saturated subscriber back-pressures the publisher
            let _ = sender.send(data.clone()).await;
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> NetworkResult<mpsc::Receiver<Bytes>> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let mut topics = self.topics.lock().await;
        topics
            .subscribers
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        debug!("subscribed to {}", topic);
        Ok(rx)
    }

    async fn request(&self, topic: &str, data: Bytes, timeout: Duration) -> NetworkResult<Bytes> {
        let responder = {
            let mut topics = self.topics.lock().await;
            let responders = topics
                .responders
                .get_mut(topic)
                .ok_or_else(|| NetworkError::Transport(format!("no responder on {}", topic)))?;
            responders.retain(|s| !s.is_closed());
            responders
                .first()
                .cloned()
                .ok_or_else(|| NetworkError::Transport(format!("no responder on {}", topic)))?
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        responder
            .send(BrokerRequest {
                data,
                reply: reply_tx,
            })
            .await
            .map_err(|_| NetworkError::Transport(format!("responder on {} went away", topic)))?;

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(NetworkError::Transport(format!(
                "request on {} dropped without reply",
                topic
            ))),
            Err(_) => Err(NetworkError::Transport(format!(
                "request on {} timed out",
                topic
            ))),
        }
    }

    async fn serve_requests(&self, topic: &str) -> NetworkResult<mpsc::Receiver<BrokerRequest>> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let mut topics = self.topics.lock().await;
        topics
            .responders
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        debug!("serving requests on {}", topic);
        Ok(rx)
    }
}
