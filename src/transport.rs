//! Narrow seam to the broker transport.
//!
//! The engine consumes publish and subscribe primitives with retained-message
//! and message-expiry support; it never implements the wire protocol itself.
//! [`MemoryBroker`] provides an in-process implementation of the same
//! contract for tests and embeddings.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::time::{Duration, Instant};
use tracing::debug;

use crate::topic::matches;

const INBOUND_CHANNEL_CAPACITY: usize = 256;

/// Error surfaced by transport operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,
    #[error("transport inbound channel closed")]
    ChannelClosed,
}

/// Per-publish options understood by the broker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishOptions {
    /// Retain the message so late subscribers receive it immediately.
    #[serde(default)]
    pub retain: bool,
    /// Broker-side expiry, after which retained state self-clears.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_expiry_secs: Option<u32>,
}

impl PublishOptions {
    /// Options for a retained message with a bounded expiry.
    pub fn retained(message_expiry_secs: u32) -> Self {
        Self {
            retain: true,
            message_expiry_secs: Some(message_expiry_secs),
        }
    }
}

/// Message delivered to a subscribed client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: String,
    /// True when the message was replayed from the broker's retained store.
    pub retained: bool,
}

/// Contract every broker client implements for this crate.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Publishes one payload, honoring retain and expiry options.
    async fn publish(
        &self,
        topic: &str,
        payload: &str,
        options: PublishOptions,
    ) -> Result<(), TransportError>;

    /// Adds subscription filters; retained matches are replayed immediately.
    async fn subscribe(&self, filters: &[String]) -> Result<(), TransportError>;

    /// Removes subscription filters.
    async fn unsubscribe(&self, filters: &[String]) -> Result<(), TransportError>;

    /// Stream of messages matching this client's subscriptions.
    ///
    /// Create the receiver before subscribing, otherwise retained replays
    /// are lost.
    fn inbound(&self) -> broadcast::Receiver<InboundMessage>;

    /// Connection readiness; factories gate proxy construction on this.
    fn readiness(&self) -> watch::Receiver<bool>;

    /// Tears the connection down. The default implementation is a no-op.
    async fn disconnect(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

struct RetainedMessage {
    payload: String,
    expires_at: Option<Instant>,
}

struct ClientState {
    name: String,
    filters: Mutex<Vec<String>>,
    sender: broadcast::Sender<InboundMessage>,
    ready_tx: watch::Sender<bool>,
}

/// In-process broker with retained-message and expiry semantics.
///
/// Every [`MemoryTransport`] handed out by [`MemoryBroker::client`] shares
/// the same retained store and sees every other client's publishes, which is
/// enough to exercise the full handover protocol without a real broker.
#[derive(Default)]
pub struct MemoryBroker {
    clients: Mutex<Vec<Weak<ClientState>>>,
    retained: Mutex<BTreeMap<String, RetainedMessage>>,
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Creates a connected client attached to this broker.
    pub fn client(self: &Arc<Self>, name: impl Into<String>) -> MemoryTransport {
        let (ready_tx, _) = watch::channel(true);
        let (sender, _) = broadcast::channel(INBOUND_CHANNEL_CAPACITY);
        let state = Arc::new(ClientState {
            name: name.into(),
            filters: Mutex::new(Vec::new()),
            sender,
            ready_tx,
        });
        self.clients.lock().unwrap().push(Arc::downgrade(&state));
        MemoryTransport {
            broker: Arc::clone(self),
            state,
        }
    }

    /// Retained payload currently stored for a topic, if any.
    pub fn retained_payload(&self, topic: &str) -> Option<String> {
        self.prune_expired();
        self.retained
            .lock()
            .unwrap()
            .get(topic)
            .map(|r| r.payload.clone())
    }

    fn prune_expired(&self) {
        let now = Instant::now();
        self.retained
            .lock()
            .unwrap()
            .retain(|_, r| r.expires_at.map(|at| at > now).unwrap_or(true));
    }

    fn deliver(&self, message: &InboundMessage) {
        let mut clients = self.clients.lock().unwrap();
        clients.retain(|weak| weak.strong_count() > 0);
        for weak in clients.iter() {
            let Some(client) = weak.upgrade() else {
                continue;
            };
            let matched = client
                .filters
                .lock()
                .unwrap()
                .iter()
                .any(|filter| matches(filter, &message.topic));
            if matched {
                let _ = client.sender.send(message.clone());
            }
        }
    }

    fn store_retained(&self, topic: &str, payload: &str, options: &PublishOptions) {
        let mut retained = self.retained.lock().unwrap();
        if payload.is_empty() {
            // An empty retained payload clears the slot, broker-style.
            retained.remove(topic);
            return;
        }
        let expires_at = options
            .message_expiry_secs
            .map(|secs| Instant::now() + Duration::from_secs(u64::from(secs)));
        retained.insert(
            topic.to_string(),
            RetainedMessage {
                payload: payload.to_string(),
                expires_at,
            },
        );
    }
}

/// Client handle onto a [`MemoryBroker`].
pub struct MemoryTransport {
    broker: Arc<MemoryBroker>,
    state: Arc<ClientState>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(
        &self,
        topic: &str,
        payload: &str,
        options: PublishOptions,
    ) -> Result<(), TransportError> {
        if !*self.state.ready_tx.borrow() {
            return Err(TransportError::NotConnected);
        }
        self.broker.prune_expired();
        if options.retain {
            self.broker.store_retained(topic, payload, &options);
        }
        debug!(client = %self.state.name, topic, retain = options.retain, "memory publish");
        self.broker.deliver(&InboundMessage {
            topic: topic.to_string(),
            payload: payload.to_string(),
            retained: false,
        });
        Ok(())
    }

    async fn subscribe(&self, filters: &[String]) -> Result<(), TransportError> {
        {
            let mut current = self.state.filters.lock().unwrap();
            for filter in filters {
                if !current.contains(filter) {
                    current.push(filter.clone());
                }
            }
        }
        self.broker.prune_expired();
        let retained = self.broker.retained.lock().unwrap();
        for (topic, message) in retained.iter() {
            if filters.iter().any(|filter| matches(filter, topic)) {
                let _ = self.state.sender.send(InboundMessage {
                    topic: topic.clone(),
                    payload: message.payload.clone(),
                    retained: true,
                });
            }
        }
        Ok(())
    }

    async fn unsubscribe(&self, filters: &[String]) -> Result<(), TransportError> {
        let mut current = self.state.filters.lock().unwrap();
        current.retain(|existing| !filters.contains(existing));
        Ok(())
    }

    fn inbound(&self) -> broadcast::Receiver<InboundMessage> {
        self.state.sender.subscribe()
    }

    fn readiness(&self) -> watch::Receiver<bool> {
        self.state.ready_tx.subscribe()
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let _ = self.state.ready_tx.send(false);
        Ok(())
    }
}
