//! Active/passive handover between redundant processes sharing one logical
//! topic namespace.
//!
//! A two-party leader-lease protocol over retained status topics: the active
//! instance refreshes an expiring heartbeat, a passive instance watches it
//! and takes over according to its configured policy. There is no quorum;
//! simultaneous broker loss on both sides can produce two actives, which the
//! design accepts.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::time::{interval, sleep, timeout_at, Duration, Instant};
use tracing::{info, warn};

use crate::config::RedundancyConfig;
use crate::envelope::now_epoch_ms;
use crate::proxy::{ProxySnapshots, SharedProxyRegistry};
use crate::queue::HandoverSnapshot;
use crate::topic::{matches, TopicBuilder, TopicError};
use crate::transport::{InboundMessage, PublishOptions, Transport, TransportError};

/// Startup policy applied when a peer already holds the active role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedundancyMode {
    /// Become active even when a peer is active; duplicates are possible.
    Force,
    /// Request a coordinated takeover from the active peer.
    Handover,
    /// Stay passive until the peer's heartbeat goes silent.
    Wait,
}

/// Coordinator lifecycle state for one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoverState {
    Uninitialized,
    Waiting,
    Active,
    Passive,
}

/// Which of a proxy's two queues a snapshot belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    Publisher,
    Subscriber,
}

/// JSON messages exchanged on handover topics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HandoverMessage {
    /// Takeover request published to the active peer's handover topic.
    Request {
        process_name: String,
        response_topic: String,
    },
    /// One queue's reconciliation snapshot from the stepping-down side.
    Snapshot {
        process_name: String,
        proxy_name: String,
        queue: QueueKind,
        reference_hash: String,
        batch_size: usize,
    },
    /// All snapshots have been published; the requester may take over.
    Fin { process_name: String },
    /// The requester is active; the stepped-down side may retire.
    Ack { process_name: String },
}

/// Retained payload refreshed on the active topic while a process leads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveHeartbeat {
    pub process_name: String,
    pub timestamp_ms: u64,
}

/// Error terminating the coordinator loop.
#[derive(Debug, Error)]
pub enum HandoverError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Topic(#[from] TopicError),
    #[error("transport inbound stream closed")]
    InboundClosed,
}

struct CoordinatorInner {
    process_name: String,
    topics: TopicBuilder,
    transport: Arc<dyn Transport>,
    proxies: SharedProxyRegistry,
    config: RedundancyConfig,
    state_tx: watch::Sender<HandoverState>,
}

/// Drives role transitions for every proxy registered with the process.
pub struct HandoverCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl Clone for HandoverCoordinator {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

type SnapshotMap = BTreeMap<(String, QueueKind), HandoverSnapshot>;

impl HandoverCoordinator {
    pub fn new(
        process_name: impl Into<String>,
        topics: TopicBuilder,
        transport: Arc<dyn Transport>,
        proxies: SharedProxyRegistry,
        config: RedundancyConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(HandoverState::Uninitialized);
        Self {
            inner: Arc::new(CoordinatorInner {
                process_name: process_name.into(),
                topics,
                transport,
                proxies,
                config,
                state_tx,
            }),
        }
    }

    pub fn state(&self) -> HandoverState {
        *self.inner.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<HandoverState> {
        self.inner.state_tx.subscribe()
    }

    /// Runs the full lifecycle: startup observation, role acquisition, and
    /// active duty until a takeover request retires this instance.
    pub async fn run(&self) -> Result<(), HandoverError> {
        let inner = &self.inner;
        // The receiver must exist before subscribing so retained replays of
        // a peer's heartbeat are not lost.
        let mut inbound = inner.transport.inbound();
        inner
            .transport
            .subscribe(&[
                inner.topics.wildcard_active_topic(),
                inner.topics.handover_topic(),
            ])
            .await?;
        self.set_state(HandoverState::Waiting);

        match self.observe_peer(&mut inbound).await? {
            None => {
                info!(
                    process = %inner.process_name,
                    "no active peer observed within the startup window"
                );
                self.activate(&SnapshotMap::new());
            }
            Some(peer_base) => match inner.config.mode {
                RedundancyMode::Force => {
                    warn!(
                        process = %inner.process_name,
                        peer = %peer_base,
                        "peer is active, force starting anyway; duplicate messages are possible"
                    );
                    self.activate(&SnapshotMap::new());
                }
                RedundancyMode::Handover => {
                    self.request_takeover(&peer_base, &mut inbound).await?;
                }
                RedundancyMode::Wait => {
                    self.set_state(HandoverState::Passive);
                    self.wait_for_peer_loss(&mut inbound).await?;
                    info!(
                        process = %inner.process_name,
                        peer = %peer_base,
                        "peer heartbeat lost, taking over"
                    );
                    self.activate(&SnapshotMap::new());
                }
            },
        }

        self.active_duty(&mut inbound).await
    }

    fn set_state(&self, state: HandoverState) {
        self.inner.state_tx.send_replace(state);
    }

    fn is_peer_heartbeat(&self, message: &InboundMessage) -> bool {
        !message.payload.is_empty()
            && message.topic != self.inner.topics.active_topic()
            && matches(&self.inner.topics.wildcard_active_topic(), &message.topic)
    }

    /// Watches the wildcard active topic for a bounded startup window.
    async fn observe_peer(
        &self,
        inbound: &mut broadcast::Receiver<InboundMessage>,
    ) -> Result<Option<String>, HandoverError> {
        let deadline = Instant::now() + Duration::from_millis(self.inner.config.active_timeout_ms);
        loop {
            match timeout_at(deadline, inbound.recv()).await {
                Err(_) => return Ok(None),
                Ok(Ok(message)) => {
                    if self.is_peer_heartbeat(&message) {
                        info!(
                            process = %self.inner.process_name,
                            topic = %message.topic,
                            "another process is active"
                        );
                        return Ok(Some(TopicBuilder::extract_base_topic(&message.topic)?));
                    }
                }
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return Err(HandoverError::InboundClosed)
                }
            }
        }
    }

    /// Publishes a takeover request and waits for the peer to step down.
    async fn request_takeover(
        &self,
        peer_base: &str,
        inbound: &mut broadcast::Receiver<InboundMessage>,
    ) -> Result<(), HandoverError> {
        let inner = &self.inner;
        self.set_state(HandoverState::Passive);
        info!(
            process = %inner.process_name,
            delay_ms = inner.config.request_delay_ms,
            "requesting handover after delay"
        );
        sleep(Duration::from_millis(inner.config.request_delay_ms)).await;

        let peer_handover = format!("{peer_base}handover");
        let request = HandoverMessage::Request {
            process_name: inner.process_name.clone(),
            response_topic: inner.topics.handover_topic(),
        };
        inner
            .transport
            .publish(&peer_handover, &encode(&request), PublishOptions::default())
            .await?;

        let mut snapshots = SnapshotMap::new();
        loop {
            let message = match inbound.recv().await {
                Ok(message) => message,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(HandoverError::InboundClosed)
                }
            };
            if message.topic != inner.topics.handover_topic() {
                continue;
            }
            let Some(decoded) = decode(&message.payload) else {
                continue;
            };
            match decoded {
                HandoverMessage::Snapshot {
                    process_name,
                    proxy_name,
                    queue,
                    reference_hash,
                    batch_size,
                } if process_name != inner.process_name => {
                    snapshots.insert(
                        (proxy_name, queue),
                        HandoverSnapshot {
                            reference_hash,
                            batch_size,
                        },
                    );
                }
                HandoverMessage::Fin { process_name }
                    if process_name != inner.process_name =>
                {
                    info!(
                        process = %inner.process_name,
                        peer = %process_name,
                        snapshots = snapshots.len(),
                        "handover fin received, taking over"
                    );
                    self.activate(&snapshots);
                    let ack = HandoverMessage::Ack {
                        process_name: inner.process_name.clone(),
                    };
                    inner
                        .transport
                        .publish(&peer_handover, &encode(&ack), PublishOptions::default())
                        .await?;
                    return Ok(());
                }
                _ => {}
            }
        }
    }

    /// Stays passive until the peer heartbeat goes silent for the timeout.
    async fn wait_for_peer_loss(
        &self,
        inbound: &mut broadcast::Receiver<InboundMessage>,
    ) -> Result<(), HandoverError> {
        let silence = Duration::from_millis(self.inner.config.active_timeout_ms);
        let mut deadline = Instant::now() + silence;
        loop {
            match timeout_at(deadline, inbound.recv()).await {
                Err(_) => return Ok(()),
                Ok(Ok(message)) => {
                    if self.is_peer_heartbeat(&message) {
                        deadline = Instant::now() + silence;
                    }
                }
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return Err(HandoverError::InboundClosed)
                }
            }
        }
    }

    /// Resumes every registered proxy, then marks this process active.
    fn activate(&self, snapshots: &SnapshotMap) {
        let proxies = self.inner.proxies.lock().unwrap().clone();
        for registered in &proxies {
            let name = registered.proxy.instance_name().to_string();
            let publisher = snapshots.get(&(name.clone(), QueueKind::Publisher)).cloned();
            let subscriber = snapshots
                .get(&(name.clone(), QueueKind::Subscriber))
                .cloned();
            if publisher.is_none() && subscriber.is_none() {
                registered.proxy.resume(None);
            } else {
                let snapshots = ProxySnapshots {
                    proxy_name: name,
                    publisher: publisher.unwrap_or_else(HandoverSnapshot::empty),
                    subscriber: subscriber.unwrap_or_else(HandoverSnapshot::empty),
                };
                registered.proxy.resume(Some(&snapshots));
            }
        }
        self.set_state(HandoverState::Active);
        info!(
            process = %self.inner.process_name,
            proxies = proxies.len(),
            "process is active"
        );
    }

    /// Refreshes the heartbeat and serves takeover requests until retired.
    async fn active_duty(
        &self,
        inbound: &mut broadcast::Receiver<InboundMessage>,
    ) -> Result<(), HandoverError> {
        let inner = &self.inner;
        let mut heartbeat = interval(Duration::from_millis(inner.config.heartbeat_interval_ms));
        loop {
            let request = tokio::select! {
                _ = heartbeat.tick() => {
                    self.publish_heartbeat().await?;
                    None
                }
                received = inbound.recv() => match received {
                    Ok(message) => self.route_active_message(&message),
                    Err(broadcast::error::RecvError::Lagged(_)) => None,
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(HandoverError::InboundClosed)
                    }
                }
            };
            if let Some((requester, response_topic)) = request {
                info!(
                    process = %inner.process_name,
                    requester = %requester,
                    "handover request received, stepping down"
                );
                self.step_down(&response_topic).await?;
                self.await_ack(inbound).await;
                info!(
                    process = %inner.process_name,
                    "handover complete, remaining passive"
                );
                return Ok(());
            }
        }
    }

    fn route_active_message(&self, message: &InboundMessage) -> Option<(String, String)> {
        if message.topic != self.inner.topics.handover_topic() {
            return None;
        }
        match decode(&message.payload)? {
            HandoverMessage::Request {
                process_name,
                response_topic,
            } if process_name != self.inner.process_name => Some((process_name, response_topic)),
            _ => None,
        }
    }

    async fn publish_heartbeat(&self) -> Result<(), HandoverError> {
        let inner = &self.inner;
        let heartbeat = ActiveHeartbeat {
            process_name: inner.process_name.clone(),
            timestamp_ms: now_epoch_ms(),
        };
        let payload =
            serde_json::to_string(&heartbeat).expect("heartbeat serialization must succeed");
        inner
            .transport
            .publish(
                &inner.topics.active_topic(),
                &payload,
                PublishOptions::retained(inner.config.status_expiry_secs),
            )
            .await?;
        Ok(())
    }

    /// Suspends every proxy, publishes their snapshots and a fin, and clears
    /// the retained active marker.
    async fn step_down(&self, response_topic: &str) -> Result<(), HandoverError> {
        let inner = &self.inner;
        let proxies = inner.proxies.lock().unwrap().clone();
        let window = inner.config.handover_window;
        let snapshot_options = PublishOptions::retained(inner.config.status_expiry_secs);
        for registered in &proxies {
            let snapshots = registered.proxy.step_down(window);
            for (queue, snapshot) in [
                (QueueKind::Publisher, &snapshots.publisher),
                (QueueKind::Subscriber, &snapshots.subscriber),
            ] {
                let message = HandoverMessage::Snapshot {
                    process_name: inner.process_name.clone(),
                    proxy_name: snapshots.proxy_name.clone(),
                    queue,
                    reference_hash: snapshot.reference_hash.clone(),
                    batch_size: snapshot.batch_size,
                };
                inner
                    .transport
                    .publish(response_topic, &encode(&message), snapshot_options.clone())
                    .await?;
            }
        }
        let fin = HandoverMessage::Fin {
            process_name: inner.process_name.clone(),
        };
        inner
            .transport
            .publish(response_topic, &encode(&fin), PublishOptions::default())
            .await?;
        // An empty retained payload clears the lease marker immediately
        // instead of waiting out the message expiry.
        inner
            .transport
            .publish(
                &inner.topics.active_topic(),
                "",
                PublishOptions {
                    retain: true,
                    message_expiry_secs: None,
                },
            )
            .await?;
        self.set_state(HandoverState::Passive);
        Ok(())
    }

    /// Waits briefly for the requester's ack; absence is only logged.
    async fn await_ack(&self, inbound: &mut broadcast::Receiver<InboundMessage>) {
        let deadline = Instant::now() + Duration::from_millis(self.inner.config.active_timeout_ms);
        loop {
            match timeout_at(deadline, inbound.recv()).await {
                Err(_) => {
                    warn!(
                        process = %self.inner.process_name,
                        "no handover ack received within the wait window"
                    );
                    return;
                }
                Ok(Ok(message)) => {
                    if message.topic != self.inner.topics.handover_topic() {
                        continue;
                    }
                    if let Some(HandoverMessage::Ack { process_name }) = decode(&message.payload) {
                        if process_name != self.inner.process_name {
                            info!(
                                process = %self.inner.process_name,
                                peer = %process_name,
                                "handover ack received"
                            );
                            return;
                        }
                    }
                }
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) => return,
            }
        }
    }
}

fn encode(message: &HandoverMessage) -> String {
    serde_json::to_string(message).expect("handover message serialization must succeed")
}

fn decode(payload: &str) -> Option<HandoverMessage> {
    match serde_json::from_str(payload) {
        Ok(message) => Some(message),
        Err(err) => {
            warn!(error = %err, "ignoring malformed handover payload");
            None
        }
    }
}
