//! Queue-backed proxy pairing one publisher and one subscriber queue over a
//! shared transport.
//!
//! The proxy stamps outbound envelopes with per-topic sequence numbers,
//! routes inbound messages matching its subscriptions into the paced
//! subscriber queue, and exposes the role controls the handover coordinator
//! drives.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::DEFAULT_THROTTLE_DELAY_MS;
use crate::envelope::{now_epoch_ms, Envelope};
use crate::queue::publisher::PublishFn;
use crate::queue::subscriber::InboundHandlerFn;
use crate::queue::{
    HandoverSnapshot, PublishHandle, PublisherQueue, QueueOptions, QueueRole, SubscribeItem,
    SubscriberQueue,
};
use crate::topic::matches;
use crate::transport::{PublishOptions, Transport, TransportError};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Message surfaced to subscribers of a proxy's event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyMessage {
    pub topic: String,
    pub message: String,
}

/// Roles of the two queues owned by one proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyRoles {
    pub publisher: QueueRole,
    pub subscriber: QueueRole,
}

/// Snapshots produced when a proxy steps down, one per owned queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySnapshots {
    pub proxy_name: String,
    pub publisher: HandoverSnapshot,
    pub subscriber: HandoverSnapshot,
}

/// Lifecycle surface the owning process and the handover coordinator use.
#[async_trait]
pub trait ManagedProxy: Send + Sync + std::fmt::Debug + 'static {
    fn instance_name(&self) -> &str;

    fn roles(&self) -> ProxyRoles;

    /// Suspends both queues and fingerprints their reconciliation windows.
    fn step_down(&self, window: usize) -> ProxySnapshots;

    /// Resumes both queues, applying the peer's snapshots when available.
    fn resume(&self, snapshots: Option<&ProxySnapshots>);

    /// Terminal stop; the current in-flight item is allowed to finish.
    async fn stop(&self);
}

/// Registry entry associating a proxy with the capability that created it.
#[derive(Clone)]
pub struct RegisteredProxy {
    pub capability: String,
    pub proxy: Arc<dyn ManagedProxy>,
}

/// Ordered collection of every proxy a process instance created.
pub type SharedProxyRegistry = Arc<Mutex<Vec<RegisteredProxy>>>;

/// Construction options for a queue proxy.
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    pub instance_name: String,
    /// Filters subscribed at creation time.
    pub subscribe_to: Vec<String>,
    /// Publisher pacing; `None` takes the owning process configuration.
    pub publish_delay: Option<Duration>,
    /// Subscriber pacing; `None` takes the owning process configuration.
    pub subscribe_delay: Option<Duration>,
    /// Directory for the queue files; `None` disables persistence.
    pub persistence_dir: Option<PathBuf>,
}

impl ProxyOptions {
    pub fn new(instance_name: impl Into<String>) -> Self {
        Self {
            instance_name: instance_name.into(),
            subscribe_to: Vec::new(),
            publish_delay: None,
            subscribe_delay: None,
            persistence_dir: None,
        }
    }

    pub fn with_subscriptions(mut self, filters: Vec<String>) -> Self {
        self.subscribe_to = filters;
        self
    }

    pub fn with_publish_delay(mut self, delay: Duration) -> Self {
        self.publish_delay = Some(delay);
        self
    }

    pub fn with_subscribe_delay(mut self, delay: Duration) -> Self {
        self.subscribe_delay = Some(delay);
        self
    }

    pub fn with_persistence_dir(mut self, dir: PathBuf) -> Self {
        self.persistence_dir = Some(dir);
        self
    }
}

#[derive(Default)]
struct SequenceState {
    next: BTreeMap<String, u64>,
    last_sample_ms: BTreeMap<String, u64>,
}

/// Queue-backed proxy owning one publisher and one subscriber queue.
///
/// Both queues start Passive; the handover coordinator or the owning
/// process resumes them once the instance holds the active role.
pub struct QueueProxy {
    instance_name: String,
    queue_label: String,
    status_topic: String,
    transport: Arc<dyn Transport>,
    publisher: PublisherQueue,
    subscriber: SubscriberQueue,
    events: broadcast::Sender<ProxyMessage>,
    sequences: Mutex<SequenceState>,
    publish_counter: AtomicU64,
    subscriptions: Arc<Mutex<Vec<String>>>,
    route_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for QueueProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueProxy")
            .field("instance_name", &self.instance_name)
            .field("queue_label", &self.queue_label)
            .finish()
    }
}

impl QueueProxy {
    /// Wires the queues to the transport and starts the inbound router.
    pub fn new(
        process_name: &str,
        status_topic: String,
        transport: Arc<dyn Transport>,
        options: ProxyOptions,
    ) -> Arc<Self> {
        let queue_label = format!("{process_name}-{}", options.instance_name);
        let default_delay = Duration::from_millis(DEFAULT_THROTTLE_DELAY_MS);

        let publish_transport = Arc::clone(&transport);
        let publish: PublishFn = Arc::new(move |item| {
            let transport = Arc::clone(&publish_transport);
            async move {
                transport
                    .publish(&item.topic, &item.message, item.options.unwrap_or_default())
                    .await
            }
            .boxed()
        });
        let publisher = PublisherQueue::new(
            queue_label.clone(),
            publish,
            QueueOptions {
                delay: options.publish_delay.unwrap_or(default_delay),
                initial_role: QueueRole::Passive,
                persistence_path: options
                    .persistence_dir
                    .as_ref()
                    .map(|dir| dir.join(&options.instance_name).join("publisher-queue.json")),
            },
        );

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let handler_events = events.clone();
        let handler: InboundHandlerFn = Arc::new(move |item: SubscribeItem| {
            let events = handler_events.clone();
            async move {
                let _ = events.send(ProxyMessage {
                    topic: item.topic,
                    message: item.message,
                });
                Ok(())
            }
            .boxed()
        });
        let subscriber = SubscriberQueue::new(
            queue_label.clone(),
            handler,
            QueueOptions {
                delay: options.subscribe_delay.unwrap_or(default_delay),
                initial_role: QueueRole::Passive,
                persistence_path: options
                    .persistence_dir
                    .as_ref()
                    .map(|dir| dir.join(&options.instance_name).join("subscriber-queue.json")),
            },
        );

        let subscriptions: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let route_task = spawn_router(
            transport.inbound(),
            subscriber.clone(),
            Arc::clone(&subscriptions),
            queue_label.clone(),
        );

        info!(proxy = %queue_label, "queue proxy created");
        Arc::new(Self {
            instance_name: options.instance_name,
            queue_label,
            status_topic,
            transport,
            publisher,
            subscriber,
            events,
            sequences: Mutex::new(SequenceState::default()),
            publish_counter: AtomicU64::new(0),
            subscriptions,
            route_task: Mutex::new(Some(route_task)),
        })
    }

    pub fn status_topic(&self) -> &str {
        &self.status_topic
    }

    pub fn publisher(&self) -> &PublisherQueue {
        &self.publisher
    }

    pub fn subscriber(&self) -> &SubscriberQueue {
        &self.subscriber
    }

    /// Stream of inbound messages after paced subscriber handling.
    pub fn messages(&self) -> broadcast::Receiver<ProxyMessage> {
        self.events.subscribe()
    }

    /// Adds subscription filters, recording them for the inbound router.
    pub async fn subscribe(&self, filters: &[String]) -> Result<(), TransportError> {
        {
            let mut current = self.subscriptions.lock().unwrap();
            for filter in filters {
                if !current.contains(filter) {
                    current.push(filter.clone());
                }
            }
        }
        self.transport.subscribe(filters).await
    }

    pub async fn unsubscribe(&self, filters: &[String]) -> Result<(), TransportError> {
        {
            let mut current = self.subscriptions.lock().unwrap();
            current.retain(|existing| !filters.contains(existing));
        }
        self.transport.unsubscribe(filters).await
    }

    /// Enqueues a raw payload for paced delivery.
    pub fn publish_message(
        &self,
        topic: impl Into<String>,
        message: impl Into<String>,
        options: Option<PublishOptions>,
    ) -> PublishHandle {
        let id = format!(
            "{}-{}",
            self.queue_label,
            self.publish_counter.fetch_add(1, Ordering::Relaxed)
        );
        self.publisher.enqueue(topic, message, id, options)
    }

    /// Stamps the envelope with this topic's sequence number and the
    /// interval since the previous sample, then enqueues it.
    pub fn publish_envelope(&self, topic: impl Into<String>, mut envelope: Envelope) -> PublishHandle {
        let topic = topic.into();
        {
            let mut sequences = self.sequences.lock().unwrap();
            let counter = sequences.next.entry(topic.clone()).or_insert(0);
            envelope.sequence_id = Some(*counter);
            *counter += 1;
            let now = now_epoch_ms();
            if let Some(previous) = sequences.last_sample_ms.insert(topic.clone(), now) {
                envelope.interval_ms = Some(now.saturating_sub(previous));
            }
        }
        let payload = envelope.to_json();
        self.publish_message(topic, payload, None)
    }
}

#[async_trait]
impl ManagedProxy for QueueProxy {
    fn instance_name(&self) -> &str {
        &self.instance_name
    }

    fn roles(&self) -> ProxyRoles {
        ProxyRoles {
            publisher: self.publisher.role(),
            subscriber: self.subscriber.role(),
        }
    }

    fn step_down(&self, window: usize) -> ProxySnapshots {
        ProxySnapshots {
            proxy_name: self.instance_name.clone(),
            publisher: self.publisher.become_passive(window),
            subscriber: self.subscriber.become_passive(window),
        }
    }

    fn resume(&self, snapshots: Option<&ProxySnapshots>) {
        match snapshots {
            Some(snapshots) => {
                self.publisher.become_active(&snapshots.publisher);
                self.subscriber.become_active(&snapshots.subscriber);
            }
            None => {
                let empty = HandoverSnapshot::empty();
                self.publisher.become_active(&empty);
                self.subscriber.become_active(&empty);
            }
        }
    }

    async fn stop(&self) {
        let filters: Vec<String> = self.subscriptions.lock().unwrap().clone();
        if !filters.is_empty() {
            if let Err(err) = self.transport.unsubscribe(&filters).await {
                warn!(proxy = %self.queue_label, error = %err, "unsubscribe failed during stop");
            }
        }
        self.publisher.stop().await;
        self.subscriber.stop().await;
        if let Some(task) = self.route_task.lock().unwrap().take() {
            task.abort();
        }
        info!(proxy = %self.queue_label, "queue proxy stopped");
    }
}

fn spawn_router(
    mut inbound: broadcast::Receiver<crate::transport::InboundMessage>,
    subscriber: SubscriberQueue,
    subscriptions: Arc<Mutex<Vec<String>>>,
    label: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match inbound.recv().await {
                Ok(message) => {
                    let matched = subscriptions
                        .lock()
                        .unwrap()
                        .iter()
                        .any(|filter| matches(filter, &message.topic));
                    if matched {
                        subscriber.enqueue(message.topic, message.payload);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(proxy = %label, skipped, "inbound stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
