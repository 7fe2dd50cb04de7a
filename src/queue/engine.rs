//! Generic paced queue engine shared by the publisher and subscriber.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::queue::persistence::{PersistedQueue, QueueStore};
use crate::queue::snapshot::{snapshot_of, HandoverSnapshot};
use crate::queue::{DeliveryError, QueueRole, RECENT_ITEMS_BOUND};

/// Strategy implemented by each queue specialization.
///
/// `Item` is the in-memory shape, which may carry completion channels;
/// `Stored` is the serializable shape used for persistence and snapshot
/// hashing. The engine never interprets either beyond these hooks.
#[async_trait]
pub trait ItemProcessor: Send + Sync + 'static {
    type Item: Send + 'static;
    type Stored: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;

    /// Label used in structured log entries.
    fn kind(&self) -> &'static str;

    fn to_stored(&self, item: &Self::Item) -> Self::Stored;

    fn from_stored(&self, stored: Self::Stored) -> Self::Item;

    /// Topic of a stored item, for log attribution.
    fn topic<'a>(&self, stored: &'a Self::Stored) -> &'a str;

    /// Handles one item. A failure is recovered per item; the loop continues.
    async fn process(&self, item: Self::Item) -> Result<(), DeliveryError>;
}

/// Construction options for a throttled queue.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Minimum gap enforced between processed items.
    pub delay: Duration,
    pub initial_role: QueueRole,
    /// Queue file owned exclusively by this instance, when set.
    pub persistence_path: Option<PathBuf>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(1),
            initial_role: QueueRole::Passive,
            persistence_path: None,
        }
    }
}

struct EngineState<I, S> {
    items: VecDeque<I>,
    recently_processed: VecDeque<S>,
    role: QueueRole,
    processing: bool,
    terminal: bool,
    previous_logged_size: usize,
}

impl<I, S> EngineState<I, S> {
    /// Emits a size log only at significant boundaries to avoid flooding.
    fn log_size(&mut self, name: &str, kind: &str) {
        let size = self.items.len();
        if size > 1
            && size > self.previous_logged_size
            && size / 100 > self.previous_logged_size / 100
        {
            info!(queue = name, kind, size, "queue size crossed threshold");
            self.previous_logged_size = size;
        } else if size == 0 && self.previous_logged_size > 0 {
            info!(queue = name, kind, "queue is empty");
            self.previous_logged_size = 0;
        }
    }
}

struct QueueShared<P: ItemProcessor> {
    name: String,
    delay: Duration,
    processor: P,
    store: Option<QueueStore>,
    state: Mutex<EngineState<P::Item, P::Stored>>,
    /// Signaled whenever the processing loop parks.
    idle: Notify,
}

/// FIFO queue with a single paced consumer and crash-resumable state.
///
/// At most one `process` invocation is in flight per queue at any time;
/// concurrent enqueues never spawn parallel loops.
pub struct ThrottledQueue<P: ItemProcessor> {
    shared: Arc<QueueShared<P>>,
}

impl<P: ItemProcessor> Clone for ThrottledQueue<P> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<P: ItemProcessor> ThrottledQueue<P> {
    /// Creates the queue, restoring persisted state exactly once.
    pub fn new(name: impl Into<String>, processor: P, options: QueueOptions) -> Self {
        let name = name.into();
        let store = options.persistence_path.map(QueueStore::new);
        let restored: PersistedQueue<P::Stored> =
            store.as_ref().map(|s| s.load()).unwrap_or_default();
        let items: VecDeque<P::Item> = restored
            .items
            .into_iter()
            .map(|stored| processor.from_stored(stored))
            .collect();
        info!(
            queue = %name,
            kind = processor.kind(),
            role = ?options.initial_role,
            restored_items = items.len(),
            "queue created"
        );
        Self {
            shared: Arc::new(QueueShared {
                name,
                delay: options.delay,
                processor,
                store,
                state: Mutex::new(EngineState {
                    items,
                    recently_processed: restored.recently_processed.into(),
                    role: options.initial_role,
                    processing: false,
                    terminal: false,
                    previous_logged_size: 0,
                }),
                idle: Notify::new(),
            }),
        }
    }

    /// Appends an item; starts the loop when Active and not already running.
    pub fn enqueue(&self, item: P::Item) {
        let spawn = {
            let mut state = self.shared.state.lock().unwrap();
            state.items.push_back(item);
            state.log_size(&self.shared.name, self.shared.processor.kind());
            let spawn = state.role == QueueRole::Active && !state.terminal && !state.processing;
            if spawn {
                state.processing = true;
            }
            spawn
        };
        self.shared.persist();
        if spawn {
            self.spawn_loop();
        }
    }

    /// Suspends processing and fingerprints the last `window` processed items.
    pub fn become_passive(&self, window: usize) -> HandoverSnapshot {
        let mut state = self.shared.state.lock().unwrap();
        state.role = QueueRole::Passive;
        let snapshot = snapshot_of(&state.recently_processed, window);
        info!(
            queue = %self.shared.name,
            kind = self.shared.processor.kind(),
            batch_size = snapshot.batch_size,
            reference_hash = %snapshot.reference_hash,
            "queue became passive"
        );
        snapshot
    }

    /// Resumes processing; the supplied snapshot is advisory.
    ///
    /// A divergence between the supplied and the locally recomputed snapshot
    /// indicates possible loss or duplication across the transition. It is
    /// logged loudly but never blocks activation, since refusing would leave
    /// both sides passive.
    pub fn become_active(&self, snapshot: &HandoverSnapshot) {
        let spawn = {
            let mut state = self.shared.state.lock().unwrap();
            if state.terminal {
                warn!(
                    queue = %self.shared.name,
                    kind = self.shared.processor.kind(),
                    "ignoring activation of a stopped queue"
                );
                return;
            }
            state.role = QueueRole::Active;
            if !snapshot.is_empty() {
                let local = snapshot_of(&state.recently_processed, snapshot.batch_size);
                if local != *snapshot {
                    warn!(
                        queue = %self.shared.name,
                        kind = self.shared.processor.kind(),
                        supplied_hash = %snapshot.reference_hash,
                        supplied_batch = snapshot.batch_size,
                        local_hash = %local.reference_hash,
                        local_batch = local.batch_size,
                        "handover snapshot divergence, continuing activation"
                    );
                }
            }
            info!(
                queue = %self.shared.name,
                kind = self.shared.processor.kind(),
                "queue became active"
            );
            let spawn = !state.processing && !state.items.is_empty();
            if spawn {
                state.processing = true;
            }
            spawn
        };
        if spawn {
            self.spawn_loop();
        }
    }

    /// Fingerprint over the current reconciliation window, without a role
    /// change.
    pub fn current_snapshot(&self, window: usize) -> HandoverSnapshot {
        let state = self.shared.state.lock().unwrap();
        snapshot_of(&state.recently_processed, window)
    }

    pub fn role(&self) -> QueueRole {
        self.shared.state.lock().unwrap().role
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Terminal stop: no further resumption; waits for the in-flight item
    /// and for pending persistence writes, leaving the queue file intact.
    pub async fn stop(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.terminal = true;
            state.role = QueueRole::Passive;
        }
        loop {
            let parked = self.shared.idle.notified();
            if !self.shared.state.lock().unwrap().processing {
                break;
            }
            parked.await;
        }
        self.flush().await;
        info!(
            queue = %self.shared.name,
            kind = self.shared.processor.kind(),
            "queue stopped"
        );
    }

    /// Waits until every queued persistence write has been applied.
    pub async fn flush(&self) {
        if let Some(store) = &self.shared.store {
            store.flush().await;
        }
    }

    fn spawn_loop(&self) {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(shared.run());
    }
}

impl<P: ItemProcessor> QueueShared<P> {
    fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let document = {
            let state = self.state.lock().unwrap();
            PersistedQueue {
                items: state
                    .items
                    .iter()
                    .map(|item| self.processor.to_stored(item))
                    .collect(),
                recently_processed: state.recently_processed.iter().cloned().collect(),
            }
        };
        store.save(&document);
    }

    async fn run(self: Arc<Self>) {
        loop {
            let item = {
                let mut state = self.state.lock().unwrap();
                if state.role != QueueRole::Active || state.terminal {
                    state.processing = false;
                    drop(state);
                    self.idle.notify_waiters();
                    info!(
                        queue = %self.name,
                        kind = self.processor.kind(),
                        "queue processing paused"
                    );
                    return;
                }
                match state.items.pop_front() {
                    Some(item) => item,
                    None => {
                        state.processing = false;
                        state.log_size(&self.name, self.processor.kind());
                        drop(state);
                        self.idle.notify_waiters();
                        return;
                    }
                }
            };
            let stored = self.processor.to_stored(&item);
            if let Err(err) = self.processor.process(item).await {
                let (role, size) = {
                    let state = self.state.lock().unwrap();
                    (state.role, state.items.len())
                };
                warn!(
                    queue = %self.name,
                    kind = self.processor.kind(),
                    role = ?role,
                    size,
                    topic = self.processor.topic(&stored),
                    error = %err,
                    "item processing failed"
                );
            }
            {
                let mut state = self.state.lock().unwrap();
                state.recently_processed.push_back(stored);
                while state.recently_processed.len() > RECENT_ITEMS_BOUND {
                    state.recently_processed.pop_front();
                }
            }
            self.persist();
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
        }
    }
}
