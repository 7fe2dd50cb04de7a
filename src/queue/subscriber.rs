//! Subscriber specialization: paced, single-threaded handling of inbound
//! messages.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::envelope::now_epoch_ms;
use crate::queue::engine::{ItemProcessor, QueueOptions, ThrottledQueue};
use crate::queue::snapshot::HandoverSnapshot;
use crate::queue::{DeliveryError, QueueRole};

/// Injected handler invoked once per inbound message.
pub type InboundHandlerFn =
    Arc<dyn Fn(SubscribeItem) -> BoxFuture<'static, Result<(), DeliveryError>> + Send + Sync>;

/// Inbound message captured at arrival time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeItem {
    pub topic: String,
    pub message: String,
    pub received_at_ms: u64,
}

pub struct SubscribeProcessor {
    handler: InboundHandlerFn,
}

#[async_trait]
impl ItemProcessor for SubscribeProcessor {
    type Item = SubscribeItem;
    type Stored = SubscribeItem;

    fn kind(&self) -> &'static str {
        "subscriber"
    }

    fn to_stored(&self, item: &SubscribeItem) -> SubscribeItem {
        item.clone()
    }

    fn from_stored(&self, stored: SubscribeItem) -> SubscribeItem {
        stored
    }

    fn topic<'a>(&self, stored: &'a SubscribeItem) -> &'a str {
        &stored.topic
    }

    async fn process(&self, item: SubscribeItem) -> Result<(), DeliveryError> {
        (self.handler)(item).await
    }
}

/// Throttled queue of incoming messages.
///
/// Delivery already happened at the transport layer by the time an item is
/// queued, so enqueue is fire-and-forget.
pub struct SubscriberQueue {
    queue: ThrottledQueue<SubscribeProcessor>,
}

impl Clone for SubscriberQueue {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
        }
    }
}

impl SubscriberQueue {
    pub fn new(name: impl Into<String>, handler: InboundHandlerFn, options: QueueOptions) -> Self {
        Self {
            queue: ThrottledQueue::new(name, SubscribeProcessor { handler }, options),
        }
    }

    pub fn enqueue(&self, topic: impl Into<String>, message: impl Into<String>) {
        self.queue.enqueue(SubscribeItem {
            topic: topic.into(),
            message: message.into(),
            received_at_ms: now_epoch_ms(),
        });
    }

    pub fn become_passive(&self, window: usize) -> HandoverSnapshot {
        self.queue.become_passive(window)
    }

    pub fn become_active(&self, snapshot: &HandoverSnapshot) {
        self.queue.become_active(snapshot)
    }

    pub fn current_snapshot(&self, window: usize) -> HandoverSnapshot {
        self.queue.current_snapshot(window)
    }

    pub fn role(&self) -> QueueRole {
        self.queue.role()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub async fn flush(&self) {
        self.queue.flush().await;
    }

    pub async fn stop(&self) {
        self.queue.stop().await;
    }
}
