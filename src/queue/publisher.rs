//! Publisher specialization: paced outbound delivery with per-item
//! completion handles.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::queue::engine::{ItemProcessor, QueueOptions, ThrottledQueue};
use crate::queue::snapshot::HandoverSnapshot;
use crate::queue::{DeliveryError, QueueRole};
use crate::transport::{PublishOptions, TransportError};

/// Injected publish function performing the actual broker write.
pub type PublishFn = Arc<
    dyn Fn(StoredPublishItem) -> BoxFuture<'static, Result<(), TransportError>> + Send + Sync,
>;

/// Serializable shape of one publish request.
///
/// The `id` correlates log lines and completions; uniqueness is not
/// enforced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredPublishItem {
    pub topic: String,
    pub message: String,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<PublishOptions>,
}

/// In-memory publish request carrying the caller's completion channel.
///
/// Items restored from disk have no channel; their failures are only
/// logged.
pub struct PublishItem {
    stored: StoredPublishItem,
    completion: Option<oneshot::Sender<Result<(), DeliveryError>>>,
}

pub struct PublishProcessor {
    publish: PublishFn,
}

#[async_trait]
impl ItemProcessor for PublishProcessor {
    type Item = PublishItem;
    type Stored = StoredPublishItem;

    fn kind(&self) -> &'static str {
        "publisher"
    }

    fn to_stored(&self, item: &PublishItem) -> StoredPublishItem {
        item.stored.clone()
    }

    fn from_stored(&self, stored: StoredPublishItem) -> PublishItem {
        PublishItem {
            stored,
            completion: None,
        }
    }

    fn topic<'a>(&self, stored: &'a StoredPublishItem) -> &'a str {
        &stored.topic
    }

    async fn process(&self, mut item: PublishItem) -> Result<(), DeliveryError> {
        let outcome = (self.publish)(item.stored.clone())
            .await
            .map_err(|err| DeliveryError::new(err.to_string()));
        if let Some(completion) = item.completion.take() {
            let _ = completion.send(outcome.clone());
        }
        outcome
    }
}

/// Resolves once the associated item was handed to the publish function.
pub struct PublishHandle {
    receiver: oneshot::Receiver<Result<(), DeliveryError>>,
}

impl PublishHandle {
    /// Waits for the delivery attempt of this specific item.
    pub async fn delivered(self) -> Result<(), DeliveryError> {
        match self.receiver.await {
            Ok(outcome) => outcome,
            Err(_) => Err(DeliveryError::new(
                "queue stopped before the item was handed to the transport",
            )),
        }
    }
}

/// Throttled queue of outgoing publish requests.
pub struct PublisherQueue {
    queue: ThrottledQueue<PublishProcessor>,
}

impl Clone for PublisherQueue {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
        }
    }
}

impl PublisherQueue {
    pub fn new(name: impl Into<String>, publish: PublishFn, options: QueueOptions) -> Self {
        Self {
            queue: ThrottledQueue::new(name, PublishProcessor { publish }, options),
        }
    }

    /// Enqueues a publish request.
    ///
    /// The handle resolves only once the item has actually been handed to
    /// the publish function, letting callers distinguish accepted from
    /// delivered.
    pub fn enqueue(
        &self,
        topic: impl Into<String>,
        message: impl Into<String>,
        id: impl Into<String>,
        options: Option<PublishOptions>,
    ) -> PublishHandle {
        let (tx, rx) = oneshot::channel();
        self.queue.enqueue(PublishItem {
            stored: StoredPublishItem {
                topic: topic.into(),
                message: message.into(),
                id: id.into(),
                options,
            },
            completion: Some(tx),
        });
        PublishHandle { receiver: rx }
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
