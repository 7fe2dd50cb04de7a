//! Throttled, disk-checkpointed queueing with active/passive roles.
//!
//! One generic engine serializes work items through a single paced consumer;
//! the publisher and subscriber specializations plug in their own processing
//! and serialization strategies instead of subclassing.

pub mod engine;
pub mod persistence;
pub mod publisher;
pub mod snapshot;
pub mod subscriber;

use thiserror::Error;

pub use engine::{ItemProcessor, QueueOptions, ThrottledQueue};
pub use persistence::{PersistedQueue, QueueStore};
pub use publisher::{PublishFn, PublishHandle, PublisherQueue, StoredPublishItem};
pub use snapshot::HandoverSnapshot;
pub use subscriber::{InboundHandlerFn, SubscribeItem, SubscriberQueue};

/// Number of processed items kept for reconciliation hashing.
pub const RECENT_ITEMS_BOUND: usize = 10;

/// Role of one queue in a redundant pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueRole {
    /// Items are dequeued and processed at the configured pace.
    Active,
    /// Enqueue is accepted but processing is suspended.
    Passive,
}

/// Per-item failure recovered by the engine without stopping the loop.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct DeliveryError {
    pub reason: String,
}

impl DeliveryError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}
