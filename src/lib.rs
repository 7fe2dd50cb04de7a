//! Delivery and redundancy engine for unified-namespace telemetry pipelines.
//!
//! Processes publish and subscribe structured telemetry over a shared broker
//! using a standardized topic and envelope scheme. This crate provides the
//! paced, disk-checkpointed queueing layer, the active/passive handover
//! protocol that lets redundant instances share one logical namespace, and
//! the capability registry that lets independent modules attach proxy
//! factories to a process. The broker wire protocol itself stays behind the
//! narrow [`transport::Transport`] seam.

pub mod config;
pub mod envelope;
pub mod handover;
pub mod process;
pub mod proxy;
pub mod queue;
pub mod status;
pub mod topic;
pub mod transport;

pub use config::{
    ConfigError, PersistenceConfig, ProcessConfig, RedundancyConfig, ThrottleConfig,
    DEFAULT_ACTIVE_TIMEOUT_MS, DEFAULT_HANDOVER_WINDOW, DEFAULT_HEARTBEAT_INTERVAL_MS,
    DEFAULT_REQUEST_DELAY_MS, DEFAULT_STATUS_EXPIRY_SECS, DEFAULT_STATUS_INTERVAL_MS,
    DEFAULT_THROTTLE_DELAY_MS, MAX_THROTTLE_DELAY_MS,
};
pub use envelope::{
    now_epoch_ms, now_timestamp, DataPoint, Envelope, EnvelopeError, EnvelopeMessage, EventData,
    TableData, ENVELOPE_VERSION,
};
pub use handover::{
    ActiveHeartbeat, HandoverCoordinator, HandoverError, HandoverMessage, HandoverState,
    QueueKind, RedundancyMode,
};
pub use process::{
    Capability, CapabilityMethods, FactoryRequest, ProcessContext, ProcessError, ProxyFactory,
    ProxyProcess, MESSAGING_CAPABILITY,
};
pub use proxy::{
    ManagedProxy, ProxyMessage, ProxyOptions, ProxyRoles, ProxySnapshots, QueueProxy,
    RegisteredProxy, SharedProxyRegistry,
};
pub use queue::persistence::PersistenceError;
pub use queue::{
    DeliveryError, HandoverSnapshot, InboundHandlerFn, ItemProcessor, PersistedQueue, PublishFn,
    PublishHandle, PublisherQueue, QueueOptions, QueueRole, QueueStore, StoredPublishItem,
    SubscribeItem, SubscriberQueue, ThrottledQueue, RECENT_ITEMS_BOUND,
};
pub use status::{StatusMonitor, UOM_BIT, UOM_MINUTE};
pub use topic::builder::sanitize_segment;
pub use topic::{matches, TopicBuilder, TopicError, DEFAULT_NAMESPACE_ROOT};
pub use transport::{
    InboundMessage, MemoryBroker, MemoryTransport, PublishOptions, Transport, TransportError,
};
