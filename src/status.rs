//! Periodic status publication for a running proxy process.
//!
//! Publishes uptime, an expiring retained liveness bit, and the per-proxy
//! queue roles as envelope data points on the process status sub-topics.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use tracing::warn;

use crate::envelope::{DataPoint, Envelope};
use crate::proxy::SharedProxyRegistry;
use crate::queue::QueueRole;
use crate::topic::TopicBuilder;
use crate::transport::{PublishOptions, Transport};

/// Unit of measure for uptime publications.
pub const UOM_MINUTE: &str = "min";
/// Unit of measure for boolean status bits.
pub const UOM_BIT: &str = "bit";

/// Background task publishing process status on an interval.
pub struct StatusMonitor {
    task: JoinHandle<()>,
}

impl StatusMonitor {
    pub fn spawn(
        transport: Arc<dyn Transport>,
        topics: TopicBuilder,
        proxies: SharedProxyRegistry,
        update_interval: Duration,
        expiry_secs: u32,
    ) -> Self {
        let started = Instant::now();
        let task = tokio::spawn(async move {
            let mut ticker = interval(update_interval);
            loop {
                ticker.tick().await;
                publish_round(&transport, &topics, &proxies, started, expiry_secs).await;
            }
        });
        Self { task }
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for StatusMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn publish_round(
    transport: &Arc<dyn Transport>,
    topics: &TopicBuilder,
    proxies: &SharedProxyRegistry,
    started: Instant,
    expiry_secs: u32,
) {
    let base = topics.status_topic();
    let uptime_minutes = started.elapsed().as_secs() / 60;
    publish_point(
        transport,
        format!("{base}uptime"),
        DataPoint::now(uptime_minutes).with_uom(UOM_MINUTE),
        PublishOptions::default(),
    )
    .await;
    publish_point(
        transport,
        format!("{base}alive"),
        DataPoint::now(1).with_uom(UOM_BIT),
        PublishOptions::retained(expiry_secs),
    )
    .await;

    // Snapshot the registry before publishing so the lock never spans an
    // await point.
    let roles: Vec<(String, QueueRole, QueueRole)> = proxies
        .lock()
        .unwrap()
        .iter()
        .map(|registered| {
            let roles = registered.proxy.roles();
            (
                registered.proxy.instance_name().to_string(),
                roles.publisher,
                roles.subscriber,
            )
        })
        .collect();
    for (instance, publisher, subscriber) in roles {
        let instance_base = topics.instance_status_topic(&instance);
        publish_point(
            transport,
            format!("{instance_base}t-publisher-active"),
            DataPoint::now(role_bit(publisher)).with_uom(UOM_BIT),
            PublishOptions::default(),
        )
        .await;
        publish_point(
            transport,
            format!("{instance_base}t-subscriber-active"),
            DataPoint::now(role_bit(subscriber)).with_uom(UOM_BIT),
            PublishOptions::default(),
        )
        .await;
    }
}

async fn publish_point(
    transport: &Arc<dyn Transport>,
    topic: String,
    point: DataPoint,
    options: PublishOptions,
) {
    let envelope = Envelope::data(point);
    if let Err(err) = transport.publish(&topic, &envelope.to_json(), options).await {
        warn!(topic = %topic, error = %err, "status publish failed");
    }
}

fn role_bit(role: QueueRole) -> u64 {
    u64::from(role == QueueRole::Active)
}
