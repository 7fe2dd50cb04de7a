use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use unimesh::{
    Capability, CapabilityMethods, FactoryRequest, HandoverState, ManagedProxy, MemoryBroker,
    ProcessConfig, ProcessError, ProxyOptions, ProxyProcess, QueueRole, RedundancyConfig,
    RedundancyMode, Transport,
};

fn test_config(process_name: &str) -> ProcessConfig {
    let mut config = ProcessConfig::new(process_name, "unimesh", "1.0.0");
    config.redundancy = RedundancyConfig {
        mode: RedundancyMode::Wait,
        active_timeout_ms: 500,
        heartbeat_interval_ms: 250,
        request_delay_ms: 100,
        status_expiry_secs: 30,
        handover_window: 3,
    };
    config.status_interval_ms = 200;
    config
}

/// Capability module attaching one factory under a caller-chosen name, so
/// concurrently running tests never collide in the process-wide registry.
struct QueueCapability {
    method: &'static str,
}

impl Capability for QueueCapability {
    fn name(&self) -> &'static str {
        "queue-capability"
    }

    fn register(&self, methods: &mut CapabilityMethods) -> Result<(), ProcessError> {
        methods.define(
            self.method,
            Arc::new(|context: unimesh::ProcessContext, request: FactoryRequest| {
                async move {
                    let proxy = context
                        .create_queue_proxy(
                            "queue-capability",
                            ProxyOptions::new(request.instance_name),
                        )
                        .await?;
                    Ok(proxy as Arc<dyn ManagedProxy>)
                }
                .boxed()
            }),
        )
    }
}

#[tokio::test(start_paused = true)]
async fn capability_factories_create_tracked_proxies() {
    ProxyProcess::use_capability(&QueueCapability {
        method: "create_tracked_proxy",
    })
    .unwrap();

    let broker = MemoryBroker::new();
    let process = ProxyProcess::new(
        test_config("cap-proc"),
        Arc::new(broker.client("cap-proc")),
    )
    .unwrap();

    let proxy = process
        .create_proxy("create_tracked_proxy", FactoryRequest::new("alpha"))
        .await
        .unwrap();
    assert_eq!(proxy.instance_name(), "alpha");

    let registered = process.registered_proxies();
    assert_eq!(registered.len(), 1);
    assert_eq!(registered[0].capability, "queue-capability");
    assert_eq!(registered[0].proxy.instance_name(), "alpha");

    process.shutdown().await;
}

#[tokio::test]
async fn duplicate_method_names_are_rejected() {
    ProxyProcess::use_capability(&QueueCapability {
        method: "duplicated_method",
    })
    .unwrap();
    let err = ProxyProcess::use_capability(&QueueCapability {
        method: "duplicated_method",
    })
    .unwrap_err();
    assert!(matches!(err, ProcessError::DuplicateMethod { .. }));
}

#[tokio::test]
async fn unknown_methods_are_rejected_at_call_time() {
    let broker = MemoryBroker::new();
    let process = ProxyProcess::new(
        test_config("lookup-proc"),
        Arc::new(broker.client("lookup-proc")),
    )
    .unwrap();
    let err = process
        .create_proxy("no_such_method", FactoryRequest::new("x"))
        .await
        .unwrap_err();
    assert!(matches!(err, ProcessError::UnknownMethod { .. }));
    process.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn queue_proxies_activate_once_the_process_takes_the_lease() {
    let broker = MemoryBroker::new();
    let process = ProxyProcess::new(
        test_config("lease-proc"),
        Arc::new(broker.client("lease-proc")),
    )
    .unwrap();

    let proxy = process
        .create_queue_proxy(ProxyOptions::new("main"))
        .await
        .unwrap();
    assert_ne!(process.handover_state(), HandoverState::Active);
    assert_eq!(proxy.roles().publisher, QueueRole::Passive);

    let mut states = process.watch_handover().expect("coordinator running");
    while *states.borrow() != HandoverState::Active {
        states.changed().await.unwrap();
    }
    assert_eq!(proxy.roles().publisher, QueueRole::Active);
    assert_eq!(proxy.roles().subscriber, QueueRole::Active);

    process.shutdown().await;
    assert_eq!(proxy.roles().publisher, QueueRole::Passive);
    assert_eq!(proxy.roles().subscriber, QueueRole::Passive);
}

#[tokio::test(start_paused = true)]
async fn proxies_created_after_activation_start_active() {
    let broker = MemoryBroker::new();
    let process = ProxyProcess::new(
        test_config("late-proc"),
        Arc::new(broker.client("late-proc")),
    )
    .unwrap();

    let _first = process
        .create_queue_proxy(ProxyOptions::new("first"))
        .await
        .unwrap();
    let mut states = process.watch_handover().expect("coordinator running");
    while *states.borrow() != HandoverState::Active {
        states.changed().await.unwrap();
    }

    let second = process
        .create_queue_proxy(ProxyOptions::new("second"))
        .await
        .unwrap();
    assert_eq!(second.roles().publisher, QueueRole::Active);

    process.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn the_status_monitor_publishes_an_expiring_liveness_bit() {
    let broker = MemoryBroker::new();
    let process = ProxyProcess::new(
        test_config("status-proc"),
        Arc::new(broker.client("status-proc")),
    )
    .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    let alive = broker
        .retained_payload("uns-infra/unimesh/1.0.0/status-proc/alive")
        .expect("liveness bit retained");
    assert!(alive.contains("\"value\":1"));
    assert!(alive.contains("\"uom\":\"bit\""));

    process.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn proxy_messages_flow_end_to_end_through_the_process() {
    let broker = MemoryBroker::new();
    let process = ProxyProcess::new(
        test_config("flow-proc"),
        Arc::new(broker.client("flow-proc")),
    )
    .unwrap();
    let proxy = process
        .create_queue_proxy(
            ProxyOptions::new("main").with_subscriptions(vec!["plant/#".to_string()]),
        )
        .await
        .unwrap();
    let mut states = process.watch_handover().expect("coordinator running");
    while *states.borrow() != HandoverState::Active {
        states.changed().await.unwrap();
    }
    let mut messages = proxy.messages();

    let peer = broker.client("external");
    peer.publish("plant/line-1/temp", "21.5", Default::default())
        .await
        .unwrap();

    let received = messages.recv().await.unwrap();
    assert_eq!(received.topic, "plant/line-1/temp");
    assert_eq!(received.message, "21.5");

    process.shutdown().await;
}
