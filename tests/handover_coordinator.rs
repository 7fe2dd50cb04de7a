use std::sync::{Arc, Mutex};
use std::time::Duration;

use unimesh::{
    HandoverCoordinator, HandoverState, ManagedProxy, MemoryBroker, ProxyOptions, PublishOptions,
    QueueProxy, QueueRole, RedundancyConfig, RedundancyMode, RegisteredProxy, SharedProxyRegistry,
    TopicBuilder, Transport,
};

/// Opt-in log output for debugging, e.g. RUST_LOG=unimesh=debug.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn redundancy(mode: RedundancyMode) -> RedundancyConfig {
    RedundancyConfig {
        mode,
        active_timeout_ms: 1_000,
        heartbeat_interval_ms: 500,
        request_delay_ms: 200,
        status_expiry_secs: 30,
        handover_window: 3,
    }
}

fn build_instance(
    broker: &Arc<MemoryBroker>,
    process_name: &str,
    mode: RedundancyMode,
) -> (HandoverCoordinator, Arc<QueueProxy>) {
    let transport: Arc<dyn Transport> = Arc::new(broker.client(process_name));
    let topics = TopicBuilder::new("uns-infra", "unimesh", "1.0.0", process_name).unwrap();
    let proxy = QueueProxy::new(
        process_name,
        topics.instance_status_topic("main"),
        Arc::clone(&transport),
        ProxyOptions::new("main"),
    );
    let registry: SharedProxyRegistry = Arc::new(Mutex::new(vec![RegisteredProxy {
        capability: "messaging".into(),
        proxy: proxy.clone() as Arc<dyn ManagedProxy>,
    }]));
    let coordinator = HandoverCoordinator::new(
        process_name,
        topics,
        transport,
        registry,
        redundancy(mode),
    );
    (coordinator, proxy)
}

async fn wait_for_state(coordinator: &HandoverCoordinator, target: HandoverState) {
    let mut states = coordinator.watch_state();
    while *states.borrow() != target {
        states.changed().await.expect("coordinator alive");
    }
}

#[tokio::test(start_paused = true)]
async fn becomes_active_when_no_peer_is_observed() {
    init_tracing();
    let broker = MemoryBroker::new();
    let (coordinator, proxy) = build_instance(&broker, "proc-solo", RedundancyMode::Wait);

    let runner = coordinator.clone();
    tokio::spawn(async move {
        let _ = runner.run().await;
    });
    wait_for_state(&coordinator, HandoverState::Active).await;

    assert_eq!(proxy.roles().publisher, QueueRole::Active);
    assert_eq!(proxy.roles().subscriber, QueueRole::Active);

    // The first heartbeat refresh lands immediately after activation.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(broker
        .retained_payload("uns-infra/unimesh/1.0.0/proc-solo/active")
        .is_some());
}

#[tokio::test(start_paused = true)]
async fn wait_mode_defers_to_a_live_peer_and_takes_over_on_silence() {
    init_tracing();
    let broker = MemoryBroker::new();

    // Simulated peer refreshing its retained heartbeat every 400 ms.
    let peer = broker.client("proc-peer");
    let peer_task = tokio::spawn(async move {
        loop {
            peer.publish(
                "uns-infra/unimesh/1.0.0/proc-peer/active",
                "alive",
                PublishOptions::retained(30),
            )
            .await
            .expect("peer heartbeat");
            tokio::time::sleep(Duration::from_millis(400)).await;
        }
    });

    let (coordinator, proxy) = build_instance(&broker, "proc-standby", RedundancyMode::Wait);
    let runner = coordinator.clone();
    tokio::spawn(async move {
        let _ = runner.run().await;
    });

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(coordinator.state(), HandoverState::Passive);
    assert_eq!(proxy.roles().publisher, QueueRole::Passive);

    peer_task.abort();
    wait_for_state(&coordinator, HandoverState::Active).await;
    assert_eq!(proxy.roles().publisher, QueueRole::Active);
}

#[tokio::test(start_paused = true)]
async fn force_mode_activates_despite_a_live_peer() {
    init_tracing();
    let broker = MemoryBroker::new();
    let peer = broker.client("proc-peer");
    peer.publish(
        "uns-infra/unimesh/1.0.0/proc-peer/active",
        "alive",
        PublishOptions::retained(120),
    )
    .await
    .unwrap();

    let (coordinator, proxy) = build_instance(&broker, "proc-forced", RedundancyMode::Force);
    let runner = coordinator.clone();
    tokio::spawn(async move {
        let _ = runner.run().await;
    });
    wait_for_state(&coordinator, HandoverState::Active).await;
    assert_eq!(proxy.roles().publisher, QueueRole::Active);
}

#[tokio::test(start_paused = true)]
async fn coordinated_handover_transfers_the_active_role() {
    init_tracing();
    let broker = MemoryBroker::new();

    let (old_active, old_proxy) = build_instance(&broker, "proc-old", RedundancyMode::Wait);
    let runner = old_active.clone();
    let old_task = tokio::spawn(async move { runner.run().await });
    wait_for_state(&old_active, HandoverState::Active).await;

    // Give the outgoing side some processed history so its snapshots are
    // non-empty.
    for index in 0..5 {
        old_proxy
            .publish_message(format!("data/{index}"), "v", None)
            .delivered()
            .await
            .expect("published while active");
    }

    let (incoming, new_proxy) = build_instance(&broker, "proc-new", RedundancyMode::Handover);
    let runner = incoming.clone();
    tokio::spawn(async move {
        let _ = runner.run().await;
    });

    // The outgoing run() returns once the takeover completes.
    let outcome = old_task.await.expect("old coordinator task");
    assert!(outcome.is_ok());

    assert_eq!(old_active.state(), HandoverState::Passive);
    assert_eq!(incoming.state(), HandoverState::Active);
    assert_eq!(old_proxy.roles().publisher, QueueRole::Passive);
    assert_eq!(old_proxy.roles().subscriber, QueueRole::Passive);
    assert_eq!(new_proxy.roles().publisher, QueueRole::Active);
    assert_eq!(new_proxy.roles().subscriber, QueueRole::Active);

    // The outgoing side cleared its retained lease marker.
    assert!(broker
        .retained_payload("uns-infra/unimesh/1.0.0/proc-old/active")
        .is_none());
}
