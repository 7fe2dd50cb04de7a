use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use tokio::time::Instant;
use unimesh::{
    HandoverSnapshot, InboundHandlerFn, PublishFn, PublisherQueue, QueueOptions, QueueRole,
    StoredPublishItem, SubscriberQueue, TransportError,
};

type PublishLog = Arc<Mutex<Vec<(String, Instant)>>>;

fn recording_publish(log: PublishLog) -> PublishFn {
    Arc::new(move |item: StoredPublishItem| {
        let log = log.clone();
        async move {
            log.lock().unwrap().push((item.topic, Instant::now()));
            Ok(())
        }
        .boxed()
    })
}

fn active_options(delay_ms: u64) -> QueueOptions {
    QueueOptions {
        delay: Duration::from_millis(delay_ms),
        initial_role: QueueRole::Active,
        persistence_path: None,
    }
}

#[tokio::test(start_paused = true)]
async fn processes_items_in_fifo_order_with_pacing() {
    let log: PublishLog = Arc::new(Mutex::new(Vec::new()));
    let queue = PublisherQueue::new("fifo", recording_publish(log.clone()), active_options(50));

    let handles = vec![
        queue.enqueue("t/1", "a", "1", None),
        queue.enqueue("t/2", "b", "2", None),
        queue.enqueue("t/3", "c", "3", None),
    ];
    for handle in handles {
        handle.delivered().await.expect("delivery succeeds");
    }

    let recorded = log.lock().unwrap();
    let topics: Vec<&str> = recorded.iter().map(|(topic, _)| topic.as_str()).collect();
    assert_eq!(topics, ["t/1", "t/2", "t/3"]);
    for pair in recorded.windows(2) {
        assert!(pair[1].1 - pair[0].1 >= Duration::from_millis(50));
    }
    assert!(queue.is_empty());
}

#[tokio::test(start_paused = true)]
async fn passive_queue_holds_items_until_activation() {
    let log: PublishLog = Arc::new(Mutex::new(Vec::new()));
    let queue = PublisherQueue::new(
        "passive",
        recording_publish(log.clone()),
        QueueOptions {
            delay: Duration::from_millis(1),
            initial_role: QueueRole::Passive,
            persistence_path: None,
        },
    );

    let first = queue.enqueue("t/1", "a", "1", None);
    let second = queue.enqueue("t/2", "b", "2", None);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(log.lock().unwrap().is_empty());
    assert_eq!(queue.len(), 2);
    assert_eq!(queue.role(), QueueRole::Passive);

    queue.become_active(&HandoverSnapshot::empty());
    first.delivered().await.expect("first item delivered");
    second.delivered().await.expect("second item delivered");
    assert_eq!(log.lock().unwrap().len(), 2);
    assert_eq!(queue.role(), QueueRole::Active);
}

#[tokio::test(start_paused = true)]
async fn item_failure_does_not_stop_the_loop() {
    let failing: PublishFn = Arc::new(|item: StoredPublishItem| {
        async move {
            if item.topic == "t/bad" {
                Err(TransportError::NotConnected)
            } else {
                Ok(())
            }
        }
        .boxed()
    });
    let queue = PublisherQueue::new("faulty", failing, active_options(1));

    let bad = queue.enqueue("t/bad", "a", "1", None);
    let good = queue.enqueue("t/good", "b", "2", None);
    assert!(bad.delivered().await.is_err());
    good.delivered().await.expect("loop continues after a failed item");
}

#[tokio::test(start_paused = true)]
async fn completion_resolves_with_the_publish_outcome() {
    let log: PublishLog = Arc::new(Mutex::new(Vec::new()));
    let queue = PublisherQueue::new(
        "completion",
        recording_publish(log.clone()),
        QueueOptions {
            delay: Duration::from_millis(1),
            initial_role: QueueRole::Passive,
            persistence_path: None,
        },
    );

    let handle = queue.enqueue("t/1", "a", "1", None);
    // Accepted but not delivered: nothing has been published yet.
    assert!(log.lock().unwrap().is_empty());
    queue.become_active(&HandoverSnapshot::empty());
    handle.delivered().await.expect("resolved at hand-off time");
    assert_eq!(log.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn subscriber_handles_items_in_order() {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let handler: InboundHandlerFn = Arc::new(move |item| {
        let tx = tx.clone();
        async move {
            tx.send(item.topic).expect("test channel open");
            Ok(())
        }
        .boxed()
    });
    let queue = SubscriberQueue::new("sub", handler, active_options(10));

    queue.enqueue("s/1", "x");
    queue.enqueue("s/2", "y");
    assert_eq!(rx.recv().await.as_deref(), Some("s/1"));
    assert_eq!(rx.recv().await.as_deref(), Some("s/2"));
}

#[tokio::test(start_paused = true)]
async fn stop_is_terminal() {
    let log: PublishLog = Arc::new(Mutex::new(Vec::new()));
    let queue = PublisherQueue::new("stopping", recording_publish(log.clone()), active_options(1));

    queue
        .enqueue("t/1", "a", "1", None)
        .delivered()
        .await
        .expect("processed before stop");
    queue.stop().await;
    assert_eq!(queue.role(), QueueRole::Passive);

    // Enqueue is still accepted, but activation is refused after stop.
    let _pending = queue.enqueue("t/2", "b", "2", None);
    queue.become_active(&HandoverSnapshot::empty());
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(queue.role(), QueueRole::Passive);
    assert_eq!(queue.len(), 1);
    assert_eq!(log.lock().unwrap().len(), 1);
}
