use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tempfile::tempdir;
use unimesh::{PublishFn, PublisherQueue, QueueOptions, QueueRole, StoredPublishItem};

fn discarding_publish() -> PublishFn {
    Arc::new(|_item: StoredPublishItem| async move { Ok(()) }.boxed())
}

fn active_options() -> QueueOptions {
    QueueOptions {
        delay: Duration::from_millis(1),
        initial_role: QueueRole::Active,
        persistence_path: None,
    }
}

async fn process_items(queue: &PublisherQueue, count: usize) {
    for index in 0..count {
        queue
            .enqueue(format!("data/{index}"), format!("v{index}"), index.to_string(), None)
            .delivered()
            .await
            .expect("item processed");
    }
}

#[tokio::test(start_paused = true)]
async fn snapshots_are_idempotent_over_an_unchanged_window() {
    let queue = PublisherQueue::new("idempotent", discarding_publish(), active_options());
    process_items(&queue, 10).await;

    let first = queue.become_passive(5);
    assert_eq!(first.batch_size, 5);

    queue.become_active(&first);
    let second = queue.become_passive(5);
    assert_eq!(first, second);
}

#[tokio::test(start_paused = true)]
async fn snapshots_cover_fewer_items_near_process_start() {
    let queue = PublisherQueue::new("short", discarding_publish(), active_options());
    process_items(&queue, 2).await;

    let snapshot = queue.become_passive(5);
    assert_eq!(snapshot.batch_size, 2);
}

#[tokio::test(start_paused = true)]
async fn differing_windows_produce_differing_hashes() {
    let queue = PublisherQueue::new("distinct", discarding_publish(), active_options());
    process_items(&queue, 6).await;

    let wide = queue.current_snapshot(5);
    let narrow = queue.current_snapshot(2);
    assert_ne!(wide.reference_hash, narrow.reference_hash);
}

#[tokio::test(start_paused = true)]
async fn a_peer_loaded_with_the_same_items_recomputes_the_same_snapshot() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("queue.json");

    // Instance A processes ten items and steps down.
    let reference = {
        let queue = PublisherQueue::new(
            "instance-a",
            discarding_publish(),
            QueueOptions {
                delay: Duration::from_millis(1),
                initial_role: QueueRole::Active,
                persistence_path: Some(path.clone()),
            },
        );
        process_items(&queue, 10).await;
        let snapshot = queue.become_passive(5);
        queue.flush().await;
        snapshot
    };

    // Instance B restores the same processed history.
    let peer = PublisherQueue::new(
        "instance-b",
        discarding_publish(),
        QueueOptions {
            delay: Duration::from_millis(1),
            initial_role: QueueRole::Passive,
            persistence_path: Some(path),
        },
    );
    assert_eq!(peer.current_snapshot(5), reference);

    // Accepting the snapshot is advisory and never blocks activation.
    peer.become_active(&reference);
    assert_eq!(peer.role(), QueueRole::Active);
}
