//! Pull-mode dispatcher behavior.

use std::time::Duration;

use work_dispatch::{DispatchSettings, PullDispatcher};

#[tokio::test]
async fn drains_a_finite_source_and_terminates_itself() {
    let backend = tower::service_fn(|n: u32| async move { Ok::<_, String>(n * 2) });
    let (results_tx, mut results_rx) = tokio::sync::mpsc::unbounded_channel();

    let settings = DispatchSettings::builder()
        .name("pull")
        .worker_pool(1, 1, 1)
        .shutdown_timeout(Duration::from_secs(5))
        .build();
    let dispatcher = PullDispatcher::builder(backend, futures::stream::iter(0..10u32))
        .settings(settings)
        .send_results_to(results_tx)
        .build()
        .unwrap();

    dispatcher.completed().await;

    let mut results = Vec::new();
    while let Ok(reply) = results_rx.try_recv() {
        results.push(reply.expect("backend succeeds"));
    }
    // A single worker preserves source order.
    assert_eq!(results, (0..10).map(|n| n * 2).collect::<Vec<u32>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_workers_deliver_every_result() {
    let backend = tower::service_fn(|n: u32| async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok::<_, String>(n)
    });
    let (results_tx, mut results_rx) = tokio::sync::mpsc::unbounded_channel();

    let settings = DispatchSettings::builder()
        .name("pull-wide")
        .worker_pool(4, 1, 4)
        .build();
    let dispatcher = PullDispatcher::builder(backend, futures::stream::iter(0..40u32))
        .settings(settings)
        .send_results_to(results_tx)
        .build()
        .unwrap();

    dispatcher.completed().await;

    let mut results = Vec::new();
    while let Ok(reply) = results_rx.try_recv() {
        results.push(reply.expect("backend succeeds"));
    }
    results.sort_unstable();
    assert_eq!(results, (0..40).collect::<Vec<u32>>());
}

#[tokio::test]
async fn explicit_shutdown_stops_an_endless_source() {
    let backend = tower::service_fn(|n: u32| async move { Ok::<_, String>(n) });

    let settings = DispatchSettings::builder()
        .name("pull-stop")
        .worker_pool(1, 1, 1)
        .build();
    let dispatcher = PullDispatcher::builder(backend, futures::stream::pending::<u32>())
        .settings(settings)
        .build()
        .unwrap();

    dispatcher.shutdown_gracefully(Duration::from_millis(500)).await;
    assert!(dispatcher.pool_sample().await.is_none(), "engine terminated");
}
