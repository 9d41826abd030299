//! Graceful shutdown behavior.

use std::sync::Arc;
use std::time::{Duration, Instant};

use work_dispatch::{
    DispatchSettings, PushDispatcher, RejectReason, WorkError, WorkRejected,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn drains_in_flight_and_queued_work_within_the_bound() {
    let backend = tower::service_fn(|req: u32| async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok::<_, String>(req)
    });

    let settings = DispatchSettings::builder()
        .name("drain")
        .work_timeout(Duration::from_secs(30))
        .worker_pool(10, 1, 10)
        .build();
    let dispatcher: PushDispatcher<u32, u32> = PushDispatcher::builder(backend)
        .settings(settings)
        .build()
        .unwrap();

    // 10 items go in flight, 5 sit queued behind them.
    let mut tickets = Vec::new();
    for n in 0..15 {
        tickets.push(dispatcher.submit(n).await.expect("admitted"));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    let shutdown = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            dispatcher.shutdown_gracefully(Duration::from_secs(5)).await;
        })
    };

    // Submissions during the drain are refused.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let rejected = dispatcher.submit(99).await.expect_err("rejected mid-drain");
    assert_eq!(rejected, WorkRejected(RejectReason::ShuttingDown));

    // Every accepted item reaches a final outcome within the bound.
    for (n, ticket) in tickets.into_iter().enumerate() {
        assert_eq!(ticket.await, Ok(n as u32));
    }
    shutdown.await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stuck_work_is_abandoned_at_the_bound() {
    let backend = tower::service_fn(|_req: u32| async {
        futures::future::pending::<()>().await;
        Ok::<u32, String>(0)
    });

    let settings = DispatchSettings::builder()
        .name("abandon")
        .work_timeout(Duration::from_secs(30))
        .worker_pool(3, 1, 3)
        .build();
    let dispatcher: PushDispatcher<u32, u32> = PushDispatcher::builder(backend)
        .settings(settings)
        .build()
        .unwrap();

    let mut tickets = Vec::new();
    for n in 0..3 {
        tickets.push(dispatcher.submit(n).await.expect("admitted"));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    dispatcher.shutdown_gracefully(Duration::from_millis(200)).await;
    assert!(started.elapsed() < Duration::from_secs(3));

    for ticket in tickets {
        assert_eq!(ticket.await, Err(WorkError::Abandoned));
    }
}

#[tokio::test]
async fn shutdown_completes_exactly_once_per_caller() {
    let backend = tower::service_fn(|req: u32| async move { Ok::<_, String>(req) });
    let settings = DispatchSettings::builder().worker_pool(1, 1, 1).build();
    let dispatcher: PushDispatcher<u32, u32> = PushDispatcher::builder(backend)
        .settings(settings)
        .build()
        .unwrap();

    let dispatcher = Arc::new(dispatcher);
    let first = {
        let d = Arc::clone(&dispatcher);
        tokio::spawn(async move { d.shutdown_gracefully(Duration::from_secs(1)).await })
    };
    // A second caller must also return, even though the first one drives
    // the drain.
    dispatcher.shutdown_gracefully(Duration::from_secs(1)).await;
    first.await.unwrap();
}
