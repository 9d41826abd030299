//! Deadline behavior.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use work_dispatch::{DispatchSettings, PoolEvent, PushDispatcher, WorkError};

#[tokio::test]
async fn silent_backend_times_out_with_a_single_call() {
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_clone = Arc::clone(&calls);
    let backend = tower::service_fn(move |_req: u32| {
        calls_clone.fetch_add(1, Ordering::SeqCst);
        async {
            futures::future::pending::<()>().await;
            Ok::<u32, String>(0)
        }
    });

    // A generous retry budget must not matter: the deadline has passed.
    let settings = DispatchSettings::builder()
        .name("timeout")
        .work_timeout(Duration::from_millis(100))
        .work_retry(3)
        .worker_pool(1, 1, 1)
        .build();
    let dispatcher: PushDispatcher<u32, u32> = PushDispatcher::builder(backend)
        .settings(settings)
        .build()
        .unwrap();

    let started = Instant::now();
    let ticket = dispatcher.submit(1).await.expect("admitted");
    assert_eq!(ticket.await, Err(WorkError::Timeout));
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn per_attempt_cap_allows_a_retry_within_the_deadline() {
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_clone = Arc::clone(&calls);
    let backend = tower::service_fn(move |req: u32| {
        let first = calls_clone.fetch_add(1, Ordering::SeqCst) == 0;
        async move {
            if first {
                futures::future::pending::<()>().await;
            }
            Ok::<_, String>(req)
        }
    });

    let timed_out = Arc::new(AtomicUsize::new(0));
    let timed_out_clone = Arc::clone(&timed_out);

    let settings = DispatchSettings::builder()
        .name("attempt-cap")
        .work_timeout(Duration::from_secs(5))
        .work_retry(1)
        .worker_pool(1, 1, 1)
        .max_processing_time(Duration::from_millis(50))
        .build();
    let dispatcher: PushDispatcher<u32, u32> = PushDispatcher::builder(backend)
        .settings(settings)
        .on_pool_event(move |event| {
            if matches!(event, PoolEvent::WorkTimedOut { .. }) {
                timed_out_clone.fetch_add(1, Ordering::SeqCst);
            }
        })
        .build()
        .unwrap();

    let ticket = dispatcher.submit(9).await.expect("admitted");
    assert_eq!(ticket.await, Ok(9));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(timed_out.load(Ordering::SeqCst), 1);
}
