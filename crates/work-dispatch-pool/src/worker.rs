//! Single-slot worker.

use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, watch};
use tower::{Service, ServiceExt};

use work_dispatch_core::{EventListeners, SharedReplyClassifier, Verdict, WorkError, WorkItem};
use work_dispatch_queue::QueueHandle;

use crate::breaker::Gate;
use crate::events::PoolEvent;
use crate::processor::PoolMsg;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct WorkerId(pub(crate) u64);

/// How a worker winds down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RetireMode {
    /// Complete the current item (if any) and exit without pulling more.
    /// Used when shrinking the pool.
    Finish,
    /// Keep pulling until the queue reports empty. Used during graceful
    /// shutdown so queued work still completes.
    Drain,
}

/// Why a worker task ended, reported to the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExitReason {
    Retired,
    QueueLost,
    Crashed,
}

pub(crate) struct Worker<Req, S>
where
    S: Service<Req>,
{
    pub(crate) id: WorkerId,
    pub(crate) queue: QueueHandle<Req, S::Response>,
    pub(crate) pool: mpsc::UnboundedSender<PoolMsg>,
    pub(crate) backend: S,
    pub(crate) classifier: SharedReplyClassifier<S::Response, S::Error>,
    pub(crate) retire: watch::Receiver<Option<RetireMode>>,
    pub(crate) events: EventListeners<PoolEvent>,
    pub(crate) name: String,
    pub(crate) max_processing_time: Option<Duration>,
    pub(crate) breaker_enabled: bool,
}

impl<Req, S> Worker<Req, S>
where
    Req: Clone + Send + 'static,
    S: Service<Req> + Clone + Send + 'static,
    S::Response: Send + 'static,
    S::Error: Send + 'static,
    S::Future: Send,
{
    pub(crate) async fn run(mut self) {
        let mut guard = ExitGuard {
            worker: self.id,
            pool: self.pool.clone(),
            reason: None,
        };
        loop {
            if self.finish_requested() {
                guard.set(ExitReason::Retired);
                return;
            }
            if self.breaker_enabled {
                match self.acquire_permit().await {
                    Some(Gate::Granted) => {}
                    Some(Gate::BackOff(wait)) => {
                        if self.backoff(wait).await {
                            guard.set(ExitReason::Retired);
                            return;
                        }
                        continue;
                    }
                    // Processor gone; nothing left to dispatch for.
                    None => {
                        guard.set(ExitReason::Retired);
                        return;
                    }
                }
            }

            let next = self.queue.request_next();
            let item = tokio::select! {
                res = next => match res {
                    Ok(Some(item)) => item,
                    // Queue drained during shutdown (or pull source done).
                    Ok(None) => {
                        guard.set(ExitReason::Retired);
                        return;
                    }
                    Err(_) => {
                        guard.set(ExitReason::QueueLost);
                        return;
                    }
                },
                _ = Self::finish_signal(&mut self.retire) => {
                    guard.set(ExitReason::Retired);
                    return;
                }
            };
            self.execute(item).await;
        }
    }

    /// Runs one item to its final outcome, retrying within the item's
    /// budget but never past its deadline.
    async fn execute(&mut self, mut item: WorkItem<Req, S::Response>) {
        self.events.emit(&PoolEvent::WorkStarted {
            dispatcher: self.name.clone(),
            timestamp: Instant::now(),
        });
        #[cfg(feature = "metrics")]
        metrics::counter!("workdispatch_work_started_total", "dispatcher" => self.name.clone())
            .increment(1);
        let started = Instant::now();

        loop {
            let now = Instant::now();
            let mut budget = item.remaining(now);
            if let Some(cap) = self.max_processing_time {
                budget = budget.min(cap);
            }
            if budget.is_zero() {
                self.emit_timeout();
                self.report(true);
                item.reply(Err(WorkError::Timeout));
                return;
            }

            let call = self.backend.clone().oneshot(item.payload.clone());
            match tokio::time::timeout(budget, call).await {
                Err(_elapsed) => {
                    // Dropping the call future cancels the in-flight request.
                    self.emit_timeout();
                    self.report(true);
                    // A timeout is retryable, but never past the deadline.
                    if item.attempt < item.retry_budget && !item.expired(Instant::now()) {
                        item.attempt += 1;
                        continue;
                    }
                    item.reply(Err(WorkError::Timeout));
                    return;
                }
                Ok(raw) => match (self.classifier)(raw) {
                    Verdict::Success(res) => {
                        let duration = started.elapsed();
                        self.events.emit(&PoolEvent::WorkCompleted {
                            dispatcher: self.name.clone(),
                            timestamp: Instant::now(),
                            duration,
                        });
                        #[cfg(feature = "metrics")]
                        {
                            metrics::counter!("workdispatch_work_completed_total", "dispatcher" => self.name.clone())
                                .increment(1);
                            metrics::histogram!("workdispatch_work_duration_seconds", "dispatcher" => self.name.clone())
                                .record(duration.as_secs_f64());
                        }
                        self.report(false);
                        // Outcome delivery comes last so listeners observe a
                        // consistent count by the time a ticket resolves.
                        item.reply(Ok(res));
                        return;
                    }
                    Verdict::Failure { reason, retryable } => {
                        self.emit_failed(reason.clone());
                        self.report(true);
                        if retryable
                            && item.attempt < item.retry_budget
                            && !item.expired(Instant::now())
                        {
                            item.attempt += 1;
                            continue;
                        }
                        item.reply(Err(WorkError::Failed(reason)));
                        return;
                    }
                    Verdict::Unrecognized(raw) => {
                        self.emit_failed("unrecognized reply".to_string());
                        self.report(true);
                        item.reply(Err(WorkError::UnrecognizedReply(raw)));
                        return;
                    }
                },
            }
        }
    }

    fn emit_timeout(&self) {
        self.events.emit(&PoolEvent::WorkTimedOut {
            dispatcher: self.name.clone(),
            timestamp: Instant::now(),
        });
        #[cfg(feature = "metrics")]
        metrics::counter!("workdispatch_work_timed_out_total", "dispatcher" => self.name.clone())
            .increment(1);
    }

    fn emit_failed(&self, reason: String) {
        #[cfg(feature = "tracing")]
        tracing::debug!(dispatcher = %self.name, %reason, "work attempt failed");
        self.events.emit(&PoolEvent::WorkFailed {
            dispatcher: self.name.clone(),
            timestamp: Instant::now(),
            reason,
        });
        #[cfg(feature = "metrics")]
        metrics::counter!("workdispatch_work_failed_total", "dispatcher" => self.name.clone())
            .increment(1);
    }

    fn report(&self, failure: bool) {
        let _ = self.pool.send(PoolMsg::Report {
            worker: self.id,
            failure,
        });
    }

    async fn acquire_permit(&mut self) -> Option<Gate> {
        let (tx, rx) = oneshot::channel();
        self.pool
            .send(PoolMsg::Permit {
                worker: self.id,
                reply: tx,
            })
            .ok()?;
        rx.await.ok()
    }

    /// True once a back-off or park should be abandoned for retirement.
    fn finish_requested(&self) -> bool {
        matches!(*self.retire.borrow(), Some(RetireMode::Finish))
    }

    async fn backoff(&mut self, wait: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(wait) => false,
            _ = Self::finish_signal(&mut self.retire) => true,
        }
    }

    /// Resolves when retirement in `Finish` mode is requested, or when the
    /// processor is gone. `Drain` mode does not resolve this: a draining
    /// worker keeps waiting for the queue to run dry.
    async fn finish_signal(rx: &mut watch::Receiver<Option<RetireMode>>) {
        loop {
            if matches!(*rx.borrow(), Some(RetireMode::Finish)) {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Sends `WorkerExited` when the worker task ends, whatever the path out.
/// An unset reason means the task unwound, which the processor treats as a
/// crash and replaces.
struct ExitGuard {
    worker: WorkerId,
    pool: mpsc::UnboundedSender<PoolMsg>,
    reason: Option<ExitReason>,
}

impl ExitGuard {
    fn set(&mut self, reason: ExitReason) {
        if self.reason.is_none() {
            self.reason = Some(reason);
        }
    }
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let reason = self.reason.take().unwrap_or(ExitReason::Crashed);
        let _ = self.pool.send(PoolMsg::WorkerExited {
            worker: self.worker,
            reason,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use work_dispatch_core::{default_classifier, ReplyTo};
    use work_dispatch_queue::{BufferedQueue, QueueConfig};

    fn spawn_worker<S>(
        backend: S,
        queue: QueueHandle<u32, u32>,
    ) -> (
        mpsc::UnboundedReceiver<PoolMsg>,
        watch::Sender<Option<RetireMode>>,
    )
    where
        S: Service<u32, Response = u32> + Clone + Send + 'static,
        S::Error: std::fmt::Display + Send + 'static,
        S::Future: Send,
    {
        let (pool_tx, pool_rx) = mpsc::unbounded_channel();
        let (retire_tx, retire_rx) = watch::channel(None);
        let worker = Worker {
            id: WorkerId(1),
            queue,
            pool: pool_tx,
            backend,
            classifier: default_classifier(),
            retire: retire_rx,
            events: EventListeners::new(),
            name: "test".to_string(),
            max_processing_time: None,
            breaker_enabled: false,
        };
        tokio::spawn(worker.run());
        (pool_rx, retire_tx)
    }

    async fn submit(queue: &QueueHandle<u32, u32>, payload: u32, retries: u32, timeout: Duration) -> oneshot::Receiver<Result<u32, WorkError>> {
        let (tx, rx) = oneshot::channel();
        queue
            .enqueue(WorkItem::new(
                payload,
                Some(ReplyTo::Once(tx)),
                retries,
                timeout,
            ))
            .await;
        rx
    }

    #[tokio::test]
    async fn executes_and_reports_success() {
        let queue = BufferedQueue::spawn(QueueConfig::default(), EventListeners::new());
        let backend = tower::service_fn(|req: u32| async move { Ok::<_, String>(req * 2) });
        let (mut pool_rx, retire_tx) = spawn_worker(backend, queue.clone());

        let rx = submit(&queue, 21, 0, Duration::from_secs(5)).await;
        assert_eq!(rx.await.unwrap(), Ok(42));
        match pool_rx.recv().await.unwrap() {
            PoolMsg::Report { failure, .. } => assert!(!failure),
            other => panic!("unexpected message: {}", msg_name(&other)),
        }

        retire_tx.send(Some(RetireMode::Finish)).unwrap();
        loop {
            match pool_rx.recv().await.unwrap() {
                PoolMsg::WorkerExited { reason, .. } => {
                    assert_eq!(reason, ExitReason::Retired);
                    break;
                }
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn retries_within_budget_then_succeeds() {
        let queue = BufferedQueue::spawn(QueueConfig::default(), EventListeners::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        let backend = tower::service_fn(move |req: u32| {
            let calls = Arc::clone(&calls_clone);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("transient".to_string())
                } else {
                    Ok(req)
                }
            }
        });
        let (mut pool_rx, _retire_tx) = spawn_worker(backend, queue.clone());

        let rx = submit(&queue, 9, 2, Duration::from_secs(5)).await;
        assert_eq!(rx.await.unwrap(), Ok(9));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let mut failures = 0;
        let mut successes = 0;
        for _ in 0..3 {
            match pool_rx.recv().await.unwrap() {
                PoolMsg::Report { failure: true, .. } => failures += 1,
                PoolMsg::Report { failure: false, .. } => successes += 1,
                other => panic!("unexpected message: {}", msg_name(&other)),
            }
        }
        assert_eq!((failures, successes), (2, 1));
    }

    #[tokio::test]
    async fn exhausted_budget_reports_the_failure() {
        let queue = BufferedQueue::spawn(QueueConfig::default(), EventListeners::new());
        let backend = tower::service_fn(|_req: u32| async { Err::<u32, _>("down".to_string()) });
        let (_pool_rx, _retire_tx) = spawn_worker(backend, queue.clone());

        let rx = submit(&queue, 1, 1, Duration::from_secs(5)).await;
        assert_eq!(rx.await.unwrap(), Err(WorkError::Failed("down".to_string())));
    }

    #[tokio::test]
    async fn deadline_cancels_the_backend_call() {
        let queue = BufferedQueue::spawn(QueueConfig::default(), EventListeners::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        let backend = tower::service_fn(move |_req: u32| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            async {
                futures::future::pending::<()>().await;
                Ok::<u32, String>(0)
            }
        });
        let (_pool_rx, _retire_tx) = spawn_worker(backend, queue.clone());

        let rx = submit(&queue, 1, 0, Duration::from_millis(50)).await;
        assert_eq!(rx.await.unwrap(), Err(WorkError::Timeout));
        // No retry past the deadline: exactly one backend call.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    fn msg_name(msg: &PoolMsg) -> &'static str {
        match msg {
            PoolMsg::Permit { .. } => "Permit",
            PoolMsg::Report { .. } => "Report",
            PoolMsg::WorkerExited { .. } => "WorkerExited",
            PoolMsg::Resize { .. } => "Resize",
            PoolMsg::Sample { .. } => "Sample",
            PoolMsg::Shutdown { .. } => "Shutdown",
        }
    }
}
