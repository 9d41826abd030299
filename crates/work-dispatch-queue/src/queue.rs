//! Push-mode bounded FIFO queue.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};

use work_dispatch_core::history::DispatchHistory;
use work_dispatch_core::{
    EnqueueOutcome, EventListeners, RejectReason, WorkError, WorkItem,
};

use crate::config::QueueConfig;
use crate::events::QueueEvent;

/// Point-in-time view of queue state, served to the autoscaler and to
/// diagnostics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueueSample {
    /// Items currently buffered.
    pub len: usize,
    /// Estimated dispatches per second, `None` while unknown.
    pub throughput: Option<f64>,
    /// Items admitted since the queue started.
    pub enqueued_total: u64,
    /// Items handed to workers since the queue started.
    pub dispatched_total: u64,
    /// Items refused at admission since the queue started.
    pub rejected_total: u64,
    /// Whether the queue has begun shutting down.
    pub shutting_down: bool,
}

pub(crate) enum QueueMsg<Req, Res> {
    Enqueue {
        item: WorkItem<Req, Res>,
        outcome: oneshot::Sender<EnqueueOutcome>,
    },
    Next {
        reply: oneshot::Sender<Option<WorkItem<Req, Res>>>,
    },
    Sample {
        reply: oneshot::Sender<QueueSample>,
    },
    Shutdown {
        drain_timeout: Duration,
        done: oneshot::Sender<()>,
    },
}

/// Cloneable handle to a queue task (push or pull mode).
pub struct QueueHandle<Req, Res> {
    pub(crate) tx: mpsc::UnboundedSender<QueueMsg<Req, Res>>,
}

impl<Req, Res> Clone for QueueHandle<Req, Res> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<Req, Res> QueueHandle<Req, Res> {
    /// Submits an item and awaits the synchronous admission outcome.
    ///
    /// A queue that has already terminated answers `Rejected(ShuttingDown)`.
    pub async fn enqueue(&self, item: WorkItem<Req, Res>) -> EnqueueOutcome {
        let (tx, rx) = oneshot::channel();
        if self
            .tx
            .send(QueueMsg::Enqueue { item, outcome: tx })
            .is_err()
        {
            return EnqueueOutcome::Rejected(RejectReason::ShuttingDown);
        }
        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => EnqueueOutcome::Rejected(RejectReason::ShuttingDown),
        }
    }

    /// Requests the next item. The returned receiver parks until an item is
    /// available, yields `None` once the queue is shutting down and empty,
    /// and errors when the queue task is gone.
    pub fn request_next(&self) -> oneshot::Receiver<Option<WorkItem<Req, Res>>> {
        let (tx, rx) = oneshot::channel();
        // A failed send leaves `tx` dropped, so the receiver reports the
        // queue as lost.
        let _ = self.tx.send(QueueMsg::Next { reply: tx });
        rx
    }

    /// Reads a state sample; `None` means the queue task is gone.
    pub async fn sample(&self) -> Option<QueueSample> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(QueueMsg::Sample { reply: tx }).ok()?;
        rx.await.ok()
    }

    /// Begins shutdown: further enqueues are rejected, dispatch continues
    /// until the buffer empties or `drain_timeout` elapses. The returned
    /// receiver fires once when the queue has fully terminated.
    pub fn shutdown(&self, drain_timeout: Duration) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let _ = self.tx.send(QueueMsg::Shutdown {
            drain_timeout,
            done: tx,
        });
        rx
    }
}

/// Push-mode queue task.
pub struct BufferedQueue<Req, Res> {
    rx: mpsc::UnboundedReceiver<QueueMsg<Req, Res>>,
    buffer: VecDeque<WorkItem<Req, Res>>,
    waiters: VecDeque<oneshot::Sender<Option<WorkItem<Req, Res>>>>,
    history: DispatchHistory,
    config: QueueConfig,
    events: EventListeners<QueueEvent>,
    enqueued_total: u64,
    dispatched_total: u64,
    rejected_total: u64,
    shutting_down: bool,
    drain_deadline: Option<Instant>,
    done_txs: Vec<oneshot::Sender<()>>,
}

impl<Req, Res> BufferedQueue<Req, Res>
where
    Req: Send + 'static,
    Res: Send + 'static,
{
    /// Spawns the queue task and returns its handle.
    pub fn spawn(config: QueueConfig, events: EventListeners<QueueEvent>) -> QueueHandle<Req, Res> {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Self {
            rx,
            buffer: VecDeque::new(),
            waiters: VecDeque::new(),
            history: DispatchHistory::new(config.history_window),
            config,
            events,
            enqueued_total: 0,
            dispatched_total: 0,
            rejected_total: 0,
            shutting_down: false,
            drain_deadline: None,
            done_txs: Vec::new(),
        };
        tokio::spawn(queue.run());
        QueueHandle { tx }
    }

    async fn run(mut self) {
        loop {
            if self.shutting_down {
                if self.buffer.is_empty() {
                    break;
                }
                let deadline = self
                    .drain_deadline
                    .expect("drain deadline set on shutdown");
                tokio::select! {
                    msg = self.rx.recv() => match msg {
                        Some(msg) => self.handle(msg),
                        None => break,
                    },
                    _ = tokio::time::sleep_until(deadline.into()) => break,
                }
            } else {
                match self.rx.recv().await {
                    Some(msg) => self.handle(msg),
                    // Every handle dropped without a shutdown: nothing left
                    // to serve or notify.
                    None => break,
                }
            }
        }
        self.finish();
    }

    fn handle(&mut self, msg: QueueMsg<Req, Res>) {
        match msg {
            QueueMsg::Enqueue { item, outcome } => {
                let decision = self.admit(&item);
                let _ = outcome.send(decision);
                match decision {
                    EnqueueOutcome::Enqueued => self.accept(item),
                    EnqueueOutcome::Rejected(reason) => self.reject(item, reason),
                }
            }
            QueueMsg::Next { reply } => self.serve_next(reply),
            QueueMsg::Sample { reply } => {
                let sample = self.sample();
                let _ = reply.send(sample);
            }
            QueueMsg::Shutdown {
                drain_timeout,
                done,
            } => {
                if !self.shutting_down {
                    self.shutting_down = true;
                    self.drain_deadline = Some(Instant::now() + drain_timeout);
                    #[cfg(feature = "tracing")]
                    tracing::debug!(
                        dispatcher = %self.config.name,
                        buffered = self.buffer.len(),
                        "queue draining"
                    );
                }
                self.done_txs.push(done);
                // Parked workers see None right away so drain-mode workers
                // on an already-empty queue retire immediately.
                if self.buffer.is_empty() {
                    self.flush_waiters();
                }
            }
        }
    }

    fn admit(&mut self, item: &WorkItem<Req, Res>) -> EnqueueOutcome {
        if self.shutting_down {
            return EnqueueOutcome::Rejected(RejectReason::ShuttingDown);
        }
        let backpressure = match &self.config.backpressure {
            Some(bp) => bp,
            None => return EnqueueOutcome::Enqueued,
        };
        let now = Instant::now();
        if item.expired(now) {
            return EnqueueOutcome::Rejected(RejectReason::Expired);
        }
        if self.buffer.len() >= backpressure.max_buffer_size {
            return EnqueueOutcome::Rejected(RejectReason::OverCapacity);
        }
        if let Some(throughput) = self.history.throughput(now) {
            let expected_wait = self.buffer.len() as f64 / throughput;
            if expected_wait > backpressure.threshold_for_expected_wait_time.as_secs_f64() {
                return EnqueueOutcome::Rejected(RejectReason::OverCapacity);
            }
        }
        EnqueueOutcome::Enqueued
    }

    fn accept(&mut self, item: WorkItem<Req, Res>) {
        self.enqueued_total += 1;

        // Hand straight to a parked worker when one is waiting; that counts
        // as a dispatch, not a buffering.
        let mut item = Some(item);
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.send(Some(item.take().expect("item present"))) {
                Ok(()) => {
                    self.record_dispatch();
                    break;
                }
                Err(returned) => {
                    // Worker retired while parked; try the next one.
                    item = returned;
                }
            }
        }
        if let Some(item) = item {
            self.buffer.push_back(item);
        }

        self.events.emit(&QueueEvent::Enqueued {
            dispatcher: self.config.name.clone(),
            timestamp: Instant::now(),
            depth: self.buffer.len(),
        });
        #[cfg(feature = "metrics")]
        {
            metrics::counter!("workdispatch_enqueued_total", "dispatcher" => self.config.name.clone())
                .increment(1);
            metrics::gauge!("workdispatch_queue_depth", "dispatcher" => self.config.name.clone())
                .set(self.buffer.len() as f64);
        }
    }

    fn reject(&mut self, mut item: WorkItem<Req, Res>, reason: RejectReason) {
        self.rejected_total += 1;
        // The outcome already went to the submitter; the item itself is dead.
        item.reply_to = None;
        self.events.emit(&QueueEvent::EnqueueRejected {
            dispatcher: self.config.name.clone(),
            timestamp: Instant::now(),
            reason,
        });
        #[cfg(feature = "metrics")]
        metrics::counter!(
            "workdispatch_rejected_total",
            "dispatcher" => self.config.name.clone(),
            "reason" => match reason {
                RejectReason::OverCapacity => "over_capacity",
                RejectReason::Expired => "expired",
                RejectReason::ShuttingDown => "shutting_down",
            }
        )
        .increment(1);
    }

    fn serve_next(&mut self, reply: oneshot::Sender<Option<WorkItem<Req, Res>>>) {
        match self.pop_live() {
            Some(item) => match reply.send(Some(item)) {
                Ok(()) => self.record_dispatch(),
                Err(returned) => {
                    // Requester died between asking and receiving; the item
                    // goes back to the head so FIFO order survives.
                    if let Some(item) = returned {
                        self.buffer.push_front(item);
                    }
                }
            },
            None => {
                if self.shutting_down {
                    let _ = reply.send(None);
                } else {
                    self.waiters.push_back(reply);
                }
            }
        }
    }

    /// Pops the first item whose deadline has not elapsed, dropping expired
    /// heads with a timeout envelope. Survivor order is untouched.
    fn pop_live(&mut self) -> Option<WorkItem<Req, Res>> {
        let now = Instant::now();
        while let Some(mut item) = self.buffer.pop_front() {
            if item.expired(now) {
                item.reply(Err(WorkError::Timeout));
                self.events.emit(&QueueEvent::ItemExpired {
                    dispatcher: self.config.name.clone(),
                    timestamp: now,
                    waited: now.duration_since(item.enqueued_at),
                });
                #[cfg(feature = "metrics")]
                metrics::counter!("workdispatch_expired_total", "dispatcher" => self.config.name.clone())
                    .increment(1);
                continue;
            }
            return Some(item);
        }
        None
    }

    fn record_dispatch(&mut self) {
        self.dispatched_total += 1;
        self.history.record(Instant::now());
    }

    fn sample(&mut self) -> QueueSample {
        QueueSample {
            len: self.buffer.len(),
            throughput: self.history.throughput(Instant::now()),
            enqueued_total: self.enqueued_total,
            dispatched_total: self.dispatched_total,
            rejected_total: self.rejected_total,
            shutting_down: self.shutting_down,
        }
    }

    fn flush_waiters(&mut self) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(None);
        }
    }

    fn finish(mut self) {
        for mut item in self.buffer.drain(..) {
            item.reply(Err(WorkError::Abandoned));
        }
        self.flush_waiters();
        #[cfg(feature = "tracing")]
        tracing::debug!(dispatcher = %self.config.name, "queue terminated");
        for done in self.done_txs.drain(..) {
            let _ = done.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackpressureSettings;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use work_dispatch_core::FnListener;

    fn item(n: u32) -> WorkItem<u32, u32> {
        WorkItem::new(n, None, 0, Duration::from_secs(60))
    }

    fn bounded_config(max: usize) -> QueueConfig {
        QueueConfig {
            backpressure: Some(BackpressureSettings {
                max_buffer_size: max,
                threshold_for_expected_wait_time: Duration::from_secs(300),
            }),
            ..QueueConfig::default()
        }
    }

    #[tokio::test]
    async fn admits_until_buffer_cap() {
        let queue = BufferedQueue::spawn(bounded_config(2), EventListeners::new());
        assert_eq!(queue.enqueue(item(1)).await, EnqueueOutcome::Enqueued);
        assert_eq!(queue.enqueue(item(2)).await, EnqueueOutcome::Enqueued);
        assert_eq!(
            queue.enqueue(item(3)).await,
            EnqueueOutcome::Rejected(RejectReason::OverCapacity)
        );
        let sample = queue.sample().await.unwrap();
        assert_eq!(sample.len, 2);
        assert_eq!(sample.enqueued_total, 2);
        assert_eq!(sample.rejected_total, 1);
    }

    #[tokio::test]
    async fn serves_fifo() {
        let queue = BufferedQueue::spawn(QueueConfig::default(), EventListeners::new());
        for n in 1..=3 {
            queue.enqueue(item(n)).await;
        }
        for n in 1..=3 {
            let got = queue.request_next().await.unwrap().unwrap();
            assert_eq!(got.payload, n);
        }
    }

    #[tokio::test]
    async fn parked_worker_gets_the_next_item() {
        let queue = BufferedQueue::spawn(QueueConfig::default(), EventListeners::new());
        let pending = queue.request_next();
        queue.enqueue(item(42)).await;
        let got = pending.await.unwrap().unwrap();
        assert_eq!(got.payload, 42);
        // Direct hand-off counts as a dispatch, not a buffering.
        let sample = queue.sample().await.unwrap();
        assert_eq!(sample.len, 0);
        assert_eq!(sample.dispatched_total, 1);
    }

    #[tokio::test]
    async fn expired_heads_are_dropped_not_served() {
        let queue: QueueHandle<u32, u32> =
            BufferedQueue::spawn(QueueConfig::default(), EventListeners::new());
        let expired = WorkItem::new(1, None, 0, Duration::ZERO);
        queue.enqueue(expired).await;
        queue.enqueue(item(2)).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let got = queue.request_next().await.unwrap().unwrap();
        assert_eq!(got.payload, 2);
    }

    #[tokio::test]
    async fn already_expired_item_is_rejected_under_backpressure() {
        let queue: QueueHandle<u32, u32> =
            BufferedQueue::spawn(bounded_config(10), EventListeners::new());
        let expired = WorkItem::new(1, None, 0, Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(
            queue.enqueue(expired).await,
            EnqueueOutcome::Rejected(RejectReason::Expired)
        );
    }

    #[tokio::test]
    async fn a_faulty_listener_does_not_disturb_admission() {
        let admissions = Arc::new(AtomicUsize::new(0));
        let mut events = EventListeners::new();
        // First sink dies on every admission; the one behind it and the
        // queue itself must not notice.
        events.add(FnListener::new(|event: &QueueEvent| {
            if matches!(event, QueueEvent::Enqueued { .. }) {
                panic!("sink offline");
            }
        }));
        let admissions_clone = Arc::clone(&admissions);
        events.add(FnListener::new(move |event: &QueueEvent| {
            if matches!(event, QueueEvent::Enqueued { .. }) {
                admissions_clone.fetch_add(1, Ordering::SeqCst);
            }
        }));

        let queue = BufferedQueue::spawn(QueueConfig::default(), events);
        for n in 0..3 {
            assert_eq!(queue.enqueue(item(n)).await, EnqueueOutcome::Enqueued);
        }
        assert_eq!(admissions.load(Ordering::SeqCst), 3);
        assert_eq!(queue.sample().await.unwrap().len, 3);
    }

    #[tokio::test]
    async fn shutdown_rejects_then_drains() {
        let queue = BufferedQueue::spawn(QueueConfig::default(), EventListeners::new());
        queue.enqueue(item(1)).await;
        queue.enqueue(item(2)).await;

        let done = queue.shutdown(Duration::from_secs(1));
        assert_eq!(
            queue.enqueue(item(3)).await,
            EnqueueOutcome::Rejected(RejectReason::ShuttingDown)
        );

        // Drain continues while the buffer is non-empty.
        assert_eq!(queue.request_next().await.unwrap().unwrap().payload, 1);
        assert_eq!(queue.request_next().await.unwrap().unwrap().payload, 2);
        assert!(queue.request_next().await.unwrap().is_none());
        done.await.unwrap();
    }

    #[tokio::test]
    async fn drain_timeout_abandons_leftovers() {
        let queue: QueueHandle<u32, u32> =
            BufferedQueue::spawn(QueueConfig::default(), EventListeners::new());
        let (tx, rx) = tokio::sync::oneshot::channel();
        let abandoned = WorkItem::new(
            7,
            Some(work_dispatch_core::ReplyTo::Once(tx)),
            0,
            Duration::from_secs(60),
        );
        queue.enqueue(abandoned).await;

        let done = queue.shutdown(Duration::from_millis(20));
        done.await.unwrap();
        assert_eq!(rx.await.unwrap(), Err(WorkError::Abandoned));
    }
}
