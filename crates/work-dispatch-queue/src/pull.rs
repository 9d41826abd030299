//! Pull-mode queue backed by a lazy item source.

use std::collections::VecDeque;
use std::pin::Pin;
use std::time::{Duration, Instant};

use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};

use work_dispatch_core::{
    EnqueueOutcome, EventListeners, RejectReason, ReplyTo, WorkError, WorkItem, WorkReply,
};

use crate::events::QueueEvent;
use crate::queue::{QueueHandle, QueueMsg, QueueSample};

/// Pull-mode queue task.
///
/// Workers use the same protocol as with [`crate::BufferedQueue`], but items
/// are drawn on demand from a caller-supplied stream and wrapped with a fresh
/// deadline at the moment of dispatch. Producer-facing `enqueue` does not
/// exist in this mode; a message arriving anyway is a programming error and
/// is rejected.
pub struct PullQueue<Req, Res> {
    rx: mpsc::UnboundedReceiver<QueueMsg<Req, Res>>,
    source: Pin<Box<dyn Stream<Item = Req> + Send>>,
    /// Items already drawn from the source whose original requester vanished.
    strays: VecDeque<WorkItem<Req, Res>>,
    waiters: VecDeque<oneshot::Sender<Option<WorkItem<Req, Res>>>>,
    results: Option<mpsc::UnboundedSender<WorkReply<Res>>>,
    completion: Option<oneshot::Sender<()>>,
    events: EventListeners<QueueEvent>,
    name: String,
    work_timeout: Duration,
    work_retry: u32,
    dispatched_total: u64,
    exhausted: bool,
    shutting_down: bool,
    done_txs: Vec<oneshot::Sender<()>>,
}

impl<Req, Res> PullQueue<Req, Res>
where
    Req: Send + 'static,
    Res: Send + 'static,
{
    /// Spawns the pull queue over `source`. Returns the worker-facing handle
    /// and a receiver that fires once when the source is exhausted.
    pub fn spawn(
        source: impl Stream<Item = Req> + Send + 'static,
        work_timeout: Duration,
        work_retry: u32,
        results: Option<mpsc::UnboundedSender<WorkReply<Res>>>,
        name: String,
        events: EventListeners<QueueEvent>,
    ) -> (QueueHandle<Req, Res>, oneshot::Receiver<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = oneshot::channel();
        let queue = Self {
            rx,
            source: Box::pin(source),
            strays: VecDeque::new(),
            waiters: VecDeque::new(),
            results,
            completion: Some(completion_tx),
            events,
            name,
            work_timeout,
            work_retry,
            dispatched_total: 0,
            exhausted: false,
            shutting_down: false,
            done_txs: Vec::new(),
        };
        tokio::spawn(queue.run());
        (QueueHandle { tx }, completion_rx)
    }

    async fn run(mut self) {
        loop {
            if self.shutting_down && self.strays.is_empty() {
                break;
            }
            let want_pull = !self.waiters.is_empty() && !self.exhausted && !self.shutting_down;
            tokio::select! {
                msg = self.rx.recv() => match msg {
                    Some(msg) => self.handle(msg),
                    None => break,
                },
                payload = self.source.next(), if want_pull => match payload {
                    Some(payload) => self.hand_out(payload),
                    None => self.mark_exhausted(),
                },
            }
        }
        self.finish();
    }

    fn handle(&mut self, msg: QueueMsg<Req, Res>) {
        match msg {
            QueueMsg::Enqueue { item, outcome } => {
                debug_assert!(false, "enqueue on a pull-mode queue");
                #[cfg(feature = "tracing")]
                tracing::error!(dispatcher = %self.name, "enqueue sent to a pull-mode queue");
                drop(item);
                let _ = outcome.send(EnqueueOutcome::Rejected(RejectReason::ShuttingDown));
            }
            QueueMsg::Next { reply } => {
                if let Some(item) = self.strays.pop_front() {
                    if reply.send(Some(item)).is_ok() {
                        self.dispatched_total += 1;
                    }
                } else if self.exhausted || self.shutting_down {
                    let _ = reply.send(None);
                } else {
                    self.waiters.push_back(reply);
                }
            }
            QueueMsg::Sample { reply } => {
                let _ = reply.send(QueueSample {
                    len: self.strays.len(),
                    throughput: None,
                    enqueued_total: self.dispatched_total,
                    dispatched_total: self.dispatched_total,
                    rejected_total: 0,
                    shutting_down: self.shutting_down || self.exhausted,
                });
            }
            QueueMsg::Shutdown { done, .. } => {
                self.shutting_down = true;
                self.done_txs.push(done);
                self.flush_waiters();
            }
        }
    }

    fn hand_out(&mut self, payload: Req) {
        let reply_to = self.results.clone().map(ReplyTo::Shared);
        let item = WorkItem::new(payload, reply_to, self.work_retry, self.work_timeout);
        let mut item = Some(item);
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.send(Some(item.take().expect("item present"))) {
                Ok(()) => {
                    self.dispatched_total += 1;
                    self.events.emit(&QueueEvent::Enqueued {
                        dispatcher: self.name.clone(),
                        timestamp: Instant::now(),
                        depth: self.strays.len(),
                    });
                    return;
                }
                Err(returned) => item = returned,
            }
        }
        // Every waiter died between the pull and the hand-off; keep the item
        // for the next request.
        self.strays.push_back(item.take().expect("item present"));
    }

    fn mark_exhausted(&mut self) {
        self.exhausted = true;
        self.flush_waiters();
        if let Some(completion) = self.completion.take() {
            let _ = completion.send(());
        }
        #[cfg(feature = "tracing")]
        tracing::debug!(dispatcher = %self.name, "pull source exhausted");
    }

    fn flush_waiters(&mut self) {
        // Strays are still served through Next; only empty-handed waiters
        // are released.
        if self.strays.is_empty() {
            for waiter in self.waiters.drain(..) {
                let _ = waiter.send(None);
            }
        }
    }

    fn finish(mut self) {
        for mut item in self.strays.drain(..) {
            item.reply(Err(WorkError::Abandoned));
        }
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(None);
        }
        for done in self.done_txs.drain(..) {
            let _ = done.send(());
        }
    }
}
