//! Work items and reply plumbing.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use pin_project_lite::pin_project;
use tokio::sync::{mpsc, oneshot};

use crate::error::{RejectReason, WorkError};

/// The final outcome delivered for a work item.
pub type WorkReply<Res> = Result<Res, WorkError>;

/// Outcome of attempting to admit a work item into the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// The item was admitted and will eventually reach a final outcome.
    Enqueued,
    /// The item was refused; it never entered the queue.
    Rejected(RejectReason),
}

/// Where a work item's final outcome is delivered.
///
/// Push-mode items carry a per-item oneshot; pull-mode items share a single
/// results channel. Exactly one reply is sent per item either way.
#[derive(Debug)]
pub enum ReplyTo<Res> {
    /// A per-item channel; the paired [`WorkTicket`] resolves on send.
    Once(oneshot::Sender<WorkReply<Res>>),
    /// A shared results channel (pull mode's `send_results_to`).
    Shared(mpsc::UnboundedSender<WorkReply<Res>>),
}

impl<Res> ReplyTo<Res> {
    /// Delivers the final outcome. A vanished recipient is not an error.
    pub fn send(self, reply: WorkReply<Res>) {
        match self {
            ReplyTo::Once(tx) => {
                let _ = tx.send(reply);
            }
            ReplyTo::Shared(tx) => {
                let _ = tx.send(reply);
            }
        }
    }
}

/// A unit of work travelling through the engine.
///
/// Created by a dispatcher on accept, destroyed on its final outcome:
/// success, exhausted retries, expiry, or abandonment.
#[derive(Debug)]
pub struct WorkItem<Req, Res> {
    /// Opaque payload handed to the backend.
    pub payload: Req,
    /// Optional recipient for the final outcome.
    pub reply_to: Option<ReplyTo<Res>>,
    /// How many re-dispatches remain permitted for this item.
    pub retry_budget: u32,
    /// Zero-based attempt counter, incremented on retry.
    pub attempt: u32,
    /// Absolute deadline; no backend call for this item starts or is
    /// retried past it.
    pub deadline: Instant,
    /// When the item was admitted.
    pub enqueued_at: Instant,
}

impl<Req, Res> WorkItem<Req, Res> {
    /// Creates an item whose deadline is `timeout` from now.
    pub fn new(payload: Req, reply_to: Option<ReplyTo<Res>>, retry_budget: u32, timeout: Duration) -> Self {
        let now = Instant::now();
        Self {
            payload,
            reply_to,
            retry_budget,
            attempt: 0,
            deadline: now + timeout,
            enqueued_at: now,
        }
    }

    /// Whether the deadline has passed as of `now`.
    pub fn expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    /// Time left until the deadline, zero once passed.
    pub fn remaining(&self, now: Instant) -> Duration {
        self.deadline.saturating_duration_since(now)
    }

    /// Delivers the final outcome, consuming the reply channel. Subsequent
    /// calls are no-ops, which keeps the one-reply-per-item invariant local.
    pub fn reply(&mut self, reply: WorkReply<Res>) {
        if let Some(reply_to) = self.reply_to.take() {
            reply_to.send(reply);
        }
    }
}

pin_project! {
    /// Producer-side handle to a submitted work item's eventual outcome.
    ///
    /// Resolves to the backend reply on success or a [`WorkError`] envelope
    /// otherwise. If the engine terminates without delivering an outcome the
    /// ticket resolves to [`WorkError::Abandoned`].
    #[must_use = "a WorkTicket does nothing unless awaited"]
    #[derive(Debug)]
    pub struct WorkTicket<Res> {
        #[pin]
        rx: oneshot::Receiver<WorkReply<Res>>,
    }
}

impl<Res> WorkTicket<Res> {
    /// Creates a ticket and the sender half a dispatcher attaches to the
    /// item as [`ReplyTo::Once`].
    pub fn channel() -> (oneshot::Sender<WorkReply<Res>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }
}

impl<Res> Future for WorkTicket<Res> {
    type Output = WorkReply<Res>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project().rx.poll(cx) {
            Poll::Ready(Ok(reply)) => Poll::Ready(reply),
            Poll::Ready(Err(_)) => Poll::Ready(Err(WorkError::Abandoned)),
            Poll::Pending => Poll::Pending,
        }
    }
}
