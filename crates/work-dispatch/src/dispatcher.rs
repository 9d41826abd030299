//! Push-mode dispatcher and shared engine lifecycle.

use std::fmt;
use std::marker::PhantomData;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tower::Service;

use work_dispatch_autoscale::{AutoscalePolicy, Autoscaler};
use work_dispatch_core::{
    default_classifier, EnqueueOutcome, EventListeners, FnListener, ReplyTo,
    SharedReplyClassifier, Verdict, WorkItem, WorkRejected, WorkTicket,
};
use work_dispatch_pool::{PoolEvent, PoolHandle, PoolSample, Processor};
use work_dispatch_queue::{BufferedQueue, QueueEvent, QueueHandle, QueueSample};

use crate::config::{ConfigError, DispatchSettings};

/// Slack added on top of a caller-supplied drain timeout before the
/// supervisor stops waiting on children.
pub(crate) const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

pub(crate) enum DispatcherCmd {
    Shutdown {
        timeout: Duration,
        done: oneshot::Sender<()>,
    },
}

/// Shuts the engine down: queue stops admitting and drains, the pool retires
/// its workers in drain mode, both bounded by `timeout`.
pub(crate) async fn shutdown_engine<Req, Res>(
    queue: &QueueHandle<Req, Res>,
    pool: &PoolHandle,
    timeout: Duration,
) {
    let queue_done = queue.shutdown(timeout);
    let pool_done = pool.shutdown(true, timeout);
    // Children enforce the timeout themselves; the extra grace only covers
    // scheduling slack.
    let _ = tokio::time::timeout(timeout + SHUTDOWN_GRACE, pool_done).await;
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, queue_done).await;
}

/// Supervisor task shared by both dispatcher variants.
///
/// Termination paths: an explicit shutdown command, every dispatcher handle
/// dropped, the pull source exhausted (`exhausted` resolves), or the
/// processor terminating on its own, in which case the rest of the engine is
/// torn down after it.
pub(crate) async fn supervise<Req, Res>(
    mut cmd_rx: mpsc::UnboundedReceiver<DispatcherCmd>,
    queue: QueueHandle<Req, Res>,
    pool: PoolHandle,
    mut pool_join: JoinHandle<()>,
    shutdown_timeout: Duration,
    exhausted: Option<oneshot::Receiver<()>>,
    terminated: Option<oneshot::Sender<()>>,
) {
    let exhausted_fut = async move {
        match exhausted {
            Some(rx) => {
                let _ = rx.await;
            }
            None => futures::future::pending().await,
        }
    };
    tokio::pin!(exhausted_fut);

    tokio::select! {
        cmd = cmd_rx.recv() => match cmd {
            Some(DispatcherCmd::Shutdown { timeout, done }) => {
                shutdown_engine(&queue, &pool, timeout).await;
                let _ = done.send(());
            }
            // Every handle dropped: the engine unwinds on its own.
            None => shutdown_engine(&queue, &pool, shutdown_timeout).await,
        },
        _ = &mut exhausted_fut => {
            shutdown_engine(&queue, &pool, shutdown_timeout).await;
        }
        _ = &mut pool_join => {
            // Processor gone (queue lost or crash): the dispatcher follows.
            let _ = queue.shutdown(Duration::ZERO);
        }
    }
    if let Some(terminated) = terminated {
        let _ = terminated.send(());
    }
}

/// Push-mode dispatcher: producers submit items and receive a ticket for
/// the eventual backend reply.
pub struct PushDispatcher<Req, Res> {
    queue: QueueHandle<Req, Res>,
    pool: PoolHandle,
    cmd: mpsc::UnboundedSender<DispatcherCmd>,
    work_timeout: Duration,
    work_retry: u32,
}

impl<Req, Res> Clone for PushDispatcher<Req, Res> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            pool: self.pool.clone(),
            cmd: self.cmd.clone(),
            work_timeout: self.work_timeout,
            work_retry: self.work_retry,
        }
    }
}

impl<Req, Res> PushDispatcher<Req, Res> {
    /// Starts building a push dispatcher around a backend service.
    pub fn builder<S>(backend: S) -> PushDispatcherBuilder<Req, S>
    where
        S: Service<Req, Response = Res>,
    {
        PushDispatcherBuilder::new(backend)
    }

    /// Submits a work item.
    ///
    /// The admission outcome is synchronous: `Ok` carries a ticket resolving
    /// to the eventual backend reply, `Err` is the producer-facing rejection
    /// (`"Server is at capacity"`, `"Shutting down"`). No interim
    /// acknowledgement is ever sent for admitted items.
    pub async fn submit(&self, payload: Req) -> Result<WorkTicket<Res>, WorkRejected> {
        let (reply_tx, ticket) = WorkTicket::channel();
        let item = WorkItem::new(
            payload,
            Some(ReplyTo::Once(reply_tx)),
            self.work_retry,
            self.work_timeout,
        );
        match self.queue.enqueue(item).await {
            EnqueueOutcome::Enqueued => Ok(ticket),
            EnqueueOutcome::Rejected(reason) => Err(WorkRejected(reason)),
        }
    }

    /// Drains and terminates the engine, bounded by `timeout`. Resolves once
    /// the engine has fully terminated; in-flight work past the bound is
    /// abandoned.
    pub async fn shutdown_gracefully(&self, timeout: Duration) {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .cmd
            .send(DispatcherCmd::Shutdown {
                timeout,
                done: done_tx,
            })
            .is_err()
        {
            return;
        }
        let _ = done_rx.await;
    }

    /// Reads a queue state sample; `None` once the engine is gone.
    pub async fn queue_sample(&self) -> Option<QueueSample> {
        self.queue.sample().await
    }

    /// Reads a pool state sample; `None` once the engine is gone.
    pub async fn pool_sample(&self) -> Option<PoolSample> {
        self.pool.sample().await
    }
}

/// Builder for [`PushDispatcher`].
pub struct PushDispatcherBuilder<Req, S>
where
    S: Service<Req>,
{
    backend: S,
    settings: DispatchSettings,
    classifier: Option<SharedReplyClassifier<S::Response, S::Error>>,
    queue_events: EventListeners<QueueEvent>,
    pool_events: EventListeners<PoolEvent>,
    _req: PhantomData<fn(Req)>,
}

impl<Req, S> PushDispatcherBuilder<Req, S>
where
    S: Service<Req>,
{
    /// Creates a builder with default settings.
    pub fn new(backend: S) -> Self {
        Self {
            backend,
            settings: DispatchSettings::default(),
            classifier: None,
            queue_events: EventListeners::new(),
            pool_events: EventListeners::new(),
            _req: PhantomData,
        }
    }

    /// Replaces the settings record.
    pub fn settings(mut self, settings: DispatchSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Sets a custom reply classifier.
    ///
    /// Default: `Ok` is a success, `Err` is a retryable failure.
    pub fn classifier<F>(mut self, classifier: F) -> Self
    where
        F: Fn(Result<S::Response, S::Error>) -> Verdict<S::Response> + Send + Sync + 'static,
    {
        self.classifier = Some(std::sync::Arc::new(classifier));
        self
    }

    /// Registers a callback for queue events.
    pub fn on_queue_event<F>(mut self, f: F) -> Self
    where
        F: Fn(&QueueEvent) + Send + Sync + 'static,
    {
        self.queue_events.add(FnListener::new(f));
        self
    }

    /// Registers a callback for pool, worker, and breaker events.
    pub fn on_pool_event<F>(mut self, f: F) -> Self
    where
        F: Fn(&PoolEvent) + Send + Sync + 'static,
    {
        self.pool_events.add(FnListener::new(f));
        self
    }

    /// Validates the settings and spawns the engine.
    pub fn build(self) -> Result<PushDispatcher<Req, S::Response>, ConfigError>
    where
        Req: Clone + Send + 'static,
        S: Clone + Send + 'static,
        S::Response: Send + 'static,
        S::Error: fmt::Display + Send + 'static,
        S::Future: Send,
    {
        self.settings.validate()?;

        let queue = BufferedQueue::spawn(self.settings.queue_config(), self.queue_events);
        let classifier = self.classifier.unwrap_or_else(default_classifier);
        let (pool, pool_join) = Processor::spawn(
            self.settings.pool_config(),
            queue.clone(),
            self.backend,
            classifier,
            self.pool_events,
        );
        if let Some(autoscale) = self.settings.autoscale_settings() {
            Autoscaler::spawn(queue.clone(), pool.clone(), AutoscalePolicy::new(autoscale));
        }

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(supervise(
            cmd_rx,
            queue.clone(),
            pool.clone(),
            pool_join,
            self.settings.shutdown_timeout,
            None,
            None,
        ));

        Ok(PushDispatcher {
            queue,
            pool,
            cmd: cmd_tx,
            work_timeout: self.settings.work_timeout,
            work_retry: self.settings.work_retry,
        })
    }
}
