//! Pull-mode dispatcher.

use std::fmt;
use std::marker::PhantomData;
use std::time::Duration;

use futures::Stream;
use tokio::sync::{mpsc, oneshot};
use tower::Service;

use work_dispatch_autoscale::{AutoscalePolicy, Autoscaler};
use work_dispatch_core::{
    default_classifier, EventListeners, FnListener, SharedReplyClassifier, Verdict, WorkReply,
};
use work_dispatch_pool::{PoolEvent, PoolHandle, PoolSample, Processor};
use work_dispatch_queue::{PullQueue, QueueEvent};

use crate::config::{ConfigError, DispatchSettings};
use crate::dispatcher::{supervise, DispatcherCmd};

/// Pull-mode dispatcher: items are drawn on demand from a lazy source, and
/// there is no producer surface. Exhausting the source triggers a graceful
/// shutdown bounded by the configured `shutdown_timeout`.
pub struct PullDispatcher {
    cmd: mpsc::UnboundedSender<DispatcherCmd>,
    terminated: oneshot::Receiver<()>,
    pool: PoolHandle,
}

impl PullDispatcher {
    /// Starts building a pull dispatcher around a backend service and an
    /// item source.
    pub fn builder<Req, S, St>(backend: S, source: St) -> PullDispatcherBuilder<Req, S, St>
    where
        S: Service<Req>,
        St: Stream<Item = Req>,
    {
        PullDispatcherBuilder::new(backend, source)
    }

    /// Resolves once the engine has fully terminated: source exhausted and
    /// drained, or an explicit shutdown completed.
    pub async fn completed(self) {
        let _ = self.terminated.await;
    }

    /// Drains and terminates the engine before the source is exhausted.
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

    /// Reads a pool state sample; `None` once the engine is gone.
    pub async fn pool_sample(&self) -> Option<PoolSample> {
        self.pool.sample().await
    }
}

/// Builder for [`PullDispatcher`].
pub struct PullDispatcherBuilder<Req, S, St>
where
    S: Service<Req>,
{
    backend: S,
    source: St,
    settings: DispatchSettings,
    classifier: Option<SharedReplyClassifier<S::Response, S::Error>>,
    results: Option<mpsc::UnboundedSender<WorkReply<S::Response>>>,
    queue_events: EventListeners<QueueEvent>,
    pool_events: EventListeners<PoolEvent>,
    _req: PhantomData<fn(Req)>,
}

impl<Req, S, St> PullDispatcherBuilder<Req, S, St>
where
    S: Service<Req>,
    St: Stream<Item = Req>,
{
    /// Creates a builder with default settings.
    pub fn new(backend: S, source: St) -> Self {
        Self {
            backend,
            source,
            settings: DispatchSettings::default(),
            classifier: None,
            results: None,
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

    /// Delivers every item's final outcome to this channel. Without it,
    /// outcomes are only visible through events and metrics.
    pub fn send_results_to(mut self, results: mpsc::UnboundedSender<WorkReply<S::Response>>) -> Self {
        self.results = Some(results);
        self
    }

    /// Sets a custom reply classifier.
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
    pub fn build(self) -> Result<PullDispatcher, ConfigError>
    where
        Req: Clone + Send + 'static,
        S: Clone + Send + 'static,
        S::Response: Send + 'static,
        S::Error: fmt::Display + Send + 'static,
        S::Future: Send,
        St: Send + 'static,
    {
        self.settings.validate()?;

        let (queue, exhausted) = PullQueue::spawn(
            self.source,
            self.settings.work_timeout,
            self.settings.work_retry,
            self.results,
            self.settings.name.clone(),
            self.queue_events,
        );
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
        let (terminated_tx, terminated_rx) = oneshot::channel();
        tokio::spawn(supervise(
            cmd_rx,
            queue,
            pool.clone(),
            pool_join,
            self.settings.shutdown_timeout,
            Some(exhausted),
            Some(terminated_tx),
        ));

        Ok(PullDispatcher {
            cmd: cmd_tx,
            terminated: terminated_rx,
            pool,
        })
    }
}
